//! The wire format of the seven protocol messages.
//!
//! Every message is a single tag byte followed by fixed-width fields:
//! integers big-endian, scalars 32 bytes, compressed points 33 bytes,
//! signatures 64 bytes, scripts length-prefixed. Weight announcements,
//! proofs, nonce commitments, withdrawal batches and partial signatures
//! travel on the replicated on-chain channel; secret shares travel on the
//! private off-chain channel; `Stop` terminates either receive loop
//! in-band.

use crate::checkpoint::Withdrawal;
use crate::Error;

/// `UpdateVp` tag.
pub const TAG_UPDATE_VP: u8 = 0;
/// `UpdateProofs` tag.
pub const TAG_UPDATE_PROOFS: u8 = 1;
/// `SecretShares` tag.
pub const TAG_SECRET_SHARES: u8 = 2;
/// `Stop` tag.
pub const TAG_STOP: u8 = 3;
/// `UpdateNonceCommitments` tag.
pub const TAG_UPDATE_NONCE_COMMITMENTS: u8 = 4;
/// `WithdrawBatch` tag.
pub const TAG_WITHDRAW_BATCH: u8 = 5;
/// `UpdateAdaptSig` tag.
pub const TAG_UPDATE_ADAPT_SIG: u8 = 6;

/// A protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A participant's voting-power announcement.
    UpdateVp {
        /// Sending position.
        source: u32,
        /// The weight in `[0, 1]`.
        weight: f64,
    },
    /// A dealer's polynomial commitments plus proof of knowledge.
    UpdateProofs {
        /// Sending position.
        source: u32,
        /// The 64-byte secret proof.
        proof: [u8; 64],
        /// The `t + 1` compressed coefficient commitments.
        commitments: Vec<[u8; 33]>,
    },
    /// A private batch of secret shares for the recipient's keys.
    SecretShares {
        /// Sending position.
        source: u32,
        /// `(key index, share scalar)` pairs.
        shares: Vec<(u64, [u8; 32])>,
    },
    /// In-band shutdown of a receive loop.
    Stop,
    /// A participant's nonce commitments, one `(D, E)` pair per signing
    /// slot.
    UpdateNonceCommitments {
        /// Sending position.
        source: u32,
        /// Compressed `(D, E)` pairs indexed by slot.
        commitments: Vec<([u8; 33], [u8; 33])>,
    },
    /// The ordered withdrawal batch for the next checkpoint.
    WithdrawBatch {
        /// Withdrawals in batch order.
        withdrawals: Vec<Withdrawal>,
    },
    /// A participant's weighted partial signature for one signing slot.
    UpdateAdaptSig {
        /// Sending position.
        source: u32,
        /// The signing slot.
        slot: u64,
        /// The 64-byte partial signature.
        share: [u8; 64],
    },
}

impl Message {
    /// The message's tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Message::UpdateVp { .. } => TAG_UPDATE_VP,
            Message::UpdateProofs { .. } => TAG_UPDATE_PROOFS,
            Message::SecretShares { .. } => TAG_SECRET_SHARES,
            Message::Stop => TAG_STOP,
            Message::UpdateNonceCommitments { .. } => TAG_UPDATE_NONCE_COMMITMENTS,
            Message::WithdrawBatch { .. } => TAG_WITHDRAW_BATCH,
            Message::UpdateAdaptSig { .. } => TAG_UPDATE_ADAPT_SIG,
        }
    }

    /// Serialize the message, tag byte first.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![self.tag()];
        match self {
            Message::UpdateVp { source, weight } => {
                bytes.extend_from_slice(&source.to_be_bytes());
                bytes.extend_from_slice(&weight.to_bits().to_be_bytes());
            }
            Message::UpdateProofs {
                source,
                proof,
                commitments,
            } => {
                bytes.extend_from_slice(&source.to_be_bytes());
                bytes.extend_from_slice(proof);
                bytes.extend_from_slice(&(commitments.len() as u16).to_be_bytes());
                for commitment in commitments {
                    bytes.extend_from_slice(commitment);
                }
            }
            Message::SecretShares { source, shares } => {
                bytes.extend_from_slice(&source.to_be_bytes());
                bytes.extend_from_slice(&(shares.len() as u32).to_be_bytes());
                for (key, share) in shares {
                    bytes.extend_from_slice(&key.to_be_bytes());
                    bytes.extend_from_slice(share);
                }
            }
            Message::Stop => {}
            Message::UpdateNonceCommitments {
                source,
                commitments,
            } => {
                bytes.extend_from_slice(&source.to_be_bytes());
                bytes.extend_from_slice(&(commitments.len() as u16).to_be_bytes());
                for (hiding, binding) in commitments {
                    bytes.extend_from_slice(hiding);
                    bytes.extend_from_slice(binding);
                }
            }
            Message::WithdrawBatch { withdrawals } => {
                bytes.extend_from_slice(&(withdrawals.len() as u16).to_be_bytes());
                for withdrawal in withdrawals {
                    bytes.extend_from_slice(&withdrawal.serialize());
                }
            }
            Message::UpdateAdaptSig {
                source,
                slot,
                share,
            } => {
                bytes.extend_from_slice(&source.to_be_bytes());
                bytes.extend_from_slice(&slot.to_be_bytes());
                bytes.extend_from_slice(share);
            }
        }
        bytes
    }

    /// Deserialize a message from its tagged wire form.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let tag = reader.u8()?;
        let message = match tag {
            TAG_UPDATE_VP => Message::UpdateVp {
                source: reader.u32()?,
                weight: f64::from_bits(reader.u64()?),
            },
            TAG_UPDATE_PROOFS => {
                let source = reader.u32()?;
                let proof = reader.array::<64>()?;
                let count = reader.u16()?;
                let mut commitments = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    commitments.push(reader.array::<33>()?);
                }
                Message::UpdateProofs {
                    source,
                    proof,
                    commitments,
                }
            }
            TAG_SECRET_SHARES => {
                let source = reader.u32()?;
                let count = reader.u32()?;
                let mut shares = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = reader.u64()?;
                    shares.push((key, reader.array::<32>()?));
                }
                Message::SecretShares { source, shares }
            }
            TAG_STOP => Message::Stop,
            TAG_UPDATE_NONCE_COMMITMENTS => {
                let source = reader.u32()?;
                let count = reader.u16()?;
                let mut commitments = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let hiding = reader.array::<33>()?;
                    commitments.push((hiding, reader.array::<33>()?));
                }
                Message::UpdateNonceCommitments {
                    source,
                    commitments,
                }
            }
            TAG_WITHDRAW_BATCH => {
                let count = reader.u16()?;
                let mut withdrawals = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    withdrawals.push(Withdrawal::read(&mut reader)?);
                }
                Message::WithdrawBatch { withdrawals }
            }
            TAG_UPDATE_ADAPT_SIG => Message::UpdateAdaptSig {
                source: reader.u32()?,
                slot: reader.u64()?,
                share: reader.array::<64>()?,
            },
            other => return Err(Error::UnknownMessageTag(other)),
        };
        reader.finish()?;
        Ok(message)
    }
}

/// A cursor over a received message body.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.bytes.len() < n {
            return Err(Error::MalformedMessage);
        }
        let (taken, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(taken)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        Ok(self.take(N)?.try_into().expect("length checked"))
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Reject trailing bytes.
    pub(crate) fn finish(self) -> Result<(), Error> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(Error::MalformedMessage)
        }
    }
}
