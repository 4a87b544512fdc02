//! Checkpoint transaction assembly.
//!
//! The vault is a single P2TR UTXO whose output key is the group verifying
//! key. Each checkpoint spends the previous checkpoint output and pays out
//! the current withdrawal batch: output 0 re-locks the remaining balance to
//! the group key, followed by one output per withdrawal in batch order.
//! Assembly is pure and deterministic: every participant derives a
//! byte-identical transaction and BIP-341 key-spend sighash
//! (`SIGHASH_DEFAULT`) for input 0, which is the message the threshold
//! signs.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    XOnlyPublicKey,
};
use wsts_core::VerifyingKey;

use crate::message::Reader;
use crate::Error;

/// A recorded checkpoint: the outpoint of the vault UTXO at one height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Transaction id of the checkpoint transaction.
    pub txid: Txid,
    /// Output index of the vault output within it.
    pub vout: u32,
}

impl CheckpointRecord {
    /// The outpoint this record references.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    /// Serialize as the 32-byte txid followed by the 4-byte big-endian
    /// output index.
    pub fn serialize(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..32].copy_from_slice(&self.txid.to_byte_array());
        bytes[32..].copy_from_slice(&self.vout.to_be_bytes());
        bytes
    }

    /// Deserialize from the 36-byte form.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: &[u8; 36] = bytes.try_into().map_err(|_| Error::MalformedMessage)?;
        let txid = Txid::from_byte_array(bytes[..32].try_into().expect("correct length"));
        let vout = u32::from_be_bytes(bytes[32..].try_into().expect("correct length"));
        Ok(Self { txid, vout })
    }
}

/// A withdrawal request: receiver script and amount in satoshis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Withdrawal {
    /// The receiver's output script.
    pub receiver: ScriptBuf,
    /// The amount in satoshis.
    pub amount: u64,
}

impl Withdrawal {
    /// Serialize as a length-prefixed script followed by the 8-byte
    /// big-endian amount.
    pub fn serialize(&self) -> Vec<u8> {
        let script = self.receiver.as_bytes();
        let mut bytes = Vec::with_capacity(2 + script.len() + 8);
        bytes.extend_from_slice(&(script.len() as u16).to_be_bytes());
        bytes.extend_from_slice(script);
        bytes.extend_from_slice(&self.amount.to_be_bytes());
        bytes
    }

    /// Deserialize one withdrawal from the reader.
    pub(crate) fn read(reader: &mut Reader<'_>) -> Result<Self, Error> {
        let script_len = reader.u16()? as usize;
        let script = reader.take(script_len)?.to_vec();
        let amount = reader.u64()?;
        Ok(Self {
            receiver: ScriptBuf::from_bytes(script),
            amount,
        })
    }

    /// Deserialize from the serialized form.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        let withdrawal = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(withdrawal)
    }
}

/// Read-only access to the confirmed UTXO set, supplied externally.
pub trait UtxoView: Send + Sync {
    /// The output referenced by the outpoint, if unspent.
    fn fetch_prev_output(&self, outpoint: &OutPoint) -> Option<TxOut>;
}

/// The vault output script: a P2TR output whose output key is the group
/// verifying key directly (key-path spending only).
pub fn vault_script(group_key: &VerifyingKey) -> ScriptBuf {
    let output_key = XOnlyPublicKey::from_slice(&group_key.serialize_x_only())
        .expect("a group verifying key is a valid x-only point");
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(output_key))
}

/// Assemble the next checkpoint transaction and its signing sighash.
///
/// Validates that the previous checkpoint output exists and pays the
/// current group key, and that the batch amounts plus `gas_fee` fit in the
/// vault balance. Returns the unsigned transaction and the BIP-341 taproot
/// key-spend sighash for input 0 with `SIGHASH_DEFAULT`.
pub fn assemble_next_checkpoint(
    prev: &CheckpointRecord,
    utxo_view: &dyn UtxoView,
    withdrawals: &[Withdrawal],
    gas_fee: u64,
    group_key: &VerifyingKey,
) -> Result<(Transaction, [u8; 32]), Error> {
    let prev_outpoint = prev.outpoint();
    let prev_output = utxo_view
        .fetch_prev_output(&prev_outpoint)
        .ok_or(Error::MissingPrevOutput)?;

    let vault = vault_script(group_key);
    if prev_output.script_pubkey != vault {
        return Err(Error::VaultScriptMismatch);
    }

    let available = prev_output.value.to_sat();
    let mut required = gas_fee;
    for withdrawal in withdrawals {
        required = required
            .checked_add(withdrawal.amount)
            .ok_or(Error::InsufficientVault {
                required: u64::MAX,
                available,
            })?;
    }
    if required > available {
        return Err(Error::InsufficientVault {
            required,
            available,
        });
    }

    let mut output = Vec::with_capacity(withdrawals.len() + 1);
    output.push(TxOut {
        value: Amount::from_sat(available - required),
        script_pubkey: vault,
    });
    for withdrawal in withdrawals {
        output.push(TxOut {
            value: Amount::from_sat(withdrawal.amount),
            script_pubkey: withdrawal.receiver.clone(),
        });
    }

    let transaction = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output,
    };

    let mut cache = SighashCache::new(&transaction);
    let sighash = cache.taproot_key_spend_signature_hash(
        0,
        &Prevouts::All(&[prev_output]),
        TapSighashType::Default,
    )?;

    Ok((transaction, sighash.to_byte_array()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapUtxoView(HashMap<OutPoint, TxOut>);

    impl UtxoView for MapUtxoView {
        fn fetch_prev_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
            self.0.get(outpoint).cloned()
        }
    }

    fn test_group_key() -> VerifyingKey {
        // A single-dealer DKG is the shortest path to a well-formed group
        // key without depending on curve internals.
        use std::collections::BTreeMap;
        use wsts_core::allocator::KeyRange;
        use wsts_core::keys::dkg;
        use wsts_core::ParticipantId;

        let position = ParticipantId::new(1).unwrap();
        let mut ranges = BTreeMap::new();
        ranges.insert(position, KeyRange::new(1, 3).unwrap());

        let (secret, package) =
            dkg::part1(position, 1, 2, &[0u8; 32], &mut rand::thread_rng()).unwrap();
        let commitments = BTreeMap::from([(position, package.commitment().clone())]);
        let (round2_secret, mut packages) = dkg::part2(secret, &ranges).unwrap();
        let received = BTreeMap::from([(position, packages.remove(&position).unwrap())]);
        let (_, public_package) = dkg::part3(&round2_secret, &commitments, &received).unwrap();
        *public_package.verifying_key()
    }

    fn genesis(group_key: &VerifyingKey, value: u64) -> (CheckpointRecord, MapUtxoView) {
        let record = CheckpointRecord {
            txid: Txid::from_byte_array([0xaa; 32]),
            vout: 0,
        };
        let utxo = TxOut {
            value: Amount::from_sat(value),
            script_pubkey: vault_script(group_key),
        };
        (record, MapUtxoView(HashMap::from([(record.outpoint(), utxo)])))
    }

    fn test_batch() -> Vec<Withdrawal> {
        vec![
            Withdrawal {
                receiver: ScriptBuf::from_bytes(vec![0x51, 0x20, 0x11]),
                amount: 100,
            },
            Withdrawal {
                receiver: ScriptBuf::from_bytes(vec![0x51, 0x20, 0x22]),
                amount: 200,
            },
        ]
    }

    #[test]
    fn assembly_is_deterministic() {
        let group_key = test_group_key();
        let (record, view) = genesis(&group_key, 1_000_000_000);
        let batch = test_batch();

        let (tx_a, sighash_a) =
            assemble_next_checkpoint(&record, &view, &batch, 1000, &group_key).unwrap();
        let (tx_b, sighash_b) =
            assemble_next_checkpoint(&record, &view, &batch, 1000, &group_key).unwrap();

        assert_eq!(tx_a, tx_b);
        assert_eq!(sighash_a, sighash_b);

        // Next checkpoint carries the remaining balance; withdrawals follow
        // in batch order.
        assert_eq!(tx_a.output[0].value.to_sat(), 999_999_700);
        assert_eq!(tx_a.output[0].script_pubkey, vault_script(&group_key));
        assert_eq!(tx_a.output[1].value.to_sat(), 100);
        assert_eq!(tx_a.output[2].value.to_sat(), 200);

        // Reordering the batch changes the sighash.
        let reversed: Vec<Withdrawal> = batch.into_iter().rev().collect();
        let (_, sighash_c) =
            assemble_next_checkpoint(&record, &view, &reversed, 1000, &group_key).unwrap();
        assert_ne!(sighash_a, sighash_c);
    }

    #[test]
    fn overdrawn_batch_is_rejected() {
        let group_key = test_group_key();
        let (record, view) = genesis(&group_key, 1000);

        let result = assemble_next_checkpoint(&record, &view, &test_batch(), 1000, &group_key);
        assert!(matches!(
            result,
            Err(Error::InsufficientVault {
                required: 1300,
                available: 1000,
            })
        ));
    }

    #[test]
    fn foreign_vault_script_is_rejected() {
        let group_key = test_group_key();
        let other_key = test_group_key();
        let (record, view) = genesis(&other_key, 1_000_000);

        assert!(matches!(
            assemble_next_checkpoint(&record, &view, &[], 1000, &group_key),
            Err(Error::VaultScriptMismatch)
        ));
    }

    #[test]
    fn checkpoint_record_roundtrip() {
        let record = CheckpointRecord {
            txid: Txid::from_byte_array([7; 32]),
            vout: 3,
        };
        assert_eq!(
            CheckpointRecord::deserialize(&record.serialize()).unwrap(),
            record
        );
    }
}
