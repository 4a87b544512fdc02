//! Signing round 2: weighted partial signatures, verification and
//! aggregation.
//!
//! One participant signs on behalf of every virtual key it owns: the
//! response is `z_i = d_i + e_i·ρ_i + c · ∑_{k∈K_i} λ_k·s_k`, where the
//! Lagrange coefficients are taken over the honest key set across all
//! participants. Aggregating the honest responses yields a plain BIP-340
//! signature under the group key.
//!
//! Parity rule: the aggregate nonce `R` and the group key `Y` are the only
//! points normalized to even Y. When `R` is odd every signer negates its
//! nonces; when `Y` is odd every signer negates its signing shares. The
//! per-participant commitment share `R_i` is published unnegated; partial
//! verification compares X coordinates only, which is parity-agnostic.

use core::fmt::{self, Debug};
use std::collections::{BTreeMap, BTreeSet};

use k256::{ProjectivePoint, Scalar};

use crate::algebra::{
    binding_factor, challenge, even_y_normalize, has_even_y, lagrange_coefficient,
};
use crate::allocator::KeyRange;
use crate::identifier::{KeyIndex, ParticipantId};
use crate::keys::{KeyPackage, PublicKeyPackage};
use crate::round1::{NonceCommitment, SigningCommitments, SigningNonces};
use crate::serialization::{scalar_from_bytes, scalar_to_bytes, x_only};
use crate::{Error, Signature};

/// The honest view of one signing slot: the message hash, the nonce
/// commitments of every honest participant and the honest key ranges.
///
/// Every participant assembles an identical package for a slot once the
/// nonce round is complete; it pins the binding factors, the aggregate
/// nonce and the Lagrange basis for that slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPackage {
    message_hash: [u8; 32],
    signing_commitments: BTreeMap<ParticipantId, SigningCommitments>,
    key_ranges: BTreeMap<ParticipantId, KeyRange>,
}

impl SigningPackage {
    /// Create a new signing package. The commitment and key-range maps must
    /// cover exactly the same (honest) participants.
    pub fn new(
        message_hash: [u8; 32],
        signing_commitments: BTreeMap<ParticipantId, SigningCommitments>,
        key_ranges: BTreeMap<ParticipantId, KeyRange>,
    ) -> Result<Self, Error> {
        if signing_commitments.len() != key_ranges.len() {
            return Err(Error::MissingCommitment);
        }
        if let Some(position) = key_ranges
            .keys()
            .find(|p| !signing_commitments.contains_key(p))
        {
            return Err(Error::UnknownParticipant {
                position: *position,
            });
        }
        Ok(Self {
            message_hash,
            signing_commitments,
            key_ranges,
        })
    }

    /// The message hash being signed.
    pub fn message_hash(&self) -> &[u8; 32] {
        &self.message_hash
    }

    /// The honest participants, in ascending position order.
    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.key_ranges.keys().copied()
    }

    /// The key range of an honest participant.
    pub fn key_range(&self, position: ParticipantId) -> Option<KeyRange> {
        self.key_ranges.get(&position).copied()
    }

    /// The honest virtual-key set across all participants, the Lagrange
    /// basis for this slot.
    pub fn honest_keys(&self) -> BTreeSet<KeyIndex> {
        self.key_ranges
            .values()
            .flat_map(|range| range.iter())
            .collect()
    }

    /// The binding-factor transcript: message hash followed by the x-only
    /// nonce commitments `(D_j, E_j)` in ascending position order.
    fn nonce_transcript(&self) -> Vec<u8> {
        let mut transcript = Vec::with_capacity(32 + self.signing_commitments.len() * 64);
        transcript.extend_from_slice(&self.message_hash);
        for commitments in self.signing_commitments.values() {
            transcript.extend_from_slice(&x_only(&commitments.hiding().value()));
            transcript.extend_from_slice(&x_only(&commitments.binding().value()));
        }
        transcript
    }

    /// The binding factor `ρ_i` for one honest participant.
    pub fn binding_factor(&self, position: ParticipantId) -> Result<Scalar, Error> {
        if !self.signing_commitments.contains_key(&position) {
            return Err(Error::UnknownParticipant { position });
        }
        Ok(binding_factor(position, &self.nonce_transcript()))
    }

    /// One participant's share `R_i = D_i + ρ_i·E_i` of the aggregate
    /// nonce, unnegated.
    pub fn commitment_share(&self, position: ParticipantId) -> Result<NonceCommitment, Error> {
        let commitments = self
            .signing_commitments
            .get(&position)
            .ok_or(Error::UnknownParticipant { position })?;
        let rho = self.binding_factor(position)?;
        Ok(NonceCommitment::new(
            commitments.hiding().value() + commitments.binding().value() * rho,
        ))
    }

    /// The aggregate nonce `R = ∑_j R_j` for this slot, before parity
    /// normalization. Fails if any participant published an identity
    /// commitment or the sum collapses to the identity.
    pub fn group_commitment(&self) -> Result<GroupCommitment, Error> {
        let identity = ProjectivePoint::IDENTITY;
        let transcript = self.nonce_transcript();

        let mut group_commitment = ProjectivePoint::IDENTITY;
        for (position, commitments) in &self.signing_commitments {
            let hiding = commitments.hiding().value();
            let binding = commitments.binding().value();
            // An identity commitment would let a signer cancel out peers'
            // nonce contributions.
            if hiding == identity || binding == identity {
                return Err(Error::IdentityElement);
            }
            let rho = binding_factor(*position, &transcript);
            group_commitment += hiding + binding * rho;
        }

        if group_commitment == identity {
            return Err(Error::IdentityElement);
        }
        Ok(GroupCommitment(group_commitment))
    }
}

/// The sum of all honest participants' bound nonce commitments, published
/// as the `R` component of the final signature after even-Y normalization.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GroupCommitment(pub(crate) ProjectivePoint);

impl GroupCommitment {
    /// The raw aggregate point.
    pub(crate) fn to_element(self) -> ProjectivePoint {
        self.0
    }

    /// Whether the aggregate already has an even Y coordinate.
    pub fn has_even_y(&self) -> bool {
        has_even_y(&self.0)
    }

    /// The BIP-340 x-only form.
    pub fn x_only(&self) -> [u8; 32] {
        x_only(&self.0)
    }
}

impl Debug for GroupCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupCommitment")
            .field(&hex::encode(self.x_only()))
            .finish()
    }
}

/// A participant's weighted partial signature: the x-only commitment share
/// `R_i` and the response `z_i` covering every owned honest key.
///
/// The `R_i` component is redundant with the aggregate nonce but lets
/// verifiers check each partial in isolation; on the wire the pair uses the
/// 64-byte BIP-340 layout.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureShare {
    /// X-only commitment share `R_i`.
    pub(crate) r_share: [u8; 32],
    /// The response scalar `z_i`.
    pub(crate) z_share: Scalar,
}

impl SignatureShare {
    pub(crate) fn new(r_share: [u8; 32], z_share: Scalar) -> Self {
        Self { r_share, z_share }
    }

    /// Serialize as 64 bytes: `R_i.x ‖ z_i`.
    pub fn serialize(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r_share);
        bytes[32..].copy_from_slice(&scalar_to_bytes(&self.z_share));
        bytes
    }

    /// Deserialize from the 64-byte form.
    pub fn deserialize(bytes: &[u8; 64]) -> Result<Self, Error> {
        let r_share = bytes[..32].try_into().expect("correct length");
        let z_share = scalar_from_bytes(&bytes[32..].try_into().expect("correct length"))
            .map_err(|_| Error::MalformedSignature)?;
        Ok(Self { r_share, z_share })
    }
}

impl Debug for SignatureShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureShare")
            .field("share", &hex::encode(self.serialize()))
            .finish()
    }
}

/// Compute the weighted partial signature for one signing slot.
///
/// `z_i = d_i + e_i·ρ_i + c · ∑_{k ∈ K_i} λ_k·s_k`, with the nonces negated
/// when the aggregate nonce has odd Y and the signing shares negated when
/// the group key has odd Y. `K_i` is the signer's owned keys within the
/// honest set.
pub fn sign_weighted(
    signing_package: &SigningPackage,
    signer_nonces: &SigningNonces,
    key_package: &KeyPackage,
) -> Result<SignatureShare, Error> {
    let position = *key_package.position();

    let own_range = signing_package
        .key_range(position)
        .ok_or(Error::UnknownParticipant { position })?;

    // The nonces must be the ones committed to for this slot.
    let commitments = signing_package
        .signing_commitments
        .get(&position)
        .ok_or(Error::UnknownParticipant { position })?;
    if signer_nonces.commitments() != commitments {
        return Err(Error::MissingCommitment);
    }

    let honest_keys = signing_package.honest_keys();
    let need = *key_package.threshold() as u64 + 1;
    if (honest_keys.len() as u64) < need {
        return Err(Error::InsufficientHonestKeys {
            have: honest_keys.len() as u64,
            need,
        });
    }

    let rho = signing_package.binding_factor(position)?;
    let group_commitment = signing_package.group_commitment()?;

    let group_key = key_package.verifying_key();
    let c = challenge(
        &group_commitment.to_element(),
        &group_key.to_element(),
        signing_package.message_hash(),
    );

    // The published commitment share stays unnegated.
    let mut hiding = signer_nonces.hiding().to_scalar();
    let mut binding = signer_nonces.binding().to_scalar();
    let r_share = x_only(&(ProjectivePoint::GENERATOR * (hiding + binding * rho)));

    if !group_commitment.has_even_y() {
        hiding = -hiding;
        binding = -binding;
    }
    let negate_shares = !group_key.has_even_y();

    let mut weighted_secret = Scalar::ZERO;
    for key in own_range.iter() {
        let share = key_package
            .signing_shares()
            .get(&key)
            .ok_or(Error::UnknownKey { key })?;
        let mut secret = share.to_scalar();
        if negate_shares {
            secret = -secret;
        }
        weighted_secret += lagrange_coefficient(key, &honest_keys)? * secret;
    }

    let z_share = hiding + binding * rho + c * weighted_secret;
    Ok(SignatureShare::new(r_share, z_share))
}

/// Verify one participant's weighted partial signature.
///
/// Reconstructs `R'_i = g^{z_i} · ∏_{k ∈ K_i} Y_k^{-λ_k·c}` and accepts iff
/// it is not the identity and its X coordinate matches the claimed `R_i`.
pub fn verify_share_weighted(
    position: ParticipantId,
    signature_share: &SignatureShare,
    signing_package: &SigningPackage,
    public_key_package: &PublicKeyPackage,
) -> Result<(), Error> {
    let range = signing_package
        .key_range(position)
        .ok_or(Error::UnknownParticipant { position })?;
    let honest_keys = signing_package.honest_keys();
    let group_commitment = signing_package.group_commitment()?;

    let group_key = public_key_package.verifying_key();
    let c = challenge(
        &group_commitment.to_element(),
        &group_key.to_element(),
        signing_package.message_hash(),
    );
    let negate_shares = !group_key.has_even_y();

    let mut accumulator = ProjectivePoint::GENERATOR * signature_share.z_share;
    for key in range.iter() {
        let verifying_share = public_key_package
            .verifying_shares()
            .get(&key)
            .ok_or(Error::UnknownKey { key })?;
        let mut share_element = verifying_share.to_element();
        if negate_shares {
            share_element = -share_element;
        }
        let lambda = lagrange_coefficient(key, &honest_keys)?;
        accumulator += share_element * (-(lambda * c));
    }

    if accumulator == ProjectivePoint::IDENTITY
        || x_only(&accumulator) != signature_share.r_share
    {
        return Err(Error::InvalidSignatureShare { culprit: position });
    }
    Ok(())
}

/// Verify every partial signature and aggregate the responses into the
/// final BIP-340 signature `(R, ∑ z_i)` under the group key.
///
/// The share map must cover exactly the participants of the signing
/// package, and the honest key set must meet the threshold.
pub fn aggregate(
    signing_package: &SigningPackage,
    signature_shares: &BTreeMap<ParticipantId, SignatureShare>,
    public_key_package: &PublicKeyPackage,
) -> Result<Signature, Error> {
    let honest_keys = signing_package.honest_keys();
    let need = *public_key_package.threshold() as u64 + 1;
    if (honest_keys.len() as u64) < need {
        return Err(Error::InsufficientHonestKeys {
            have: honest_keys.len() as u64,
            need,
        });
    }

    if let Some(position) = signature_shares
        .keys()
        .find(|p| signing_package.key_range(**p).is_none())
    {
        return Err(Error::UnknownParticipant {
            position: *position,
        });
    }

    let mut z = Scalar::ZERO;
    for position in signing_package.participants() {
        let share = signature_shares
            .get(&position)
            .ok_or(Error::UnknownParticipant { position })?;
        verify_share_weighted(position, share, signing_package, public_key_package)?;
        z += share.z_share;
    }

    let (group_commitment, _) =
        even_y_normalize(signing_package.group_commitment()?.to_element());

    let signature = Signature::new(group_commitment, z);

    // The aggregate must verify as a plain BIP-340 signature; anything else
    // indicates an inconsistent signing package across participants.
    public_key_package
        .verifying_key()
        .verify(signing_package.message_hash(), &signature)?;

    Ok(signature)
}
