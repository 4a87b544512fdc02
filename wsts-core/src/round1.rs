//! Signing round 1: nonce generation and commitments.
//!
//! For every signing slot a participant samples a hiding/binding nonce pair
//! `(d, e)` and publishes the commitments `(D, E) = (g^d, g^e)`. The nonces
//! are retained until the slot is consumed and MUST be destroyed
//! immediately afterwards: reusing a nonce pair leaks the long-term signing
//! shares.

use core::fmt::{self, Debug};

use derive_getters::Getters;
use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::algebra::random_nonzero;
use crate::serialization::{point_from_bytes, point_to_bytes, scalar_to_bytes};
use crate::Error;

/// A scalar that is a signing nonce.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub(crate) Scalar);

impl Nonce {
    /// Generate a new uniformly random nonzero signing nonce.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(random_nonzero(rng))
    }

    pub(crate) fn to_scalar(self) -> Scalar {
        self.0
    }

    /// Serialize to 32 big-endian bytes.
    pub fn serialize(&self) -> [u8; 32] {
        scalar_to_bytes(&self.0)
    }
}

impl Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Nonce").field(&"<redacted>").finish()
    }
}

impl Zeroize for Nonce {
    fn zeroize(&mut self) {
        self.0 = Scalar::ZERO;
    }
}

/// A group element that is a commitment to a signing nonce.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NonceCommitment(pub(crate) ProjectivePoint);

impl NonceCommitment {
    pub(crate) fn new(value: ProjectivePoint) -> Self {
        Self(value)
    }

    pub(crate) fn value(&self) -> ProjectivePoint {
        self.0
    }

    /// Serialize in 33-byte SEC1 compressed form.
    pub fn serialize(&self) -> Result<[u8; 33], Error> {
        point_to_bytes(&self.0)
    }

    /// Deserialize from 33-byte SEC1 compressed form.
    pub fn deserialize(bytes: &[u8; 33]) -> Result<Self, Error> {
        Ok(Self(point_from_bytes(bytes)?))
    }
}

impl Debug for NonceCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NonceCommitment")
            .field(&self.serialize().map(hex::encode).unwrap_or_else(|_| "<invalid>".into()))
            .finish()
    }
}

impl From<&Nonce> for NonceCommitment {
    fn from(nonce: &Nonce) -> Self {
        Self::new(ProjectivePoint::GENERATOR * nonce.to_scalar())
    }
}

/// The hiding and binding nonces for one signing slot.
///
/// [`SigningNonces`] must be used *only once*; the driver removes them from
/// its state the moment a partial signature has been produced.
#[derive(Clone, PartialEq, Eq, Getters)]
pub struct SigningNonces {
    /// The hiding nonce `d`.
    pub(crate) hiding: Nonce,
    /// The binding nonce `e`.
    pub(crate) binding: Nonce,
    /// The public commitments to the nonces, precomputed so signing does
    /// not have to redo the base multiplications.
    #[getter(skip)]
    pub(crate) commitments: SigningCommitments,
}

impl SigningNonces {
    /// Generate a fresh nonce pair for one signing slot.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let hiding = Nonce::new(rng);
        let binding = Nonce::new(rng);
        Self::from_nonces(hiding, binding)
    }

    /// Build [`SigningNonces`] from an existing pair.
    pub fn from_nonces(hiding: Nonce, binding: Nonce) -> Self {
        let commitments = SigningCommitments::new((&hiding).into(), (&binding).into());
        Self {
            hiding,
            binding,
            commitments,
        }
    }

    /// The public commitments matching this nonce pair.
    pub fn commitments(&self) -> &SigningCommitments {
        &self.commitments
    }
}

impl Debug for SigningNonces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningNonces")
            .field("hiding", &"<redacted>")
            .field("binding", &"<redacted>")
            .finish()
    }
}

impl Zeroize for SigningNonces {
    fn zeroize(&mut self) {
        self.hiding.zeroize();
        self.binding.zeroize();
    }
}

/// Published by each participant in the first signing round, one per slot.
/// Each commitment pair can be used for exactly *one* signature.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Getters)]
pub struct SigningCommitments {
    /// Commitment `D` to the hiding nonce.
    pub(crate) hiding: NonceCommitment,
    /// Commitment `E` to the binding nonce.
    pub(crate) binding: NonceCommitment,
}

impl SigningCommitments {
    /// Create new [`SigningCommitments`].
    pub fn new(hiding: NonceCommitment, binding: NonceCommitment) -> Self {
        Self { hiding, binding }
    }
}

impl From<&SigningNonces> for SigningCommitments {
    fn from(nonces: &SigningNonces) -> Self {
        nonces.commitments
    }
}

/// Generate nonce pairs and commitments for a batch of signing slots.
///
/// The nonces go to secret storage for later use; the commitments are
/// published. Slot `ℓ` of the returned vectors serves signing slot `ℓ`.
pub fn preprocess<R: RngCore + CryptoRng>(
    slots: usize,
    rng: &mut R,
) -> (Vec<SigningNonces>, Vec<SigningCommitments>) {
    let mut signing_nonces = Vec::with_capacity(slots);
    let mut signing_commitments = Vec::with_capacity(slots);

    for _ in 0..slots {
        let nonces = SigningNonces::new(rng);
        signing_commitments.push(SigningCommitments::from(&nonces));
        signing_nonces.push(nonces);
    }

    (signing_nonces, signing_commitments)
}

/// Generate the nonce pair and commitments for a single signing slot.
pub fn commit<R: RngCore + CryptoRng>(rng: &mut R) -> (SigningNonces, SigningCommitments) {
    let (mut nonces, mut commitments) = preprocess(1, rng);
    (
        nonces.pop().expect("must have 1 element"),
        commitments.pop().expect("must have 1 element"),
    )
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use super::*;

    #[test]
    fn commitments_match_nonces() {
        let nonces = SigningNonces::new(&mut thread_rng());
        assert_eq!(
            nonces.commitments().hiding().value(),
            ProjectivePoint::GENERATOR * nonces.hiding.to_scalar()
        );
        assert_eq!(
            nonces.commitments().binding().value(),
            ProjectivePoint::GENERATOR * nonces.binding.to_scalar()
        );
    }

    #[test]
    fn preprocess_yields_one_pair_per_slot() {
        let (nonces, commitments) = preprocess(4, &mut thread_rng());
        assert_eq!(nonces.len(), 4);
        assert_eq!(commitments.len(), 4);
        for (nonces, commitments) in nonces.iter().zip(&commitments) {
            assert_eq!(&SigningCommitments::from(nonces), commitments);
        }
    }

    #[test]
    fn zeroized_nonces_are_cleared() {
        let mut nonces = SigningNonces::new(&mut thread_rng());
        nonces.zeroize();
        assert_eq!(nonces.hiding.to_scalar(), Scalar::ZERO);
        assert_eq!(nonces.binding.to_scalar(), Scalar::ZERO);
    }
}
