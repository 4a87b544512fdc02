//! WSTS key material: secret polynomials, commitments, shares and packages.

use core::fmt::{self, Debug};
use std::collections::BTreeMap;

use derive_getters::Getters;
use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::algebra::{evaluate_polynomial, generate_polynomial};
use crate::identifier::KeyIndex;
use crate::serialization::{point_from_bytes, point_to_bytes, scalar_from_bytes, scalar_to_bytes};
use crate::{Error, ParticipantId, VerifyingKey};

pub mod dkg;

/// A secret scalar value representing one virtual key's share of the group
/// secret, or one dealer's contribution to such a share.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SigningShare(pub(crate) Scalar);

impl SigningShare {
    /// Create a new [`SigningShare`] from a scalar.
    pub(crate) fn new(scalar: Scalar) -> Self {
        Self(scalar)
    }

    /// Get the inner scalar.
    pub(crate) fn to_scalar(self) -> Scalar {
        self.0
    }

    /// Serialize to 32 big-endian bytes.
    pub fn serialize(&self) -> [u8; 32] {
        scalar_to_bytes(&self.0)
    }

    /// Deserialize from 32 big-endian bytes.
    pub fn deserialize(bytes: &[u8; 32]) -> Result<Self, Error> {
        Ok(Self(scalar_from_bytes(bytes)?))
    }
}

impl Debug for SigningShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningShare").field(&"<redacted>").finish()
    }
}

impl Zeroize for SigningShare {
    fn zeroize(&mut self) {
        self.0 = Scalar::ZERO;
    }
}

/// A public group element representing one virtual key's public signing
/// share `Y_k = g^{s_k}`, derivable by anyone from the polynomial
/// commitments alone.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct VerifyingShare(pub(crate) ProjectivePoint);

impl VerifyingShare {
    /// Create a new [`VerifyingShare`] from an element.
    pub(crate) fn new(element: ProjectivePoint) -> Self {
        Self(element)
    }

    /// Get the inner element.
    pub(crate) fn to_element(self) -> ProjectivePoint {
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

impl Debug for VerifyingShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VerifyingShare")
            .field(&self.serialize().map(hex::encode).unwrap_or_else(|_| "<invalid>".into()))
            .finish()
    }
}

impl From<SigningShare> for VerifyingShare {
    fn from(secret: SigningShare) -> VerifyingShare {
        VerifyingShare::new(ProjectivePoint::GENERATOR * secret.to_scalar())
    }
}

/// A commitment `A_j = g^{a_j}` to one coefficient of a secret polynomial.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoefficientCommitment(pub(crate) ProjectivePoint);

impl CoefficientCommitment {
    /// Create a new commitment from an element.
    pub(crate) fn new(value: ProjectivePoint) -> Self {
        Self(value)
    }

    /// The inner element.
    pub fn value(&self) -> ProjectivePoint {
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

impl Debug for CoefficientCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CoefficientCommitment")
            .field(&self.serialize().map(hex::encode).unwrap_or_else(|_| "<invalid>".into()))
            .finish()
    }
}

/// The vector of commitments to the coefficients of one participant's
/// secret polynomial, broadcast on-chain and used to verify any share
/// `f_i(k)` without revealing the polynomial.
///
/// Participants MUST have a consistent view of every dealer's commitment;
/// the protocol's replicated on-chain channel provides that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VssCommitment(pub(crate) Vec<CoefficientCommitment>);

impl VssCommitment {
    /// Create a new commitment vector.
    pub(crate) fn new(coefficients: Vec<CoefficientCommitment>) -> Self {
        Self(coefficients)
    }

    /// The coefficient commitments, constant term first.
    pub fn coefficients(&self) -> &[CoefficientCommitment] {
        &self.0
    }

    /// The constant-term commitment `A_0`, i.e. the dealer's contribution to
    /// the group public key.
    pub fn secret_commitment(&self) -> Result<ProjectivePoint, Error> {
        Ok(self.0.first().ok_or(Error::MissingCommitment)?.value())
    }

    /// Evaluate `∑_j x^j · A_j` from precomputed powers of `x`.
    ///
    /// The caller computes the powers once per key index and reuses them
    /// across all dealers' commitment vectors.
    pub fn evaluate_with_powers(&self, powers: &[Scalar]) -> Result<ProjectivePoint, Error> {
        if powers.len() != self.0.len() {
            return Err(Error::IncorrectNumberOfCommitments);
        }
        let mut sum = ProjectivePoint::IDENTITY;
        for (commitment, power) in self.0.iter().zip(powers) {
            sum += commitment.value() * power;
        }
        Ok(sum)
    }

    /// Serialize each coefficient commitment in compressed form.
    pub fn serialize(&self) -> Result<Vec<[u8; 33]>, Error> {
        self.0.iter().map(|c| c.serialize()).collect()
    }

    /// Deserialize from an iterator of serialized coefficient commitments.
    pub fn deserialize<'a, I>(serialized: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a [u8; 33]>,
    {
        let coefficients = serialized
            .into_iter()
            .map(CoefficientCommitment::deserialize)
            .collect::<Result<Vec<_>, Error>>()?;
        if coefficients.is_empty() {
            return Err(Error::MissingCommitment);
        }
        Ok(Self(coefficients))
    }
}

/// Sum the commitment vectors of all dealers coefficient-wise, yielding the
/// aggregate vector `M_j = ∑_i A_{i,j}`.
///
/// The aggregate is computed once per DKG and reused: the public signing
/// share of any virtual key `k` is `∑_j k^j · M_j`, and the group public
/// key is `M_0`.
pub fn sum_commitments<'a, I>(commitments: I) -> Result<VssCommitment, Error>
where
    I: IntoIterator<Item = &'a VssCommitment>,
{
    let mut iter = commitments.into_iter();
    let first = iter.next().ok_or(Error::MissingCommitment)?;
    let mut sum: Vec<ProjectivePoint> = first.0.iter().map(|c| c.value()).collect();
    for commitment in iter {
        if commitment.0.len() != sum.len() {
            return Err(Error::IncorrectNumberOfCommitments);
        }
        for (acc, c) in sum.iter_mut().zip(&commitment.0) {
            *acc += c.value();
        }
    }
    Ok(VssCommitment::new(
        sum.into_iter().map(CoefficientCommitment::new).collect(),
    ))
}

/// A secret polynomial `f_i` of degree `t` whose constant term is the
/// participant's contributed secret.
///
/// Created once per DKG epoch and destroyed as soon as all shares have been
/// issued.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPolynomial {
    coefficients: Vec<Scalar>,
}

impl SecretPolynomial {
    /// Sample a fresh polynomial of the given degree with uniformly random
    /// nonzero coefficients.
    pub fn generate<R: RngCore + CryptoRng>(degree: u16, rng: &mut R) -> Self {
        Self {
            coefficients: generate_polynomial(degree, rng),
        }
    }

    /// The polynomial degree `t`.
    pub fn degree(&self) -> u16 {
        self.coefficients.len() as u16 - 1
    }

    /// The contributed secret `a_0`.
    pub(crate) fn constant(&self) -> Scalar {
        self.coefficients[0]
    }

    /// The share `f_i(k)` for virtual key `k`.
    pub fn evaluate(&self, key: KeyIndex) -> SigningShare {
        SigningShare::new(evaluate_polynomial(&self.coefficients, &key.to_scalar()))
    }

    /// The public commitment vector `(g^{a_0}, .., g^{a_t})`.
    pub fn commit(&self) -> VssCommitment {
        VssCommitment::new(
            self.coefficients
                .iter()
                .map(|a| CoefficientCommitment::new(ProjectivePoint::GENERATOR * a))
                .collect(),
        )
    }
}

impl Debug for SecretPolynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretPolynomial")
            .field("degree", &self.degree())
            .field("coefficients", &"<redacted>")
            .finish()
    }
}

impl Zeroize for SecretPolynomial {
    fn zeroize(&mut self) {
        for coefficient in self.coefficients.iter_mut() {
            *coefficient = Scalar::ZERO;
        }
    }
}

/// A participant's post-DKG key material: the long-term signing shares for
/// every owned virtual key plus the group verifying key.
#[derive(Clone, Getters)]
pub struct KeyPackage {
    /// The owning participant's position.
    position: ParticipantId,
    /// The secret polynomial degree `t`; signing requires `t + 1` honest
    /// virtual keys.
    threshold: u16,
    /// The total virtual key count `N`.
    max_keys: u64,
    /// The long-term signing shares `s_k` for every owned key.
    signing_shares: BTreeMap<KeyIndex, SigningShare>,
    /// The group verifying key `Y`.
    verifying_key: VerifyingKey,
}

impl KeyPackage {
    /// Create a new [`KeyPackage`].
    pub fn new(
        position: ParticipantId,
        threshold: u16,
        max_keys: u64,
        signing_shares: BTreeMap<KeyIndex, SigningShare>,
        verifying_key: VerifyingKey,
    ) -> Self {
        Self {
            position,
            threshold,
            max_keys,
            signing_shares,
            verifying_key,
        }
    }
}

impl Debug for KeyPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPackage")
            .field("position", &self.position)
            .field("threshold", &self.threshold)
            .field("max_keys", &self.max_keys)
            .field("signing_shares", &"<redacted>")
            .field("verifying_key", &self.verifying_key)
            .finish()
    }
}

impl Zeroize for KeyPackage {
    fn zeroize(&mut self) {
        for share in self.signing_shares.values_mut() {
            share.zeroize();
        }
    }
}

/// Public data shared by all participants after DKG: the public signing
/// share of every virtual key and the group verifying key.
///
/// Every honest participant derives an identical package.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
pub struct PublicKeyPackage {
    /// The secret polynomial degree `t`.
    threshold: u16,
    /// The public signing shares `Y_k` for every virtual key in `[1, N]`.
    verifying_shares: BTreeMap<KeyIndex, VerifyingShare>,
    /// The group verifying key `Y`.
    verifying_key: VerifyingKey,
}

impl PublicKeyPackage {
    /// Create a new [`PublicKeyPackage`].
    pub fn new(
        threshold: u16,
        verifying_shares: BTreeMap<KeyIndex, VerifyingShare>,
        verifying_key: VerifyingKey,
    ) -> Self {
        Self {
            threshold,
            verifying_shares,
            verifying_key,
        }
    }
}
