//! Scalar and point algebra helpers.
//!
//! Pure functions over the secp256k1 scalar field and curve group:
//! polynomial generation and Horner evaluation, Lagrange coefficients over a
//! virtual-key set, BIP-340 tagged hashes and parity normalization. All
//! randomness comes from caller-supplied RNGs.

use core::iter;
use std::collections::BTreeSet;

use k256::elliptic_curve::{bigint::U256, ops::Reduce, point::AffineCoordinates, Field};
use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::identifier::{KeyIndex, ParticipantId};
use crate::Error;

/// Tag of the secret-proof challenge hash.
pub const POK_CHALLENGE_TAG: &str = "FROST/challenge";

/// Tag of the signing challenge hash.
pub const BIP340_CHALLENGE_TAG: &str = "BIP0340/challenge";

/// Generate a random scalar from `[1, l-1]` by rejection sampling.
pub fn random_nonzero<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    loop {
        let scalar = Scalar::random(&mut *rng);

        // This impl of `Eq` is constant-time.
        if scalar != Scalar::ZERO {
            return scalar;
        }
    }
}

/// Generate a secret polynomial of the given degree: `degree + 1` uniformly
/// random nonzero coefficients, constant term first.
pub fn generate_polynomial<R: RngCore + CryptoRng>(degree: u16, rng: &mut R) -> Vec<Scalar> {
    iter::repeat_with(|| random_nonzero(rng))
        .take(degree as usize + 1)
        .collect()
}

/// Evaluate the polynomial with the given coefficients (constant term first)
/// at the point `x` using Horner's method.
pub fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    let mut value = Scalar::ZERO;
    for coefficient in coefficients.iter().rev() {
        value = value * x + coefficient;
    }
    value
}

/// The powers `[1, x, x^2, .., x^degree]`.
///
/// Share verification and public-share derivation evaluate many commitment
/// vectors at the same key index; computing the powers once amortizes the
/// scalar multiplications across dealers.
pub fn scalar_powers(x: &Scalar, degree: u16) -> Vec<Scalar> {
    let mut powers = Vec::with_capacity(degree as usize + 1);
    let mut current = Scalar::ONE;
    for _ in 0..=degree {
        powers.push(current);
        current *= x;
    }
    powers
}

/// The Lagrange coefficient for virtual key `k` over the honest key set:
/// `∏_{j∈keys, j≠k} j · (j − k)^{-1}`.
///
/// Fails with [`Error::UnknownKey`] if `k` is not in the set.
pub fn lagrange_coefficient(k: KeyIndex, keys: &BTreeSet<KeyIndex>) -> Result<Scalar, Error> {
    if !keys.contains(&k) {
        return Err(Error::UnknownKey { key: k });
    }

    let k_scalar = k.to_scalar();
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for j in keys {
        if *j == k {
            continue;
        }
        let j_scalar = j.to_scalar();
        num *= j_scalar;
        den *= j_scalar - k_scalar;
    }

    if den == Scalar::ZERO {
        return Err(Error::DuplicatedKey);
    }
    Ok(num * den.invert().unwrap())
}

/// Whether the point has an even Y coordinate. The identity has no affine Y;
/// callers must rule it out beforehand.
pub fn has_even_y(point: &ProjectivePoint) -> bool {
    !bool::from(point.to_affine().y_is_odd())
}

/// Normalize a point to even Y as required at every BIP-340 boundary.
/// Returns the normalized point and whether it was negated.
pub fn even_y_normalize(point: ProjectivePoint) -> (ProjectivePoint, bool) {
    if has_even_y(&point) {
        (point, false)
    } else {
        (-point, true)
    }
}

/// A SHA-256 instance primed with the BIP-340 tag prefix `SHA256(tag) ||
/// SHA256(tag)`.
pub fn tagged_hash(tag: &str) -> Sha256 {
    let mut hasher = Sha256::new();
    let mut tag_hasher = Sha256::new();
    tag_hasher.update(tag.as_bytes());
    let tag_hash = tag_hasher.finalize();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher
}

/// Digest the hasher to a scalar by wide reduction.
///
/// The secp256k1 group order is close to 2^256 and the input is a hash
/// output, so the reduction bias is negligible.
pub fn hasher_to_scalar(hasher: Sha256) -> Scalar {
    Scalar::reduce(U256::from_be_slice(&hasher.finalize()))
}

/// The BIP-340 signing challenge `c = H_tag(R.x ‖ Y.x ‖ m)`.
///
/// Only the X coordinates enter the hash, so the result is independent of
/// the parity of either point.
pub fn challenge(
    group_commitment: &ProjectivePoint,
    verifying_key: &ProjectivePoint,
    message: &[u8],
) -> Scalar {
    let mut hasher = tagged_hash(BIP340_CHALLENGE_TAG);
    hasher.update(group_commitment.to_affine().x());
    hasher.update(verifying_key.to_affine().x());
    hasher.update(message);
    hasher_to_scalar(hasher)
}

/// The secret-proof challenge `c = H_tag(i ‖ ctx ‖ A_0.x ‖ R.x)` under the
/// `FROST/challenge` tag.
pub fn pok_challenge(
    position: ParticipantId,
    context: &[u8; 32],
    secret_commitment: &ProjectivePoint,
    r_x: &[u8; 32],
) -> Scalar {
    let mut hasher = tagged_hash(POK_CHALLENGE_TAG);
    hasher.update([position.to_byte()]);
    hasher.update(context);
    hasher.update(secret_commitment.to_affine().x());
    hasher.update(r_x);
    hasher_to_scalar(hasher)
}

/// The binding factor `ρ_i = SHA256(i ‖ transcript)` where the transcript is
/// the message hash followed by the x-only nonce commitments of the honest
/// set in ascending position order. Untagged, by protocol definition.
pub fn binding_factor(position: ParticipantId, nonce_transcript: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update([position.to_byte()]);
    hasher.update(nonce_transcript);
    hasher_to_scalar(hasher)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::thread_rng;

    use super::*;

    fn scalar_from_seed(seed: [u8; 32]) -> Scalar {
        Scalar::reduce(U256::from_be_slice(&seed))
    }

    /// Naive `∑ a_j x^j` for cross-checking Horner evaluation.
    fn evaluate_naive(coefficients: &[Scalar], x: &Scalar) -> Scalar {
        coefficients
            .iter()
            .zip(scalar_powers(x, coefficients.len() as u16 - 1))
            .fold(Scalar::ZERO, |acc, (a, power)| acc + *a * power)
    }

    proptest! {
        #[test]
        fn horner_matches_naive(seeds in prop::collection::vec(any::<[u8; 32]>(), 1..8), x in any::<[u8; 32]>()) {
            let coefficients: Vec<Scalar> = seeds.into_iter().map(scalar_from_seed).collect();
            let x = scalar_from_seed(x);
            prop_assert_eq!(evaluate_polynomial(&coefficients, &x), evaluate_naive(&coefficients, &x));
        }
    }

    #[test]
    fn generated_polynomial_has_degree_plus_one_nonzero_coefficients() {
        let coefficients = generate_polynomial(4, &mut thread_rng());
        assert_eq!(coefficients.len(), 5);
        assert!(coefficients.iter().all(|c| *c != Scalar::ZERO));
    }

    #[test]
    fn lagrange_interpolates_constant_term() {
        let mut rng = thread_rng();
        let coefficients = generate_polynomial(2, &mut rng);

        // f(0) recovered from any 3 of 5 evaluation points.
        let keys: BTreeSet<KeyIndex> = [2u64, 3, 5]
            .into_iter()
            .map(|k| KeyIndex::new(k).unwrap())
            .collect();
        let mut secret = Scalar::ZERO;
        for k in &keys {
            let share = evaluate_polynomial(&coefficients, &k.to_scalar());
            secret += share * lagrange_coefficient(*k, &keys).unwrap();
        }
        assert_eq!(secret, coefficients[0]);
    }

    #[test]
    fn lagrange_rejects_foreign_key() {
        let keys: BTreeSet<KeyIndex> = [1u64, 2].into_iter().map(|k| KeyIndex::new(k).unwrap()).collect();
        let outsider = KeyIndex::new(9).unwrap();
        assert_eq!(
            lagrange_coefficient(outsider, &keys),
            Err(Error::UnknownKey { key: outsider })
        );
    }

    #[test]
    fn even_y_normalization_is_idempotent() {
        let mut rng = thread_rng();
        for _ in 0..16 {
            let point = ProjectivePoint::GENERATOR * random_nonzero(&mut rng);
            let (normalized, _) = even_y_normalize(point);
            assert!(has_even_y(&normalized));
            let (again, negated) = even_y_normalize(normalized);
            assert_eq!(again, normalized);
            assert!(!negated);
        }
    }

    #[test]
    fn scalar_powers_match_repeated_multiplication() {
        let x = Scalar::from(3u64);
        let powers = scalar_powers(&x, 4);
        assert_eq!(powers[0], Scalar::ONE);
        assert_eq!(powers[4], Scalar::from(81u64));
    }
}
