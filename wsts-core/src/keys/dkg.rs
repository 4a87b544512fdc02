//! Weighted distributed key generation.
//!
//! Every participant acts as a dealer in a parallel run of Pedersen-style
//! verifiable secret sharing: it samples a secret polynomial, broadcasts the
//! coefficient commitments together with a proof of knowledge of the
//! contributed secret, and privately sends each other participant the
//! polynomial evaluations for the virtual keys that participant owns. Each
//! recipient batch-verifies every received share against the dealer's
//! commitments, sums the per-dealer contributions into one long-term signing
//! share per owned key, and derives the public signing share of every
//! virtual key from the aggregate commitment vector alone.
//!
//! The three parts map onto the driver's message flow: [`part1`] produces
//! the on-chain broadcast, [`part2`] the private per-recipient share
//! batches, and [`part3`] runs once all commitments and shares have
//! arrived.

use std::collections::BTreeMap;
use std::thread;

use k256::{ProjectivePoint, Scalar};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::algebra::{
    even_y_normalize, has_even_y, pok_challenge, random_nonzero, scalar_powers,
};
use crate::allocator::KeyRange;
use crate::identifier::{KeyIndex, ParticipantId};
use crate::keys::{
    sum_commitments, KeyPackage, PublicKeyPackage, SecretPolynomial, SigningShare, VerifyingShare,
    VssCommitment,
};
use crate::serialization::x_only;
use crate::{Error, Signature, VerifyingKey};

/// DKG broadcast-round structures.
pub mod round1 {
    use derive_getters::Getters;

    use super::*;

    /// The package broadcast on-chain by each participant at DKG start.
    #[derive(Clone, Debug, PartialEq, Eq, Getters)]
    pub struct Package {
        /// The dealer's coefficient commitment vector.
        pub(crate) commitment: VssCommitment,
        /// The proof of knowledge of the contributed secret `a_0`.
        pub(crate) proof_of_knowledge: Signature,
    }

    impl Package {
        /// Create a new [`Package`] instance.
        pub fn new(commitment: VssCommitment, proof_of_knowledge: Signature) -> Self {
            Self {
                commitment,
                proof_of_knowledge,
            }
        }
    }

    /// The secret kept in memory between the broadcast and the share
    /// distribution.
    ///
    /// # Security
    ///
    /// This package MUST NOT be sent to other participants!
    #[derive(Clone, PartialEq, Eq)]
    pub struct SecretPackage {
        /// The participant holding the polynomial.
        pub(crate) position: ParticipantId,
        /// The secret polynomial degree `t`.
        pub(crate) threshold: u16,
        /// The total virtual key count `N`.
        pub(crate) max_keys: u64,
        /// The secret polynomial `f_i`.
        pub(crate) polynomial: SecretPolynomial,
        /// The public commitment to `f_i`.
        pub(crate) commitment: VssCommitment,
    }

    impl SecretPackage {
        /// The participant's own commitment vector, as broadcast.
        pub fn commitment(&self) -> &VssCommitment {
            &self.commitment
        }
    }

    impl core::fmt::Debug for SecretPackage {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("SecretPackage")
                .field("position", &self.position)
                .field("threshold", &self.threshold)
                .field("max_keys", &self.max_keys)
                .field("polynomial", &"<redacted>")
                .finish()
        }
    }

    impl Zeroize for SecretPackage {
        fn zeroize(&mut self) {
            self.polynomial.zeroize();
        }
    }
}

/// DKG share-distribution structures.
pub mod round2 {
    use derive_getters::Getters;

    use super::*;

    /// The private share batch sent to one recipient: the dealer's
    /// polynomial evaluated at every virtual key the recipient owns.
    ///
    /// # Security
    ///
    /// The package must be sent on a *confidential*, point-to-point
    /// channel.
    #[derive(Clone, Debug, PartialEq, Eq, Getters)]
    pub struct Package {
        /// The shares `f_i(k)` keyed by the recipient's virtual keys.
        pub(crate) shares: BTreeMap<KeyIndex, SigningShare>,
    }

    impl Package {
        /// Create a new [`Package`] instance.
        pub fn new(shares: BTreeMap<KeyIndex, SigningShare>) -> Self {
            Self { shares }
        }
    }

    impl Zeroize for Package {
        fn zeroize(&mut self) {
            for share in self.shares.values_mut() {
                share.zeroize();
            }
        }
    }

    /// The secret kept in memory between share distribution and the final
    /// derivation. The polynomial itself is already destroyed by this
    /// point; what remains are the protocol parameters and the dealer's own
    /// commitment for cross-checking.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct SecretPackage {
        /// The participant's position.
        pub(crate) position: ParticipantId,
        /// The secret polynomial degree `t`.
        pub(crate) threshold: u16,
        /// The total virtual key count `N`.
        pub(crate) max_keys: u64,
        /// The participant's own key range.
        pub(crate) key_range: KeyRange,
        /// The participant's own commitment vector.
        pub(crate) commitment: VssCommitment,
    }

    impl SecretPackage {
        /// The participant's own key range.
        pub fn key_range(&self) -> KeyRange {
            self.key_range
        }
    }
}

/// Performs the first part of the DKG for the given participant: sample the
/// secret polynomial and produce the package to broadcast on-chain.
pub fn part1<R: RngCore + CryptoRng>(
    position: ParticipantId,
    threshold: u16,
    max_keys: u64,
    context: &[u8; 32],
    rng: &mut R,
) -> Result<(round1::SecretPackage, round1::Package), Error> {
    let polynomial = SecretPolynomial::generate(threshold, rng);
    let commitment = polynomial.commit();
    let proof_of_knowledge =
        compute_proof_of_knowledge(position, &polynomial, &commitment, context, rng)?;

    let secret_package = round1::SecretPackage {
        position,
        threshold,
        max_keys,
        polynomial,
        commitment: commitment.clone(),
    };
    let package = round1::Package {
        commitment,
        proof_of_knowledge,
    };

    Ok((secret_package, package))
}

/// Compute the proof of knowledge of the contributed secret `a_0`: a
/// BIP-340-style Schnorr signature under the constant-term commitment
/// `A_0`, with the nonce point and the secret both conceptually negated to
/// their even-Y representatives.
pub(crate) fn compute_proof_of_knowledge<R: RngCore + CryptoRng>(
    position: ParticipantId,
    polynomial: &SecretPolynomial,
    commitment: &VssCommitment,
    context: &[u8; 32],
    rng: &mut R,
) -> Result<Signature, Error> {
    let secret_commitment = commitment.secret_commitment()?;

    let mut k = random_nonzero(rng);
    let mut big_r = ProjectivePoint::GENERATOR * k;
    if !has_even_y(&big_r) {
        k = -k;
        big_r = -big_r;
    }

    let mut secret = polynomial.constant();
    if !has_even_y(&secret_commitment) {
        secret = -secret;
    }

    let c = pok_challenge(position, context, &secret_commitment, &x_only(&big_r));
    Ok(Signature::new(big_r, k + c * secret))
}

/// Verifies a dealer's proof of knowledge against its claimed constant-term
/// commitment.
///
/// Recomputes the challenge and checks `R' = g^σ · A_0^{-c}`: the proof is
/// rejected when `R'` is the identity, has odd Y, or does not match the
/// claimed nonce point.
pub fn verify_proof_of_knowledge(
    position: ParticipantId,
    context: &[u8; 32],
    commitment: &VssCommitment,
    proof_of_knowledge: &Signature,
) -> Result<(), Error> {
    let secret_commitment = commitment.secret_commitment()?;
    let (even_commitment, _) = even_y_normalize(secret_commitment);

    let r_x = x_only(&proof_of_knowledge.R);
    let c = pok_challenge(position, context, &secret_commitment, &r_x);
    let r_prime = ProjectivePoint::GENERATOR * proof_of_knowledge.z - even_commitment * c;

    if r_prime == ProjectivePoint::IDENTITY
        || !has_even_y(&r_prime)
        || x_only(&r_prime) != r_x
    {
        return Err(Error::InvalidProofOfKnowledge { culprit: position });
    }
    Ok(())
}

/// Performs the second part of the DKG: evaluate the secret polynomial at
/// every virtual key and produce one private share batch per participant
/// (the dealer's own batch included, to be stored rather than sent).
///
/// Consumes the round-1 secret package; the polynomial is zeroized once the
/// shares are issued.
pub fn part2(
    mut secret_package: round1::SecretPackage,
    key_ranges: &BTreeMap<ParticipantId, KeyRange>,
) -> Result<(round2::SecretPackage, BTreeMap<ParticipantId, round2::Package>), Error> {
    let own_range = *key_ranges
        .get(&secret_package.position)
        .ok_or(Error::UnknownParticipant {
            position: secret_package.position,
        })?;

    let mut packages = BTreeMap::new();
    for (recipient, range) in key_ranges {
        let shares = range
            .iter()
            .map(|key| (key, secret_package.polynomial.evaluate(key)))
            .collect();
        packages.insert(*recipient, round2::Package::new(shares));
    }

    let round2_secret = round2::SecretPackage {
        position: secret_package.position,
        threshold: secret_package.threshold,
        max_keys: secret_package.max_keys,
        key_range: own_range,
        commitment: secret_package.commitment.clone(),
    };
    secret_package.zeroize();

    Ok((round2_secret, packages))
}

/// Performs the third and final part of the DKG once every dealer's
/// commitment vector and share batch has arrived (the participant's own
/// batch from [`part2`] included, keyed by its own position).
///
/// For every owned virtual key the received shares are batch-verified
/// against the dealers' commitments (the powers of the key index are
/// computed once and reused across dealers) and summed into the long-term
/// signing share `s_k = ∑_j f_j(k)`. Public signing shares for foreign keys
/// are derived from the aggregate commitment vector `M_j = ∑_i A_{i,j}`,
/// and the group key is `M_0`. Verification and derivation fan out over
/// worker threads and join before the packages are assembled.
///
/// A share inconsistent with its dealer's commitment fails the whole call
/// with [`Error::InvalidSecretShare`] naming the dealer; the caller may
/// exclude that dealer and retry with the remaining contributions.
pub fn part3(
    round2_secret_package: &round2::SecretPackage,
    commitments: &BTreeMap<ParticipantId, VssCommitment>,
    round2_packages: &BTreeMap<ParticipantId, round2::Package>,
) -> Result<(KeyPackage, PublicKeyPackage), Error> {
    let threshold = round2_secret_package.threshold;

    if !commitments.contains_key(&round2_secret_package.position) {
        return Err(Error::MissingCommitment);
    }
    for commitment in commitments.values() {
        if commitment.coefficients().len() != threshold as usize + 1 {
            return Err(Error::IncorrectNumberOfCommitments);
        }
    }
    if round2_packages.len() != commitments.len()
        || round2_packages.keys().any(|id| !commitments.contains_key(id))
    {
        return Err(Error::MissingCommitment);
    }

    // Long-term share derivation for the owned range.
    let own_keys: Vec<KeyIndex> = round2_secret_package.key_range.iter().collect();
    let signing_shares: BTreeMap<KeyIndex, SigningShare> =
        fan_out_keys(&own_keys, |key| {
            let powers = scalar_powers(&key.to_scalar(), threshold);
            let mut sum = Scalar::ZERO;
            for (dealer, package) in round2_packages {
                let share = package
                    .shares
                    .get(&key)
                    .ok_or(Error::InvalidSecretShare { culprit: *dealer })?;
                let commitment = commitments
                    .get(dealer)
                    .expect("key sets checked above")
                    .evaluate_with_powers(&powers)?;
                if ProjectivePoint::GENERATOR * share.to_scalar() != commitment {
                    return Err(Error::InvalidSecretShare { culprit: *dealer });
                }
                sum += share.to_scalar();
            }
            Ok((key, SigningShare::new(sum)))
        })?
        .into_iter()
        .collect();

    // One aggregate commitment evaluation serves every foreign key.
    let aggregate = sum_commitments(commitments.values())?;
    let verifying_key = VerifyingKey::new(aggregate.secret_commitment()?);

    let foreign_keys: Vec<KeyIndex> = (1..=round2_secret_package.max_keys)
        .map(|k| KeyIndex::new(k).expect("nonzero"))
        .filter(|k| !round2_secret_package.key_range.contains(*k))
        .collect();
    let mut verifying_shares: BTreeMap<KeyIndex, VerifyingShare> =
        fan_out_keys(&foreign_keys, |key| {
            let powers = scalar_powers(&key.to_scalar(), threshold);
            Ok((key, VerifyingShare::new(aggregate.evaluate_with_powers(&powers)?)))
        })?
        .into_iter()
        .collect();
    for (key, share) in &signing_shares {
        verifying_shares.insert(*key, VerifyingShare::from(*share));
    }

    let key_package = KeyPackage::new(
        round2_secret_package.position,
        threshold,
        round2_secret_package.max_keys,
        signing_shares,
        verifying_key,
    );
    let public_key_package = PublicKeyPackage::new(threshold, verifying_shares, verifying_key);

    Ok((key_package, public_key_package))
}

/// Run a per-key job over worker threads and join the results in key order.
fn fan_out_keys<T, F>(keys: &[KeyIndex], job: F) -> Result<Vec<T>, Error>
where
    T: Send,
    F: Fn(KeyIndex) -> Result<T, Error> + Sync,
{
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(keys.len().max(1));

    if workers <= 1 {
        return keys.iter().map(|key| job(*key)).collect();
    }

    let chunk_size = keys.len().div_ceil(workers);
    let job = &job;
    thread::scope(|scope| {
        let handles: Vec<_> = keys
            .chunks(chunk_size)
            .map(|chunk| scope.spawn(move || chunk.iter().map(|key| job(*key)).collect::<Vec<_>>()))
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("key worker panicked"))
            .collect()
    })
}
