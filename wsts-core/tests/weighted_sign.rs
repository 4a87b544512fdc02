//! End-to-end DKG and weighted signing over the public API.

use std::collections::BTreeMap;

use rand::thread_rng;
use sha2::{Digest, Sha256};

use wsts_core::allocator::{allocate, KeyRange};
use wsts_core::keys::dkg::{self, round2 as dkg_round2};
use wsts_core::keys::{KeyPackage, PublicKeyPackage};
use wsts_core::round1::{self, SigningCommitments, SigningNonces};
use wsts_core::round2::{aggregate, sign_weighted, verify_share_weighted, SigningPackage};
use wsts_core::{Error, ParticipantId, Signature, VerifyingKey};

const CONTEXT: [u8; 32] = [0u8; 32];

struct Mesh {
    ranges: BTreeMap<ParticipantId, KeyRange>,
    key_packages: BTreeMap<ParticipantId, KeyPackage>,
    public_key_package: PublicKeyPackage,
}

/// Run a complete in-memory DKG: broadcast commitments and proofs, exchange
/// share batches, derive the packages, and check that every participant
/// lands on the same public view.
fn run_dkg(weights: &[f64], threshold: u16, max_keys: u64) -> Mesh {
    let mut rng = thread_rng();
    let ranges = allocate(weights, max_keys).unwrap();

    let mut round1_secrets = BTreeMap::new();
    let mut commitments = BTreeMap::new();
    for position in ranges.keys() {
        let (secret, package) =
            dkg::part1(*position, threshold, max_keys, &CONTEXT, &mut rng).unwrap();
        dkg::verify_proof_of_knowledge(
            *position,
            &CONTEXT,
            package.commitment(),
            package.proof_of_knowledge(),
        )
        .unwrap();
        commitments.insert(*position, package.commitment().clone());
        round1_secrets.insert(*position, secret);
    }

    let mut round2_secrets = BTreeMap::new();
    let mut inboxes: BTreeMap<ParticipantId, BTreeMap<ParticipantId, dkg_round2::Package>> =
        BTreeMap::new();
    for (position, secret) in round1_secrets {
        let (round2_secret, packages) = dkg::part2(secret, &ranges).unwrap();
        round2_secrets.insert(position, round2_secret);
        for (recipient, package) in packages {
            inboxes
                .entry(recipient)
                .or_default()
                .insert(position, package);
        }
    }

    let mut key_packages = BTreeMap::new();
    let mut public_key_package: Option<PublicKeyPackage> = None;
    for (position, secret) in &round2_secrets {
        let received = inboxes.remove(position).unwrap();
        let (key_package, public_package) = dkg::part3(secret, &commitments, &received).unwrap();
        key_packages.insert(*position, key_package);
        match &public_key_package {
            None => public_key_package = Some(public_package),
            Some(reference) => assert_eq!(&public_package, reference),
        }
    }

    Mesh {
        ranges,
        key_packages,
        public_key_package: public_key_package.unwrap(),
    }
}

/// One signing slot across the given honest participants.
fn run_signing(
    mesh: &Mesh,
    honest: &[u32],
    message_hash: [u8; 32],
) -> Result<Signature, Error> {
    let mut rng = thread_rng();

    let mut nonces: BTreeMap<ParticipantId, SigningNonces> = BTreeMap::new();
    let mut commitments: BTreeMap<ParticipantId, SigningCommitments> = BTreeMap::new();
    let mut key_ranges = BTreeMap::new();
    for position in honest {
        let position = ParticipantId::new(*position).unwrap();
        let (signing_nonces, signing_commitments) = round1::commit(&mut rng);
        nonces.insert(position, signing_nonces);
        commitments.insert(position, signing_commitments);
        key_ranges.insert(position, mesh.ranges[&position]);
    }

    let signing_package = SigningPackage::new(message_hash, commitments, key_ranges)?;

    let mut signature_shares = BTreeMap::new();
    for (position, signing_nonces) in &nonces {
        let share = sign_weighted(
            &signing_package,
            signing_nonces,
            &mesh.key_packages[position],
        )?;
        // Every other participant checks the partial in isolation.
        verify_share_weighted(
            *position,
            &share,
            &signing_package,
            &mesh.public_key_package,
        )?;
        signature_shares.insert(*position, share);
    }

    aggregate(
        &signing_package,
        &signature_shares,
        &mesh.public_key_package,
    )
}

fn group_key(mesh: &Mesh) -> &VerifyingKey {
    mesh.public_key_package.verifying_key()
}

#[test]
fn minimal_dkg_and_sign() {
    // Three equal participants, one key each, all required to sign.
    let mesh = run_dkg(&[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], 2, 3);
    let message_hash = [0u8; 32];

    let signature = run_signing(&mesh, &[1, 2, 3], message_hash).unwrap();
    group_key(&mesh).verify(&message_hash, &signature).unwrap();
}

#[test]
fn silent_participant_below_threshold_aborts() {
    // With threshold t = 2 every one of the three keys is needed; a silent
    // third participant leaves only two honest keys.
    let mesh = run_dkg(&[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], 2, 3);

    let result = run_signing(&mesh, &[1, 2], [0u8; 32]);
    assert_eq!(
        result,
        Err(Error::InsufficientHonestKeys { have: 2, need: 3 })
    );
}

#[test]
fn weighted_sign_with_uneven_ranges() {
    let mesh = run_dkg(&[0.40, 0.30, 0.20, 0.10], 6, 10);
    let message_hash: [u8; 32] = Sha256::digest(b"hello").into();

    let signature = run_signing(&mesh, &[1, 2, 3, 4], message_hash).unwrap();
    group_key(&mesh).verify(&message_hash, &signature).unwrap();

    // Dropping the lightest participant still leaves 9 >= 7 honest keys.
    let signature = run_signing(&mesh, &[1, 2, 3], message_hash).unwrap();
    group_key(&mesh).verify(&message_hash, &signature).unwrap();

    // Dropping participant 1 leaves 6 < 7.
    assert_eq!(
        run_signing(&mesh, &[2, 3, 4], message_hash),
        Err(Error::InsufficientHonestKeys { have: 6, need: 7 })
    );
}

#[test]
fn signatures_verify_for_every_parity_combination() {
    // Group key and aggregate nonce parities are independent; keep running
    // fresh DKGs and signing sessions until all four combinations have been
    // exercised.
    let mut rng = thread_rng();
    let mut seen = [[false; 2]; 2];
    let mut attempts = 0;
    while seen.iter().flatten().any(|hit| !*hit) {
        attempts += 1;
        assert!(attempts <= 256, "parity combinations should appear quickly");

        let mesh = run_dkg(&[0.5, 0.5], 1, 4);
        let message_hash: [u8; 32] = Sha256::digest([attempts as u8]).into();

        let mut nonces = BTreeMap::new();
        let mut commitments = BTreeMap::new();
        let mut key_ranges = BTreeMap::new();
        for position in mesh.ranges.keys() {
            let (signing_nonces, signing_commitments) = round1::commit(&mut rng);
            nonces.insert(*position, signing_nonces);
            commitments.insert(*position, signing_commitments);
            key_ranges.insert(*position, mesh.ranges[position]);
        }
        let signing_package = SigningPackage::new(message_hash, commitments, key_ranges).unwrap();

        let key_even = group_key(&mesh).has_even_y();
        let nonce_even = signing_package.group_commitment().unwrap().has_even_y();

        let mut signature_shares = BTreeMap::new();
        for (position, signing_nonces) in &nonces {
            let share = sign_weighted(
                &signing_package,
                signing_nonces,
                &mesh.key_packages[position],
            )
            .unwrap();
            signature_shares.insert(*position, share);
        }
        let signature = aggregate(
            &signing_package,
            &signature_shares,
            &mesh.public_key_package,
        )
        .unwrap();
        group_key(&mesh).verify(&message_hash, &signature).unwrap();

        seen[key_even as usize][nonce_even as usize] = true;
    }
}

#[test]
fn tampered_partial_signature_is_rejected() {
    let mesh = run_dkg(&[0.5, 0.5], 1, 4);
    let message_hash = [7u8; 32];
    let mut rng = thread_rng();

    let mut nonces = BTreeMap::new();
    let mut commitments = BTreeMap::new();
    let mut key_ranges = BTreeMap::new();
    for position in mesh.ranges.keys() {
        let (signing_nonces, signing_commitments) = round1::commit(&mut rng);
        nonces.insert(*position, signing_nonces);
        commitments.insert(*position, signing_commitments);
        key_ranges.insert(*position, mesh.ranges[position]);
    }
    let signing_package = SigningPackage::new(message_hash, commitments, key_ranges).unwrap();

    let culprit = *mesh.ranges.keys().next().unwrap();
    let share = sign_weighted(&signing_package, &nonces[&culprit], &mesh.key_packages[&culprit])
        .unwrap();

    // Flip one bit of the response.
    let mut bytes = share.serialize();
    bytes[63] ^= 1;
    let tampered = wsts_core::round2::SignatureShare::deserialize(&bytes).unwrap();

    assert_eq!(
        verify_share_weighted(
            culprit,
            &tampered,
            &signing_package,
            &mesh.public_key_package,
        ),
        Err(Error::InvalidSignatureShare { culprit })
    );
}
