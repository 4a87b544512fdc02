//! A full in-process validator mesh for driver tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, TxOut, Txid};
use rand::thread_rng;

use wsts_core::ParticipantId;
use wsts_vault::checkpoint::{vault_script, CheckpointRecord, UtxoView};
use wsts_vault::storage::Storage;
use wsts_vault::{Config, Validator, ValidatorThreads};

/// A UTXO view shared by every validator in the mesh and mutable from the
/// test, standing in for the confirmed chain state.
#[derive(Clone, Default)]
pub struct SharedUtxoView {
    utxos: Arc<Mutex<HashMap<OutPoint, TxOut>>>,
}

impl SharedUtxoView {
    pub fn insert(&self, outpoint: OutPoint, output: TxOut) {
        self.utxos.lock().unwrap().insert(outpoint, output);
    }
}

impl UtxoView for SharedUtxoView {
    fn fetch_prev_output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.utxos.lock().unwrap().get(outpoint).cloned()
    }
}

/// A fully-connected mesh of spawned validators.
pub struct TestNet {
    pub validators: Vec<Arc<Validator>>,
    pub utxo_view: SharedUtxoView,
    threads: Vec<ValidatorThreads>,
}

impl TestNet {
    /// Spawn `weights.len()` connected validators.
    pub fn spawn(weights: &[f64], threshold: u16, max_keys: u64) -> Self {
        let participants = weights.len() as u32;
        let utxo_view = SharedUtxoView::default();

        let validators: Vec<Arc<Validator>> = (1..=participants)
            .map(|position| {
                let mut config = Config::new(
                    ParticipantId::new(position).unwrap(),
                    participants,
                    threshold,
                    max_keys,
                );
                // Tests poll aggressively and CI machines stall; give
                // too-early messages plenty of redelivery headroom.
                config.max_redelivery = 50;
                config.redelivery_delay = Duration::from_millis(20);
                config.heartbeat = Duration::from_millis(500);
                Arc::new(Validator::new(
                    config,
                    Storage::new(),
                    Arc::new(utxo_view.clone()),
                ))
            })
            .collect();

        for validator in &validators {
            for peer in &validators {
                validator.connect(peer.handle());
            }
        }

        let threads = validators
            .iter()
            .map(|validator| validator.spawn().unwrap())
            .collect();

        Self {
            validators,
            utxo_view,
            threads,
        }
    }

    pub fn validator(&self, position: u32) -> &Arc<Validator> {
        &self.validators[position as usize - 1]
    }

    /// Drive the full DKG: weights, proofs, shares; blocks until every
    /// validator reports `DkgComplete`.
    pub fn run_dkg(&self, weights: &[f64]) {
        for (validator, weight) in self.validators.iter().zip(weights) {
            validator.send_vp_to_all(*weight).unwrap();
        }
        for validator in &self.validators {
            validator.derive_and_send_proofs(&mut thread_rng()).unwrap();
        }
        for validator in &self.validators {
            // Weight announcements may still be in flight.
            retry(|| validator.derive_and_send_secret_shares());
        }
        self.wait_for(
            |validator| validator.phase() >= wsts_vault::Phase::DkgComplete,
            "DKG completion",
        );
    }

    /// Seed the genesis checkpoint on every validator and fund the vault
    /// UTXO with the given value.
    pub fn seed_vault(&self, value: u64) -> CheckpointRecord {
        let group_key = self.validator(1).group_verifying_key().unwrap();
        let record = CheckpointRecord {
            txid: Txid::from_byte_array([0xaa; 32]),
            vout: 0,
        };
        self.utxo_view.insert(
            record.outpoint(),
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: vault_script(&group_key),
            },
        );
        for validator in &self.validators {
            validator.seed_genesis_checkpoint(record);
        }
        record
    }

    /// Wait until the predicate holds for every validator.
    pub fn wait_for(&self, predicate: impl Fn(&Validator) -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if self.validators.iter().all(|v| predicate(v)) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Stop every validator and join its receive loops.
    pub fn shutdown(self) {
        for validator in &self.validators {
            validator.stop();
        }
        for threads in self.threads {
            threads.join();
        }
    }
}

/// Retry an operation that legitimately races message delivery.
pub fn retry<T>(mut operation: impl FnMut() -> Result<T, wsts_vault::Error>) -> T {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match operation() {
            Ok(value) => return value,
            Err(wsts_vault::Error::NotReady) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(error) => panic!("operation failed: {error}"),
        }
    }
}
