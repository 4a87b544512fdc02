//! Keyed blob storage with two logical namespaces.
//!
//! The `Protocol` namespace holds state that is logically replicated
//! on-chain (weights, key ranges, commitments, nonce commitments, partial
//! signatures, withdrawal batches, checkpoints); the `Local` namespace is
//! private to the owning validator (received secret shares and the derived
//! long-term shares). Values are the serialized forms defined by the wire
//! protocol: scalars 32 bytes, points 33 bytes compressed, signatures 64
//! bytes.
//!
//! A [`Storage`] handle is a cheap clone over shared state; the owning
//! validator is the only writer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// The two logical storage namespaces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// Replicated protocol state.
    Protocol,
    /// Validator-private state.
    Local,
}

#[derive(Default)]
struct Inner {
    protocol: BTreeMap<String, Vec<u8>>,
    local: BTreeMap<String, Vec<u8>>,
}

impl Inner {
    fn map(&mut self, namespace: Namespace) -> &mut BTreeMap<String, Vec<u8>> {
        match namespace {
            Namespace::Protocol => &mut self.protocol,
            Namespace::Local => &mut self.local,
        }
    }
}

/// A two-level keyed byte-blob map.
#[derive(Clone, Default)]
pub struct Storage {
    inner: Arc<Mutex<Inner>>,
}

impl Storage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under the given namespace and key.
    pub fn put(&self, namespace: Namespace, key: impl Into<String>, value: Vec<u8>) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.map(namespace).insert(key.into(), value);
    }

    /// Fetch a value.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.map(namespace).get(key).cloned()
    }

    /// Whether a key is present.
    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.map(namespace).contains_key(key)
    }

    /// The number of keys under the given prefix.
    pub fn count_prefix(&self, namespace: Namespace, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner
            .map(namespace)
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count()
    }

    /// The key/value pairs under the given prefix, in key order.
    pub fn list_prefix(&self, namespace: Namespace, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner
            .map(namespace)
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Remove every key under the given prefix.
    pub fn remove_prefix(&self, namespace: Namespace, prefix: &str) {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner
            .map(namespace)
            .retain(|key, _| !key.starts_with(prefix));
    }
}

/// Storage key layout.
pub mod keys {
    /// Prefix of the ordered withdrawal batch.
    pub const TRANSACTIONS_PREFIX: &str = "transactions/";
    /// Prefix of the received secret shares.
    pub const SECRET_SHARES_PREFIX: &str = "secret_shares/";

    /// `vp/{position}` -- a participant's weight.
    pub fn vp(position: u32) -> String {
        format!("vp/{position}")
    }

    /// `key_range/{position}` -- a participant's virtual-key range.
    pub fn key_range(position: u32) -> String {
        format!("key_range/{position}")
    }

    /// `poly_commitments/{position}/{j}` -- one coefficient commitment.
    pub fn poly_commitment(position: u32, coefficient: u16) -> String {
        format!("poly_commitments/{position}/{coefficient}")
    }

    /// `nonce_commitments/{slot}/{position}` -- a participant's `(D, E)`
    /// pair for one slot.
    pub fn nonce_commitments(slot: u64, position: u32) -> String {
        format!("nonce_commitments/{slot}/{position}")
    }

    /// `public_nonce_commitments/{slot}/{position}` -- the derived bound
    /// commitment share `R_i`.
    pub fn public_nonce_commitment(slot: u64, position: u32) -> String {
        format!("public_nonce_commitments/{slot}/{position}")
    }

    /// `adapt_sig/{slot}/{position}` -- a stored partial signature.
    pub fn adapt_sig(slot: u64, position: u32) -> String {
        format!("adapt_sig/{slot}/{position}")
    }

    /// `transactions/{index}` -- one withdrawal, zero-padded so key order is
    /// batch order.
    pub fn transaction(index: u32) -> String {
        format!("{TRANSACTIONS_PREFIX}{index:08}")
    }

    /// `checkpoint/{height}` -- a checkpoint record.
    pub fn checkpoint(height: u64) -> String {
        format!("checkpoint/{height}")
    }

    /// `secret_shares/{source}/{key}` -- a received share.
    pub fn secret_share(source: u32, key: u64) -> String {
        format!("{SECRET_SHARES_PREFIX}{source}/{key}")
    }

    /// `long_term_secret_shares/{key}` -- a derived signing share.
    pub fn long_term_share(key: u64) -> String {
        format!("long_term_secret_shares/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_isolated() {
        let storage = Storage::new();
        storage.put(Namespace::Protocol, "vp/1", vec![1]);
        storage.put(Namespace::Local, "vp/1", vec![2]);

        assert_eq!(storage.get(Namespace::Protocol, "vp/1"), Some(vec![1]));
        assert_eq!(storage.get(Namespace::Local, "vp/1"), Some(vec![2]));
    }

    #[test]
    fn prefix_listing_preserves_batch_order() {
        let storage = Storage::new();
        for index in [10u32, 2, 0, 1] {
            storage.put(
                Namespace::Protocol,
                keys::transaction(index),
                index.to_be_bytes().to_vec(),
            );
        }

        let listed: Vec<u32> = storage
            .list_prefix(Namespace::Protocol, keys::TRANSACTIONS_PREFIX)
            .into_iter()
            .map(|(_, value)| u32::from_be_bytes(value.try_into().unwrap()))
            .collect();
        assert_eq!(listed, vec![0, 1, 2, 10]);
    }

    #[test]
    fn prefix_removal_and_counting() {
        let storage = Storage::new();
        storage.put(Namespace::Local, keys::secret_share(1, 1), vec![0; 32]);
        storage.put(Namespace::Local, keys::secret_share(2, 1), vec![0; 32]);
        storage.put(Namespace::Local, keys::long_term_share(1), vec![0; 32]);

        assert_eq!(storage.count_prefix(Namespace::Local, keys::SECRET_SHARES_PREFIX), 2);
        storage.remove_prefix(Namespace::Local, keys::SECRET_SHARES_PREFIX);
        assert_eq!(storage.count_prefix(Namespace::Local, keys::SECRET_SHARES_PREFIX), 0);
        assert!(storage.contains(Namespace::Local, &keys::long_term_share(1)));
    }

    #[test]
    fn handles_share_state() {
        let storage = Storage::new();
        let clone = storage.clone();
        clone.put(Namespace::Protocol, "vp/1", vec![9]);
        assert_eq!(storage.get(Namespace::Protocol, "vp/1"), Some(vec![9]));
    }
}
