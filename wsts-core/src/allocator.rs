//! Weight discretization and virtual-key range allocation.
//!
//! Each participant's voting power, a rational weight in `[0, 1]`, is
//! discretized into a count of virtual keys out of a total of `N`, and the
//! counts are laid out as a contiguous, disjoint partition of `[1, N]`.
//! Positions after the first receive `max(1, ⌊w·N⌋)` keys; participant 1
//! absorbs the rounding remainder so the counts sum to exactly `N`.

use std::collections::BTreeMap;

use crate::identifier::{KeyIndex, ParticipantId};
use crate::Error;

/// A half-open range `[start, end)` of virtual key indices owned by one
/// participant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    /// First owned key index.
    pub start: u64,
    /// One past the last owned key index.
    pub end: u64,
}

impl KeyRange {
    /// Create a new range. `start` must be nonzero and below `end`.
    pub fn new(start: u64, end: u64) -> Result<Self, Error> {
        if start == 0 {
            return Err(Error::InvalidZeroIndex);
        }
        if start >= end {
            return Err(Error::ImbalancedWeights);
        }
        Ok(Self { start, end })
    }

    /// The number of keys in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range is empty. Allocated ranges never are.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether the range contains the given key.
    pub fn contains(&self, key: KeyIndex) -> bool {
        (self.start..self.end).contains(&key.get())
    }

    /// Iterate over the owned key indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = KeyIndex> {
        (self.start..self.end).map(|k| KeyIndex::new(k).expect("range starts are nonzero"))
    }

    /// Serialize as two 8-byte big-endian integers.
    pub fn serialize(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.start.to_be_bytes());
        bytes[8..].copy_from_slice(&self.end.to_be_bytes());
        bytes
    }

    /// Deserialize from the two 8-byte big-endian integer form.
    pub fn deserialize(bytes: &[u8; 16]) -> Result<Self, Error> {
        let start = u64::from_be_bytes(bytes[..8].try_into().expect("correct length"));
        let end = u64::from_be_bytes(bytes[8..].try_into().expect("correct length"));
        Self::new(start, end)
    }
}

/// Discretize the weight vector into key counts and assign contiguous
/// ranges partitioning `[1, max_keys]`.
///
/// `weights[i]` is the weight of position `i + 1`; weights must sum to 1.
/// Every position after the first receives `max(1, ⌊w·N⌋)` keys and
/// position 1 receives the remainder. Fails with
/// [`Error::ImbalancedWeights`] when the remainder leaves position 1
/// without a key.
pub fn allocate(
    weights: &[f64],
    max_keys: u64,
) -> Result<BTreeMap<ParticipantId, KeyRange>, Error> {
    if weights.is_empty() {
        return Err(Error::ImbalancedWeights);
    }

    let mut counts = vec![0u64; weights.len()];
    let mut claimed = 0u64;
    for (i, weight) in weights.iter().enumerate().skip(1) {
        if !(0.0..=1.0).contains(weight) {
            return Err(Error::ImbalancedWeights);
        }
        let count = ((weight * max_keys as f64).floor() as u64).max(1);
        counts[i] = count;
        claimed += count;
    }
    if claimed >= max_keys {
        return Err(Error::ImbalancedWeights);
    }
    counts[0] = max_keys - claimed;

    let mut ranges = BTreeMap::new();
    let mut start = 1u64;
    for (i, count) in counts.iter().enumerate() {
        let position = ParticipantId::new(i as u32 + 1)?;
        ranges.insert(position, KeyRange::new(start, start + count)?);
        start += count;
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn assert_partition(ranges: &BTreeMap<ParticipantId, KeyRange>, max_keys: u64) {
        let mut next = 1u64;
        for range in ranges.values() {
            assert_eq!(range.start, next);
            assert!(range.len() >= 1);
            next = range.end;
        }
        assert_eq!(next, max_keys + 1);
    }

    #[test]
    fn equal_thirds() {
        let ranges = allocate(&[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], 3).unwrap();
        assert_partition(&ranges, 3);
        for range in ranges.values() {
            assert_eq!(range.len(), 1);
        }
    }

    #[test]
    fn weighted_ten_keys() {
        let ranges = allocate(&[0.40, 0.30, 0.20, 0.10], 10).unwrap();
        assert_partition(&ranges, 10);
        let get = |p: u32| ranges[&ParticipantId::new(p).unwrap()];
        assert_eq!(get(1), KeyRange { start: 1, end: 5 });
        assert_eq!(get(2), KeyRange { start: 5, end: 8 });
        assert_eq!(get(3), KeyRange { start: 8, end: 10 });
        assert_eq!(get(4), KeyRange { start: 10, end: 11 });
    }

    #[test]
    fn tiny_weights_round_up_to_one_key() {
        let ranges = allocate(&[0.97, 0.01, 0.01, 0.01], 100).unwrap();
        assert_partition(&ranges, 100);
        for position in 2..=4 {
            assert_eq!(ranges[&ParticipantId::new(position).unwrap()].len(), 1);
        }
    }

    #[test]
    fn first_participant_must_keep_a_key() {
        // Three participants each rounded up to one key out of three leaves
        // nothing for participant 1.
        assert_eq!(
            allocate(&[0.0, 0.4, 0.3, 0.3], 3),
            Err(Error::ImbalancedWeights)
        );
    }

    #[test]
    fn out_of_range_share_detection() {
        let ranges = allocate(&[0.40, 0.30, 0.20, 0.10], 10).unwrap();
        let p2 = ranges[&ParticipantId::new(2).unwrap()];
        assert!(p2.contains(KeyIndex::new(7).unwrap()));
        assert!(!p2.contains(KeyIndex::new(8).unwrap()));
    }

    #[test]
    fn range_codec_roundtrip() {
        let range = KeyRange::new(5, 8).unwrap();
        assert_eq!(KeyRange::deserialize(&range.serialize()).unwrap(), range);
    }

    proptest! {
        #[test]
        fn allocation_partitions_exactly(raw in prop::collection::vec(1u32..1000, 2..12)) {
            let total: u32 = raw.iter().sum();
            let weights: Vec<f64> = raw.iter().map(|w| *w as f64 / total as f64).collect();
            let max_keys = 256u64;
            if let Ok(ranges) = allocate(&weights, max_keys) {
                assert_partition(&ranges, max_keys);
            }
        }
    }
}
