//! Participant and virtual-key identifiers

use core::fmt::{self, Debug};

use k256::Scalar;

use crate::Error;

/// A participant position.
///
/// Positions are dense integers in `[1, P]` where `P` is the number of
/// participants, assigned out-of-band and stable across protocol phases.
/// A position doubles as an x-coordinate-free label: virtual keys, not
/// positions, are the x-coordinates of the secret polynomials.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticipantId(u32);

impl ParticipantId {
    /// Create a new position. Must be nonzero.
    pub fn new(position: u32) -> Result<Self, Error> {
        if position == 0 {
            Err(Error::InvalidZeroIndex)
        } else {
            Ok(Self(position))
        }
    }

    /// The numeric position.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// The single-byte form used in challenge and binding-factor preimages.
    ///
    /// The wire protocol commits to the low 8 bits of the position, so
    /// deployments are limited to 255 participants.
    pub(crate) fn to_byte(self) -> u8 {
        self.0 as u8
    }
}

impl Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ParticipantId").field(&self.0).finish()
    }
}

impl TryFrom<u32> for ParticipantId {
    type Error = Error;

    fn try_from(n: u32) -> Result<Self, Error> {
        Self::new(n)
    }
}

/// A virtual key index.
///
/// Virtual keys are dense integers in `[1, N]` where `N` is the total
/// signing-power unit count. Each participant owns a contiguous, disjoint
/// range of them; the key index is the x-coordinate at which every secret
/// polynomial is evaluated for that key's share.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyIndex(u64);

impl KeyIndex {
    /// Create a new key index. Must be nonzero.
    pub fn new(index: u64) -> Result<Self, Error> {
        if index == 0 {
            Err(Error::InvalidZeroIndex)
        } else {
            Ok(Self(index))
        }
    }

    /// The numeric index.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// The key index as a scalar field element.
    pub fn to_scalar(&self) -> Scalar {
        Scalar::from(self.0)
    }
}

impl Debug for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyIndex").field(&self.0).finish()
    }
}

impl TryFrom<u64> for KeyIndex {
    type Error = Error;

    fn try_from(n: u64) -> Result<Self, Error> {
        Self::new(n)
    }
}
