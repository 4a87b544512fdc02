//! BIP-340 Schnorr signatures over secp256k1.

use core::fmt::{self, Debug};

use k256::{ProjectivePoint, Scalar};

use crate::serialization::{point_from_x_only, scalar_from_bytes, scalar_to_bytes, x_only};
use crate::Error;

/// A Schnorr signature `(R, z)`.
///
/// Also the shape of a DKG proof of knowledge, which is a Schnorr signature
/// under the prover's constant-term commitment.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Signature {
    /// The commitment `R` to the signature nonce.
    pub(crate) R: ProjectivePoint,
    /// The response `z` to the challenge.
    pub(crate) z: Scalar,
}

impl Signature {
    /// Create a new signature.
    pub(crate) fn new(R: ProjectivePoint, z: Scalar) -> Self {
        Self { R, z }
    }

    /// Serialize in compact 64-byte BIP-340 form with an x-only `R` point.
    pub fn serialize(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&x_only(&self.R));
        bytes[32..].copy_from_slice(&scalar_to_bytes(&self.z));
        bytes
    }

    /// Deserialize from the compact 64-byte BIP-340 form. The `R` point
    /// resolves to the even-Y candidate, per BIP-340.
    pub fn deserialize(bytes: &[u8; 64]) -> Result<Self, Error> {
        let r_bytes: [u8; 32] = bytes[..32].try_into().expect("correct length");
        let z_bytes: [u8; 32] = bytes[32..].try_into().expect("correct length");

        let R = point_from_x_only(&r_bytes).map_err(|_| Error::MalformedSignature)?;
        let z = scalar_from_bytes(&z_bytes).map_err(|_| Error::MalformedSignature)?;

        Ok(Self { R, z })
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("R", &hex::encode(x_only(&self.R)))
            .field("z", &hex::encode(scalar_to_bytes(&self.z)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use crate::algebra::{even_y_normalize, random_nonzero};

    use super::*;

    #[test]
    fn codec_roundtrip_normalizes_to_even_y() {
        let mut rng = thread_rng();
        for _ in 0..16 {
            let (point, _) = even_y_normalize(ProjectivePoint::GENERATOR * random_nonzero(&mut rng));
            let signature = Signature::new(point, random_nonzero(&mut rng));
            let decoded = Signature::deserialize(&signature.serialize()).unwrap();
            assert_eq!(decoded, signature);
        }
    }
}
