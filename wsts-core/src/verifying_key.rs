//! The group verifying key.

use core::fmt::{self, Debug};

use k256::ProjectivePoint;

use crate::algebra::{challenge, even_y_normalize, has_even_y};
use crate::serialization::{point_from_bytes, point_to_bytes, x_only};
use crate::{Error, Signature};

/// The group public key `Y = g^{∑_i a_{i,0}}`, under which aggregated
/// signatures verify as plain BIP-340 Schnorr signatures.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct VerifyingKey {
    element: ProjectivePoint,
}

impl VerifyingKey {
    /// Create a new verifying key from a group element.
    pub(crate) fn new(element: ProjectivePoint) -> Self {
        Self { element }
    }

    /// The underlying element.
    pub(crate) fn to_element(self) -> ProjectivePoint {
        self.element
    }

    /// Whether the key has an even Y coordinate. When it does not, signers
    /// conceptually negate their signing shares at signing and verification
    /// time; the key itself is never mutated.
    pub fn has_even_y(&self) -> bool {
        has_even_y(&self.element)
    }

    /// Serialize in 33-byte SEC1 compressed form.
    pub fn serialize(&self) -> Result<[u8; 33], Error> {
        point_to_bytes(&self.element)
    }

    /// The BIP-340 x-only form, as committed to in P2TR outputs.
    pub fn serialize_x_only(&self) -> [u8; 32] {
        x_only(&self.element)
    }

    /// Deserialize from 33-byte SEC1 compressed form.
    pub fn deserialize(bytes: &[u8; 33]) -> Result<Self, Error> {
        Ok(Self::new(point_from_bytes(bytes)?))
    }

    /// Verify a purported BIP-340 `signature` over `message` under this key.
    ///
    /// `R' = g^z · Y^{-c}` must be a non-identity, even-Y point whose X
    /// coordinate matches the signature's `R`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        let (even_key, _) = even_y_normalize(self.element);
        let c = challenge(&signature.R, &self.element, message);

        let r_prime = ProjectivePoint::GENERATOR * signature.z - even_key * c;
        if r_prime == ProjectivePoint::IDENTITY
            || !has_even_y(&r_prime)
            || x_only(&r_prime) != x_only(&signature.R)
        {
            return Err(Error::InvalidSignature);
        }
        Ok(())
    }
}

impl Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VerifyingKey")
            .field(&hex::encode(self.serialize_x_only()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;

    use crate::algebra::random_nonzero;
    use crate::Scalar;

    use super::*;

    /// Single-party BIP-340 signing, used to sanity-check verification for
    /// both key parities.
    fn sign_single(secret: Scalar, message: &[u8], nonce: Scalar) -> (VerifyingKey, Signature) {
        let key = VerifyingKey::new(ProjectivePoint::GENERATOR * secret);
        let secret = if key.has_even_y() { secret } else { -secret };

        let (big_r, negated) = even_y_normalize(ProjectivePoint::GENERATOR * nonce);
        let k = if negated { -nonce } else { nonce };

        let c = challenge(&big_r, &key.to_element(), message);
        (key, Signature::new(big_r, k + c * secret))
    }

    #[test]
    fn verifies_for_both_key_parities() {
        let mut rng = thread_rng();
        let message = b"vault checkpoint";

        let mut seen = [false; 2];
        while seen != [true; 2] {
            let secret = random_nonzero(&mut rng);
            let (key, signature) = sign_single(secret, message, random_nonzero(&mut rng));
            key.verify(message, &signature).unwrap();
            seen[key.has_even_y() as usize] = true;

            // A different message must not verify.
            assert_eq!(
                key.verify(b"other message", &signature),
                Err(Error::InvalidSignature)
            );
        }
    }
}
