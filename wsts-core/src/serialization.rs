//! Fixed-width encodings for scalars and points.
//!
//! Scalars are 32-byte big-endian; points are 33-byte SEC1 compressed;
//! BIP-340 x-only points are 32 bytes. The identity is never serialized.

use k256::elliptic_curve::{
    point::AffineCoordinates,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    PrimeField,
};
use k256::{AffinePoint, ProjectivePoint, Scalar};

use crate::Error;

/// Serialize a scalar as 32 big-endian bytes.
pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

/// Deserialize a scalar from 32 big-endian bytes, rejecting unreduced values.
pub(crate) fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar, Error> {
    let field_bytes: &k256::FieldBytes = bytes.into();
    match Option::<Scalar>::from(Scalar::from_repr(*field_bytes)) {
        Some(scalar) => Ok(scalar),
        None => Err(Error::MalformedScalar),
    }
}

/// Serialize a point in 33-byte SEC1 compressed form.
pub(crate) fn point_to_bytes(point: &ProjectivePoint) -> Result<[u8; 33], Error> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(Error::IdentityElement);
    }
    let mut fixed = [0u8; 33];
    let encoded = point.to_affine().to_encoded_point(true);
    fixed.copy_from_slice(encoded.as_bytes());
    Ok(fixed)
}

/// Deserialize a point from 33-byte SEC1 compressed form.
pub(crate) fn point_from_bytes(bytes: &[u8; 33]) -> Result<ProjectivePoint, Error> {
    let encoded = k256::EncodedPoint::from_bytes(bytes).map_err(|_| Error::MalformedPoint)?;
    match Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded)) {
        Some(point) => Ok(ProjectivePoint::from(point)),
        None => Err(Error::MalformedPoint),
    }
}

/// The BIP-340 x-only form of a point.
pub(crate) fn x_only(point: &ProjectivePoint) -> [u8; 32] {
    point.to_affine().x().into()
}

/// Deserialize a BIP-340 x-only point, resolving to the even-Y candidate.
pub(crate) fn point_from_x_only(bytes: &[u8; 32]) -> Result<ProjectivePoint, Error> {
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(bytes);
    point_from_bytes(&compressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_unserializable() {
        assert_eq!(
            point_to_bytes(&ProjectivePoint::IDENTITY),
            Err(Error::IdentityElement)
        );
    }

    #[test]
    fn point_roundtrip() {
        let p = ProjectivePoint::GENERATOR * Scalar::from(11u64);
        let bytes = point_to_bytes(&p).unwrap();
        assert_eq!(point_from_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn unreduced_scalar_rejected() {
        assert_eq!(scalar_from_bytes(&[0xff; 32]), Err(Error::MalformedScalar));
    }
}
