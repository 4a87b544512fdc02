#![allow(non_snake_case)]
#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod algebra;
pub mod allocator;
mod error;
mod identifier;
pub mod keys;
pub mod round1;
pub mod round2;
mod serialization;
mod signature;
mod verifying_key;

pub use error::Error;
pub use identifier::{KeyIndex, ParticipantId};
pub use signature::Signature;
pub use verifying_key::VerifyingKey;

// The concrete curve types; callers interoperating with other secp256k1
// tooling can name them without depending on `k256` directly.
pub use k256::{ProjectivePoint, Scalar};
