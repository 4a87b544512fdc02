#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod checkpoint;
mod error;
pub mod message;
pub mod storage;
pub mod validator;

pub use error::Error;
pub use validator::{Config, PeerHandle, Phase, Validator, ValidatorThreads};
