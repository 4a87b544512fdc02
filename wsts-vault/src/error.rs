//! Driver error types

use thiserror::Error;

/// An error raised by the vault driver.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the threshold-signature engine.
    #[error(transparent)]
    Core(#[from] wsts_core::Error),
    /// A received secret share is keyed outside the local key range.
    #[error("share for key {key} from participant {participant} is outside the local range")]
    ShareOutOfRange {
        /// The sending participant.
        participant: u32,
        /// The offending key index.
        key: u64,
    },
    /// The withdrawal batch plus fee exceeds the vault balance.
    #[error("batch of {required} sat exceeds the vault balance of {available} sat")]
    InsufficientVault {
        /// Batch amounts plus gas fee.
        required: u64,
        /// Value of the previous checkpoint output.
        available: u64,
    },
    /// The previous checkpoint output does not pay the current group key.
    #[error("previous checkpoint output does not pay the current group key")]
    VaultScriptMismatch,
    /// No checkpoint is recorded at the required height.
    #[error("no checkpoint recorded at height {height}")]
    MissingCheckpoint {
        /// The missing height.
        height: u64,
    },
    /// The previous checkpoint outpoint is unknown to the UTXO view.
    #[error("previous checkpoint output not found in the UTXO view")]
    MissingPrevOutput,
    /// A message arrived before the state it depends on was ready and
    /// exhausted its redelivery budget.
    #[error("message precondition not met after {attempts} delivery attempts")]
    PreconditionNotMet {
        /// Deliveries attempted before giving up.
        attempts: u32,
    },
    /// The operation needs protocol state that has not been derived yet.
    #[error("the session is not ready for this operation")]
    NotReady,
    /// A peer channel is closed.
    #[error("transport closed")]
    TransportClosed,
    /// A message failed to decode.
    #[error("malformed message")]
    MalformedMessage,
    /// A message carried an unknown tag byte.
    #[error("unknown message tag {0}")]
    UnknownMessageTag(u8),
    /// Taproot sighash computation failed.
    #[error("taproot sighash: {0}")]
    Sighash(#[from] bitcoin::sighash::TaprootError),
}
