//! WSTS error types

use thiserror::Error;

use crate::identifier::{KeyIndex, ParticipantId};

/// An error related to the WSTS protocol math.
#[non_exhaustive]
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// The proof of knowledge of a contributed secret is not valid.
    #[error("The proof of knowledge is not valid.")]
    InvalidProofOfKnowledge {
        /// The participant whose proof failed verification.
        culprit: ParticipantId,
    },
    /// A secret share is inconsistent with its dealer's polynomial commitment.
    #[error("Invalid secret share.")]
    InvalidSecretShare {
        /// The dealer whose share failed batch verification.
        culprit: ParticipantId,
    },
    /// Partial signature verification failed.
    #[error("Invalid signature share.")]
    InvalidSignatureShare {
        /// The participant whose partial signature failed verification.
        culprit: ParticipantId,
    },
    /// Signature verification failed.
    #[error("Invalid signature.")]
    InvalidSignature,
    /// The honest virtual-key set is too small to meet the threshold.
    #[error("Honest key count {have} is below the required {need}.")]
    InsufficientHonestKeys {
        /// Honest virtual keys available.
        have: u64,
        /// Keys required (threshold + 1).
        need: u64,
    },
    /// Weight discretization left participant 1 without a key.
    #[error("Weights cannot be discretized into the requested key count.")]
    ImbalancedWeights,
    /// A key index does not belong to the set under consideration.
    #[error("Unknown virtual key.")]
    UnknownKey {
        /// The offending key index.
        key: KeyIndex,
    },
    /// A participant position does not belong to the set under consideration.
    #[error("Unknown participant.")]
    UnknownParticipant {
        /// The offending position.
        position: ParticipantId,
    },
    /// The same virtual key appeared twice in an interpolation set.
    #[error("Duplicated virtual key.")]
    DuplicatedKey,
    /// A participant position or key index was zero.
    #[error("Positions and key indices must be nonzero.")]
    InvalidZeroIndex,
    /// The encoding of a scalar was malformed.
    #[error("Malformed scalar encoding.")]
    MalformedScalar,
    /// The encoding of a curve point was malformed.
    #[error("Malformed point encoding.")]
    MalformedPoint,
    /// The encoding of a signature was malformed.
    #[error("Malformed signature encoding.")]
    MalformedSignature,
    /// A point that must not be the identity was the identity.
    #[error("Unexpected identity element.")]
    IdentityElement,
    /// A commitment vector was missing or empty.
    #[error("Missing polynomial commitment.")]
    MissingCommitment,
    /// A commitment vector had the wrong number of coefficients.
    #[error("Incorrect number of coefficient commitments.")]
    IncorrectNumberOfCommitments,
}

impl Error {
    /// Return the participant that caused the error, if attributable.
    ///
    /// Used by drivers to flag dishonest participants and exclude them from
    /// the remainder of a signing session.
    pub fn culprit(&self) -> Option<ParticipantId> {
        match self {
            Error::InvalidProofOfKnowledge { culprit }
            | Error::InvalidSecretShare { culprit }
            | Error::InvalidSignatureShare { culprit } => Some(*culprit),
            _ => None,
        }
    }
}
