//! Outcomes of the signing guards.

use thiserror::Error;

/// The verdict of a guard on a signing request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// The request is new and safe; it has been recorded.
    Allow,
    /// An identical request was already recorded, so signing again is safe.
    Idempotent,
    /// Signing would be slashable.
    Deny(Violation),
}

/// A slashing condition that a signing request would violate.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum Violation {
    #[error("source epoch is after target epoch")]
    InvalidRange,
    #[error("request is at or below the low watermark")]
    BelowWatermark,
    #[error("a different block was already signed for this slot")]
    DoubleBlock,
    #[error("a different attestation was already signed for this target epoch")]
    DoubleVote,
    #[error("attestation surrounds or is surrounded by a signed attestation")]
    SurroundVote,
}

impl Violation {
    /// A short machine-friendly reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRange => "invalid range",
            Self::BelowWatermark => "below watermark",
            Self::DoubleBlock => "double block",
            Self::DoubleVote => "double vote",
            Self::SurroundVote => "surround vote",
        }
    }
}
