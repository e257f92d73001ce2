// =============================================================================
// Rejection taxonomy for store and gating operations
// =============================================================================
//
// None of these are process-fatal. Callers decide how to surface them:
// AlreadyActive / NoSetup are informational, NotActive is a lost race,
// DataUnavailable is transient.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// An Active signal already exists for this (owner, instrument).
    #[error("a signal is already active for {0}")]
    AlreadyActive(String),

    /// The decision engine found no qualifying setup.
    #[error("no qualifying setup for {0}, try later")]
    NoSetup(String),

    /// Close attempted on a signal that is no longer Active.
    #[error("signal {0} is not active")]
    NotActive(String),

    /// No signal with this id exists.
    #[error("unknown signal {0}")]
    UnknownSignal(String),

    /// The requester is neither the owner of the signal nor an admin.
    #[error("{requester} may not close signal {signal_id}")]
    NotOwner { signal_id: String, requester: String },

    /// Instrument name is not a plain exchange symbol.
    #[error("invalid instrument {0:?}")]
    InvalidInstrument(String),

    /// Market data could not be fetched (error, timeout or malformed series).
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// Proposed targets violate the direction/price ordering.
    #[error("inconsistent targets: {0}")]
    InvalidTargets(String),

    /// The repository refused the write; store state was left unchanged.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl Rejection {
    /// Machine-readable code used by the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyActive(_) => "ALREADY_ACTIVE",
            Self::NoSetup(_) => "NO_SETUP",
            Self::NotActive(_) => "NOT_ACTIVE",
            Self::UnknownSignal(_) => "UNKNOWN_SIGNAL",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::InvalidInstrument(_) => "INVALID_INSTRUMENT",
            Self::DataUnavailable(_) => "DATA_UNAVAILABLE",
            Self::InvalidTargets(_) => "INVALID_TARGETS",
            Self::Storage(_) => "STORAGE",
        }
    }
}
