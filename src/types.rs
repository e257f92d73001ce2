// =============================================================================
// Shared types used across the signal engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Keys
// =============================================================================

/// Owner scope used when uniqueness is enforced globally per instrument.
pub const GLOBAL_OWNER: &str = "global";

/// Identity of the "at most one active signal" slot: who owns it and which
/// instrument it is for.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignalKey {
    pub owner: String,
    pub instrument: String,
}

impl SignalKey {
    pub fn new(owner: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            instrument: instrument.into(),
        }
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.instrument)
    }
}

// =============================================================================
// Direction & status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

/// Why a signal left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "TakeProfit"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Active,
    ClosedTP,
    ClosedSL,
    ClosedManual,
}

impl SignalStatus {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl From<CloseReason> for SignalStatus {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::TakeProfit => Self::ClosedTP,
            CloseReason::StopLoss => Self::ClosedSL,
            CloseReason::Manual => Self::ClosedManual,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::ClosedTP => write!(f, "ClosedTP"),
            Self::ClosedSL => write!(f, "ClosedSL"),
            Self::ClosedManual => write!(f, "ClosedManual"),
        }
    }
}

// =============================================================================
// Proposed signal
// =============================================================================

/// Output of the decision engine: a directional setup that has not yet been
/// admitted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedSignal {
    pub direction: Direction,
    pub entry: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub rationale: String,
}

impl ProposedSignal {
    /// Long: TP > entry > SL. Short: TP < entry < SL. All prices finite.
    pub fn targets_consistent(&self) -> bool {
        targets_consistent(self.direction, self.entry, self.take_profit, self.stop_loss)
    }
}

pub fn targets_consistent(direction: Direction, entry: f64, take_profit: f64, stop_loss: f64) -> bool {
    if !(entry.is_finite() && take_profit.is_finite() && stop_loss.is_finite()) {
        return false;
    }
    match direction {
        Direction::Long => take_profit > entry && entry > stop_loss,
        Direction::Short => take_profit < entry && entry < stop_loss,
    }
}

// =============================================================================
// Signal
// =============================================================================

/// A signal record as owned by the signal store. Closed signals are kept as
/// history and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub owner_key: String,
    pub instrument_key: String,
    pub direction: Direction,
    pub entry: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    /// Candle interval the setup was derived from, e.g. "5m".
    pub timeframe: String,
    #[serde(default)]
    pub rationale: String,
    pub opened_at: DateTime<Utc>,
    pub status: SignalStatus,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_price: Option<f64>,
}

impl Signal {
    pub fn key(&self) -> SignalKey {
        SignalKey::new(self.owner_key.clone(), self.instrument_key.clone())
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({}) entry={} tp={} sl={} [{}]",
            self.instrument_key,
            self.direction,
            self.timeframe,
            self.entry,
            self.take_profit,
            self.stop_loss,
            self.status
        )
    }
}

// =============================================================================
// Lifecycle events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Opened,
    ClosedTP,
    ClosedSL,
    ClosedManual,
}

impl From<CloseReason> for EventKind {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::TakeProfit => Self::ClosedTP,
            CloseReason::StopLoss => Self::ClosedSL,
            CloseReason::Manual => Self::ClosedManual,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "Opened"),
            Self::ClosedTP => write!(f, "ClosedTP"),
            Self::ClosedSL => write!(f, "ClosedSL"),
            Self::ClosedManual => write!(f, "ClosedManual"),
        }
    }
}

/// Event handed to the notification sink whenever a signal opens or closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub owner_key: String,
    pub instrument_key: String,
    pub signal: Signal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn opened(signal: &Signal) -> Self {
        Self {
            kind: EventKind::Opened,
            owner_key: signal.owner_key.clone(),
            instrument_key: signal.instrument_key.clone(),
            signal: signal.clone(),
            price: Some(signal.entry),
            at: Utc::now(),
        }
    }

    pub fn closed(signal: &Signal, reason: CloseReason) -> Self {
        Self {
            kind: reason.into(),
            owner_key: signal.owner_key.clone(),
            instrument_key: signal.instrument_key.clone(),
            signal: signal.clone(),
            price: signal.close_price,
            at: Utc::now(),
        }
    }
}
