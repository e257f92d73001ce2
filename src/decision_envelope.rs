// =============================================================================
// Decision Envelope — auditable record of every signal / no-signal decision
// =============================================================================
//
// The decision engine runs a short pipeline of rule stages. The envelope
// captures the verdict of each stage so that every "no setup" answer can be
// explained after the fact.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::indicators::IndicatorSnapshot;
use crate::types::Direction;

/// Rule stage of the decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Data,
    Trend,
    Momentum,
    Volatility,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Trend => write!(f, "Trend"),
            Self::Momentum => write!(f, "Momentum"),
            Self::Volatility => write!(f, "Volatility"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Pass,
    Fail,
    /// Stage not reached because an earlier one failed.
    Skipped,
}

/// Complete record of one evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    /// Unique identifier (UUID v4).
    pub id: String,

    pub instrument: String,

    /// Direction suggested by the trend stage, if it got that far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,

    pub data_verdict: Verdict,
    pub trend_verdict: Verdict,
    pub momentum_verdict: Verdict,
    pub volatility_verdict: Verdict,

    /// True when a proposal was emitted.
    pub proposed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_stage: Option<Stage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<IndicatorSnapshot>,

    pub created_at: DateTime<Utc>,
}

impl DecisionEnvelope {
    /// Start an envelope with every stage skipped.
    pub fn new(instrument: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instrument: instrument.into(),
            direction: None,
            data_verdict: Verdict::Skipped,
            trend_verdict: Verdict::Skipped,
            momentum_verdict: Verdict::Skipped,
            volatility_verdict: Verdict::Skipped,
            proposed: false,
            blocking_stage: None,
            reason: None,
            snapshot: None,
            created_at: Utc::now(),
        }
    }

    pub fn pass(&mut self, stage: Stage) {
        *self.verdict_mut(stage) = Verdict::Pass;
    }

    /// Mark `stage` as the blocking stage.
    pub fn block(mut self, stage: Stage, reason: impl Into<String>) -> Self {
        *self.verdict_mut(stage) = Verdict::Fail;
        self.blocking_stage = Some(stage);
        self.reason = Some(reason.into());
        self
    }

    pub fn allow(mut self, reason: impl Into<String>) -> Self {
        self.proposed = true;
        self.reason = Some(reason.into());
        self
    }

    fn verdict_mut(&mut self, stage: Stage) -> &mut Verdict {
        match stage {
            Stage::Data => &mut self.data_verdict,
            Stage::Trend => &mut self.trend_verdict,
            Stage::Momentum => &mut self.momentum_verdict,
            Stage::Volatility => &mut self.volatility_verdict,
        }
    }
}
