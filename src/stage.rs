//! Per-stage audit records and the decisions that drive them.
//!
//! Every stage an initiative passes through leaves a [`StageState`] behind:
//! who decided it, when, and whether it was approved, bypassed or rejected.
//! A [`Decision`] is what an approver hands to the engine to produce one.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::ConditionalPath;
use crate::role::Identity;

/// The status of an initiative within one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Awaiting (or not yet reached) a decision.
    Pending,

    /// Approved by the assigned identity.
    Approved,

    /// Skipped because its gating flag was false. Not an approval.
    Bypassed,

    /// Rejected; the initiative halted here.
    Rejected,
}

impl StageStatus {
    /// Returns true once the stage has been decided one way or another.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Bypassed => "bypassed",
            Self::Rejected => "rejected",
        };
        f.pad(label)
    }
}

/// Audit record for one stage of one initiative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    /// Current status of the stage.
    pub status: StageStatus,

    /// When the stage became the one awaiting action.
    pub started_at: Option<DateTime<Utc>>,

    /// When the stage was decided or bypassed.
    pub completed_at: Option<DateTime<Utc>>,

    /// Who decided the stage. `None` for bypassed stages.
    pub actor: Option<Identity>,

    /// Approver comments or rejection reason.
    pub comments: Option<String>,
}

impl StageState {
    /// Creates a new stage state in pending status.
    pub fn new() -> Self {
        Self {
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            actor: None,
            comments: None,
        }
    }

    /// Creates a pending stage that is awaiting action from now.
    pub fn started() -> Self {
        let mut state = Self::new();
        state.mark_started();
        state
    }

    /// Records the moment the stage became current.
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Marks the stage approved by `actor`.
    pub fn mark_approved(&mut self, actor: Identity, comments: Option<String>) {
        self.mark_started();
        self.status = StageStatus::Approved;
        self.completed_at = Some(Utc::now());
        self.actor = Some(actor);
        self.comments = comments;
    }

    /// Marks the stage bypassed.
    pub fn mark_bypassed(&mut self) {
        self.status = StageStatus::Bypassed;
        self.completed_at = Some(Utc::now());
        self.actor = None;
    }

    /// Marks the stage rejected by `actor`.
    pub fn mark_rejected(&mut self, actor: Identity, reason: String) {
        self.mark_started();
        self.status = StageStatus::Rejected;
        self.completed_at = Some(Utc::now());
        self.actor = Some(actor);
        self.comments = Some(reason);
    }
}

impl Default for StageState {
    fn default() -> Self {
        Self::new()
    }
}

/// The stage-3 decision: who leads the initiative and which conditional
/// stages apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsibilityAssignment {
    /// Identity bound to the Initiative-Lead stages 4, 5 and 6.
    pub initiative_lead: Identity,
    /// Whether stage 4 (engineering change) applies.
    pub requires_engineering_change: bool,
    /// Whether stage 5 (capital approval) applies.
    pub requires_capital_approval: bool,
}

impl ResponsibilityAssignment {
    /// Returns the conditional path this assignment selects.
    pub fn path(&self) -> ConditionalPath {
        ConditionalPath::new(self.requires_engineering_change, self.requires_capital_approval)
    }
}

/// Stage-specific payload carried by an approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum StageDetails {
    /// Plain sign-off.
    #[default]
    None,
    /// Stage 3: responsibilities and conditional path.
    Responsibilities(ResponsibilityAssignment),
    /// Stage 4: engineering-change (MOC) reference.
    EngineeringChange {
        /// MOC document number.
        moc_number: String,
    },
    /// Stage 5: capital-approval (CAPEX) reference.
    CapitalApproval {
        /// CAPEX document number.
        capex_number: String,
    },
    /// Stage 10: savings validated with finance.
    SavingsValidated {
        /// Realised annual savings.
        actual_savings: Decimal,
    },
}

/// An approval and its payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    /// Free-text comments.
    pub comments: Option<String>,
    /// Stage-specific payload.
    pub details: StageDetails,
}

/// What the approver of the current stage decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Approve the current stage and move on.
    Approve(Approval),
    /// Reject the initiative at the current stage.
    Reject {
        /// Why the initiative was rejected.
        reason: String,
    },
}

impl Decision {
    /// A plain approval with no payload.
    pub fn approve() -> Self {
        Self::Approve(Approval::default())
    }

    /// An approval carrying stage-specific details.
    pub fn approve_with(details: StageDetails) -> Self {
        Self::Approve(Approval {
            comments: None,
            details,
        })
    }

    /// The stage-3 approval naming the Initiative Lead and the conditional path.
    pub fn assign_responsibilities(
        initiative_lead: impl Into<Identity>,
        requires_engineering_change: bool,
        requires_capital_approval: bool,
    ) -> Self {
        Self::approve_with(StageDetails::Responsibilities(ResponsibilityAssignment {
            initiative_lead: initiative_lead.into(),
            requires_engineering_change,
            requires_capital_approval,
        }))
    }

    /// A rejection with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    /// Attaches comments to an approval. Has no effect on a rejection.
    pub fn with_comments(mut self, text: impl Into<String>) -> Self {
        if let Self::Approve(approval) = &mut self {
            approval.comments = Some(text.into());
        }
        self
    }

    /// Returns true for a rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }
}
