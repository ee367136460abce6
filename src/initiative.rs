//! The improvement initiative and its progression record.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::catalog::{ConditionalPath, STAGE_REGISTER};
use crate::role::Identity;
use crate::{Result, TollgateError};

/// Unique identifier of an initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitiativeId(Uuid);

impl InitiativeId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InitiativeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InitiativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InitiativeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Overall status of an initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitiativeStatus {
    /// Registered, awaiting site-head approval.
    Pending,
    /// Approved by the site head and moving through the remaining stages.
    InProgress,
    /// Closure approved. Terminal.
    Completed,
    /// Rejected at some stage. Terminal.
    Rejected,
}

impl InitiativeStatus {
    /// Returns true for statuses that accept no further action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl fmt::Display for InitiativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Rejected => "Rejected",
        };
        f.pad(label)
    }
}

/// Business priority assigned at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority.
    Low,
    /// Medium priority.
    #[default]
    Medium,
    /// High priority.
    High,
}

/// Registration data supplied by the initiator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewInitiative {
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Site the initiative belongs to; selects the role roster.
    pub site: String,
    /// Engineering discipline (mechanical, electrical, ...).
    pub discipline: Option<String>,
    /// Business priority.
    pub priority: Priority,
    /// Expected annual savings.
    pub expected_savings: Option<Decimal>,
    /// Planned start date.
    pub start_date: Option<NaiveDate>,
    /// Planned end date.
    pub end_date: Option<NaiveDate>,
}

impl NewInitiative {
    /// Starts a registration for the given title and site.
    pub fn new(title: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            site: site.into(),
            ..Self::default()
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the discipline.
    pub fn with_discipline(mut self, discipline: impl Into<String>) -> Self {
        self.discipline = Some(discipline.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the expected savings.
    pub fn with_expected_savings(mut self, savings: Decimal) -> Self {
        self.expected_savings = Some(savings);
        self
    }

    /// Sets the planned start and end dates.
    pub fn with_dates(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }
}

/// An improvement initiative and its workflow progression state.
///
/// Created once by its initiator through
/// [`TransitionEngine::register`](crate::TransitionEngine::register) and
/// mutated afterwards only by the engine and its sub-workflows. The
/// `version` counter is bumped on every committed transition and backs the
/// optimistic concurrency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initiative {
    /// Unique identifier.
    pub id: InitiativeId,
    /// Short title.
    pub title: String,
    /// Free-text description.
    pub description: String,
    /// Owning site.
    pub site: String,
    /// Engineering discipline.
    pub discipline: Option<String>,
    /// Business priority.
    pub priority: Priority,
    /// Expected annual savings.
    pub expected_savings: Option<Decimal>,
    /// Savings actually realised, once known.
    pub actual_savings: Option<Decimal>,
    /// Planned start date.
    pub start_date: Option<NaiveDate>,
    /// Planned end date.
    pub end_date: Option<NaiveDate>,
    /// Overall status.
    pub status: InitiativeStatus,
    /// Stage awaiting action (or the final/rejecting stage once halted).
    pub current_stage: u32,
    /// Share of applicable stages approved, 0..=100.
    pub progress_percentage: u8,
    /// Conditional path chosen at stage 3; `None` until then.
    pub path: Option<ConditionalPath>,
    /// Initiative Lead bound at stage 3.
    pub initiative_lead: Option<Identity>,
    /// Engineering-change (MOC) reference recorded at stage 4.
    pub moc_number: Option<String>,
    /// Capital-approval (CAPEX) reference recorded at stage 5.
    pub capex_number: Option<String>,
    /// The initiator.
    pub created_by: Identity,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last committed change.
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl Initiative {
    /// Builds a freshly registered initiative at stage 1.
    pub fn register(draft: NewInitiative, created_by: Identity) -> Self {
        let now = Utc::now();
        Self {
            id: InitiativeId::new(),
            title: draft.title,
            description: draft.description,
            site: draft.site,
            discipline: draft.discipline,
            priority: draft.priority,
            expected_savings: draft.expected_savings,
            actual_savings: None,
            start_date: draft.start_date,
            end_date: draft.end_date,
            status: InitiativeStatus::Pending,
            current_stage: STAGE_REGISTER,
            progress_percentage: 0,
            path: None,
            initiative_lead: None,
            moc_number: None,
            capex_number: None,
            created_by,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Returns true if an engineering-change review was required at stage 3.
    pub fn requires_engineering_change(&self) -> bool {
        self.path.is_some_and(|p| p.requires_engineering_change)
    }

    /// Returns true if capital approval was required at stage 3.
    pub fn requires_capital_approval(&self) -> bool {
        self.path.is_some_and(|p| p.requires_capital_approval)
    }

    /// Returns true if the initiative accepts no further action.
    pub fn is_halted(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fails with [`TollgateError::WorkflowHalted`] if the initiative is
    /// Rejected or Completed.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_halted() {
            return Err(TollgateError::WorkflowHalted {
                initiative_id: self.id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Fails unless the initiative is active and has reached `stage`.
    pub fn ensure_reached(&self, stage: u32) -> Result<()> {
        self.ensure_active()?;
        if self.current_stage < stage {
            return Err(TollgateError::StageNotReached {
                initiative_id: self.id.to_string(),
                required: stage,
                current: self.current_stage,
            });
        }
        Ok(())
    }

    /// Returns the value used for annualized reporting: actual savings if
    /// recorded, otherwise expected savings.
    pub fn annualized_value(&self) -> Option<Decimal> {
        self.actual_savings.or(self.expected_savings)
    }
}
