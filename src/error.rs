//! Error types for the Tollgate approval engine.
//!
//! Every operation in the crate reports failure through [`TollgateError`].
//! Errors are scoped to the single requested operation: none of them is
//! fatal to the process, and each carries enough context (stage number,
//! required role, entry id) for the caller to act on it.

use thiserror::Error;

use crate::initiative::InitiativeStatus;
use crate::role::{Identity, RoleCode};

/// The main error type for Tollgate operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TollgateError {
    /// Error occurred in the state store layer.
    #[error("State store error: {0}")]
    StateStore(String),

    /// The acting identity is not the one assigned to the current stage.
    #[error("{actor} is not authorized to act on stage {stage} (requires {required_role})")]
    Unauthorized {
        /// Stage the actor tried to act on.
        stage: u32,
        /// Role the catalog requires for that stage.
        required_role: RoleCode,
        /// The identity that attempted the action.
        actor: Identity,
    },

    /// No identity is assigned to the stage at this site.
    #[error("No identity assigned to stage {stage} at site {site}")]
    Unassigned {
        /// Site of the initiative.
        site: String,
        /// Stage without an assignment.
        stage: u32,
    },

    /// A stage number is not present in the catalog.
    #[error("Unknown stage: {0}")]
    UnknownStage(u32),

    /// Initiative not found in the state store.
    #[error("Initiative not found: {0}")]
    InitiativeNotFound(String),

    /// Monitoring entry not found in the state store.
    #[error("Monitoring entry not found: {0}")]
    MonitoringEntryNotFound(String),

    /// Timeline milestone not found in the state store.
    #[error("Milestone not found: {0}")]
    MilestoneNotFound(String),

    /// An assignment already exists for the key with a different identity.
    #[error(
        "Stage {stage} at site {site} is already assigned to {existing} (requested {requested})"
    )]
    DuplicateAssignment {
        /// Site of the assignment.
        site: String,
        /// Stage of the assignment.
        stage: u32,
        /// Identity currently holding the assignment.
        existing: Identity,
        /// Identity the caller asked for.
        requested: Identity,
    },

    /// A monitoring entry already exists for (initiative, month, KPI).
    #[error("Monitoring entry already exists for initiative {initiative_id}, {month}, KPI '{kpi}'")]
    DuplicateEntry {
        /// Owning initiative.
        initiative_id: String,
        /// Monitoring month (`YYYY-MM`).
        month: String,
        /// KPI description.
        kpi: String,
    },

    /// The monitoring entry is finalized and can no longer be edited.
    #[error("Monitoring entry {0} is already finalized")]
    AlreadyFinalized(String),

    /// The monitoring entry must be finalized first.
    #[error("Monitoring entry {0} is not finalized")]
    NotFinalized(String),

    /// A monitoring entry still awaits finance approval.
    #[error("Stage {stage} blocked: monitoring entry {entry} awaits finance approval")]
    FinanceApprovalPending {
        /// Stage that was blocked.
        stage: u32,
        /// First entry without finance approval.
        entry: String,
    },

    /// Savings were validated; the monitoring figures are closed to edits.
    #[error("Monitoring for initiative {initiative_id} is locked at stage {current}")]
    MonitoringLocked {
        /// Initiative whose monitoring was written to.
        initiative_id: String,
        /// Stage the initiative is waiting on.
        current: u32,
    },

    /// The monitoring entry has no achieved value to lock.
    #[error("Monitoring entry {0} has no achieved value")]
    IncompleteEntry(String),

    /// The initiative changed since the caller read it.
    #[error(
        "Initiative {initiative_id} was modified concurrently (expected version {expected}, found {found})"
    )]
    ConcurrentModification {
        /// Initiative being transitioned.
        initiative_id: String,
        /// Version the caller based its transition on.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },

    /// The role cannot approve timeline milestones.
    #[error("Role {0} cannot approve timeline milestones")]
    InvalidApprover(RoleCode),

    /// The decision payload does not fit the stage.
    #[error("Invalid decision for stage {stage}: {reason}")]
    InvalidDecision {
        /// Stage the decision targeted.
        stage: u32,
        /// Why it was refused.
        reason: String,
    },

    /// The initiative is Rejected or Completed and accepts no further action.
    #[error("Initiative {initiative_id} is {status} and accepts no further action")]
    WorkflowHalted {
        /// Halted initiative.
        initiative_id: String,
        /// Its terminal status.
        status: InitiativeStatus,
    },

    /// A sub-workflow was used before the initiative reached its gating stage.
    #[error("Initiative {initiative_id} is at stage {current}; stage {required} must be reached first")]
    StageNotReached {
        /// Initiative being worked on.
        initiative_id: String,
        /// Stage the operation requires.
        required: u32,
        /// Current stage of the initiative.
        current: u32,
    },

    /// The stage catalog definition is inconsistent.
    #[error("Invalid stage catalog: {0}")]
    InvalidCatalog(String),

    /// Seed data for role assignments is inconsistent with the catalog.
    #[error("Invalid seed data: {0}")]
    InvalidSeed(String),

    /// A monitoring month could not be parsed or is out of range.
    #[error("Invalid monitoring month: {0}")]
    InvalidMonth(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from file or database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error (for SQLite state store).
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl TollgateError {
    /// Returns true if the whole operation can be retried as-is.
    ///
    /// Only stale transitions are transient; everything else needs the
    /// caller to change its request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

/// A specialized `Result` type for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_state_store() {
        let error = TollgateError::StateStore("connection failed".to_string());
        assert_eq!(error.to_string(), "State store error: connection failed");
    }

    #[test]
    fn test_error_display_unauthorized_names_stage_and_role() {
        let error = TollgateError::Unauthorized {
            stage: 2,
            required_role: RoleCode::SiteHead,
            actor: Identity::new("someone@nds.example"),
        };
        let msg = error.to_string();
        assert!(msg.contains("stage 2"));
        assert!(msg.contains("SH"));
        assert!(msg.contains("someone@nds.example"));
    }

    #[test]
    fn test_error_display_unknown_stage() {
        assert_eq!(TollgateError::UnknownStage(12).to_string(), "Unknown stage: 12");
    }

    #[test]
    fn test_error_display_duplicate_entry() {
        let error = TollgateError::DuplicateEntry {
            initiative_id: "i-1".to_string(),
            month: "2025-04".to_string(),
            kpi: "Steam".to_string(),
        };
        assert!(error.to_string().contains("2025-04"));
        assert!(error.to_string().contains("Steam"));
    }

    #[test]
    fn test_error_display_halted() {
        let error = TollgateError::WorkflowHalted {
            initiative_id: "i-1".to_string(),
            status: InitiativeStatus::Rejected,
        };
        assert!(error.to_string().contains("Rejected"));
    }

    #[test]
    fn test_error_display_monitoring_locked() {
        let error = TollgateError::MonitoringLocked {
            initiative_id: "i-1".to_string(),
            current: 11,
        };
        assert_eq!(error.to_string(), "Monitoring for initiative i-1 is locked at stage 11");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        let stale = TollgateError::ConcurrentModification {
            initiative_id: "i-1".to_string(),
            expected: 3,
            found: 4,
        };
        assert!(stale.is_retryable());
        assert!(!TollgateError::NotFinalized("e-1".to_string()).is_retryable());
        assert!(!TollgateError::InvalidApprover(RoleCode::SiteHead).is_retryable());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: TollgateError = json_error.into();
        assert!(error.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: TollgateError = io_error.into();
        assert!(error.to_string().contains("I/O error"));
    }
}
