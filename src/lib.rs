//! # Tollgate
//!
//! A stage-gate approval engine for site improvement initiatives.
//!
//! Every initiative walks an ordered catalog of eleven stages. Each stage is
//! decided by exactly one role holder; the engine checks who may act, records
//! an audit row per stage, and moves the initiative forward. Three stages are
//! special:
//!
//! - Stages 4 (engineering change) and 5 (capital approval) apply only when
//!   the stage-3 approver says so; otherwise they are recorded as bypassed
//! - Stages 4, 5 and 6 are decided by an Initiative Lead chosen at stage 3,
//!   whose assignment is scoped to that one initiative
//! - Stages 9 and 10 are gated on the monthly savings monitoring entries
//!   being finalized and finance-approved
//!
//! Two sub-workflows run alongside the main sequence: monthly KPI monitoring
//! ([`MonitoringSubworkflow`]) and the milestone timeline
//! ([`TimelineSubworkflow`]).
//!
//! ## Quick Example
//!
//! ```
//! use tollgate::{
//!     seed_directory, Decision, Identity, MemoryStateStore, NewInitiative, SeedConfig,
//!     TransitionEngine,
//! };
//!
//! # async fn example() -> tollgate::Result<()> {
//! let engine = TransitionEngine::default();
//! let mut store = MemoryStateStore::new();
//! seed_directory(&mut store, engine.catalog(), &SeedConfig::demo()).await?;
//!
//! let initiator = Identity::new("stld@nds.example");
//! let initiative = engine
//!     .register(NewInitiative::new("Steam trap survey", "NDS"), initiator.clone(), &mut store)
//!     .await?;
//!
//! let initiative = engine
//!     .advance(&initiative, &initiator, Decision::approve(), &mut store)
//!     .await?
//!     .initiative;
//! let initiative = engine
//!     .advance(&initiative, &Identity::new("sh@nds.example"), Decision::approve(), &mut store)
//!     .await?
//!     .initiative;
//!
//! // The Engineering Head names the lead and skips both conditional stages.
//! let transition = engine
//!     .advance(
//!         &initiative,
//!         &Identity::new("eh@nds.example"),
//!         Decision::assign_responsibilities("il@nds.example", false, false),
//!         &mut store,
//!     )
//!     .await?;
//! assert_eq!(transition.initiative.current_stage, 6);
//! assert_eq!(transition.bypassed(), &[4, 5]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod event;
pub mod initiative;
pub mod monitoring;
pub mod progress;
pub mod report;
pub mod role;
pub mod setup;
pub mod stage;
pub mod state_store;
pub mod timeline;

pub use crate::config::{EngineSettings, SeedConfig, TollgateConfig};
pub use catalog::{ConditionalPath, GatingFlag, StageCatalog, StageDefinition, StageSlot};
pub use directory::{AssignMode, AssignOutcome, AssignmentKey, RoleAssignment, RoleAssignmentDirectory};
pub use engine::{Transition, TransitionEngine, TransitionKind};
pub use error::{Result, TollgateError};
pub use event::WorkflowEvent;
pub use initiative::{Initiative, InitiativeId, InitiativeStatus, NewInitiative, Priority};
pub use monitoring::{EntryId, EntryRevision, MonitoringEntry, MonitoringMonth, MonitoringSubworkflow};
pub use progress::InitiativeProgress;
pub use report::{ReportFilter, ReportSnapshot};
pub use role::{Identity, RoleCode};
pub use setup::seed_directory;
pub use stage::{Approval, Decision, ResponsibilityAssignment, StageDetails, StageState, StageStatus};
pub use state_store::{MemoryStateStore, StateStore, TransitionCommit};
pub use timeline::{MilestoneId, MilestoneStatus, MilestoneUpdate, TimelineEntry, TimelineSubworkflow};

#[cfg(feature = "sqlite")]
pub use state_store::SqliteStateStore;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
