//! State storage for the Tollgate approval engine.
//!
//! This module provides the [`StateStore`] trait for persisting initiatives,
//! their per-stage audit records, role assignments and sub-workflow entries,
//! along with concrete implementations:
//!
//! - [`MemoryStateStore`]: Thread-safe in-memory storage for testing/development
//! - [`SqliteStateStore`]: SQLite-backed storage (feature `sqlite`)
//!
//! Stage transitions are written through [`StateStore::commit_transition`],
//! which applies the initiative record, the touched stage records and any
//! new role assignments as one unit guarded by an optimistic version check.
//!
//! # Example
//!
//! ```
//! use tollgate::{Identity, Initiative, MemoryStateStore, NewInitiative, StateStore, TransitionCommit};
//!
//! # async fn example() -> tollgate::Result<()> {
//! let mut store = MemoryStateStore::new();
//!
//! let initiative = Initiative::register(
//!     NewInitiative::new("Compressed air leak survey", "NDS"),
//!     Identity::new("stld@nds.example"),
//! );
//! let stored = store.commit_transition(TransitionCommit::insert(initiative)).await?;
//!
//! let retrieved = store.get_initiative(&stored.id).await?;
//! assert!(retrieved.is_some());
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStateStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;

use crate::directory::{AssignmentKey, RoleAssignment};
use crate::initiative::{Initiative, InitiativeId};
use crate::monitoring::{EntryId, MonitoringEntry};
use crate::stage::StageState;
use crate::timeline::{MilestoneId, TimelineEntry};
use crate::{Result, TollgateError};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Everything one stage transition writes, applied atomically.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// The initiative as it should look after the transition.
    pub initiative: Initiative,

    /// Version the transition was computed from; `None` inserts a new initiative.
    pub expected_version: Option<u64>,

    /// Stage records touched by the transition, keyed by stage number.
    pub stage_states: Vec<(u32, StageState)>,

    /// Role assignments created by the transition.
    pub assignments: Vec<RoleAssignment>,
}

impl TransitionCommit {
    /// A commit that inserts a newly registered initiative.
    pub fn insert(initiative: Initiative) -> Self {
        Self {
            initiative,
            expected_version: None,
            stage_states: Vec::new(),
            assignments: Vec::new(),
        }
    }

    /// A commit that updates an initiative last seen at `expected_version`.
    pub fn update(initiative: Initiative, expected_version: u64) -> Self {
        Self {
            initiative,
            expected_version: Some(expected_version),
            stage_states: Vec::new(),
            assignments: Vec::new(),
        }
    }

    /// Adds a stage record.
    pub fn with_stage(mut self, stage: u32, state: StageState) -> Self {
        self.stage_states.push((stage, state));
        self
    }

    /// Adds a role assignment.
    pub fn with_assignment(mut self, assignment: RoleAssignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    /// Returns the version the committed initiative will carry.
    pub fn next_version(&self) -> u64 {
        self.expected_version.map_or(0, |v| v + 1)
    }

    /// Checks the optimistic version guard against the currently stored version.
    pub(crate) fn check_version(&self, stored: Option<u64>) -> Result<()> {
        match (self.expected_version, stored) {
            (None, None) => Ok(()),
            (Some(expected), Some(found)) if expected == found => Ok(()),
            (Some(_), None) => Err(TollgateError::InitiativeNotFound(
                self.initiative.id.to_string(),
            )),
            (expected, Some(found)) => Err(TollgateError::ConcurrentModification {
                initiative_id: self.initiative.id.to_string(),
                expected: expected.unwrap_or(0),
                found,
            }),
        }
    }
}

/// Loads an initiative or fails with [`TollgateError::InitiativeNotFound`].
pub(crate) async fn require_initiative<S: StateStore + ?Sized>(
    store: &S,
    id: &InitiativeId,
) -> Result<Initiative> {
    store
        .get_initiative(id)
        .await?
        .ok_or_else(|| TollgateError::InitiativeNotFound(id.to_string()))
}

/// A trait for persisting and retrieving workflow state.
///
/// The state store owns the persistent record of every initiative: its
/// progression fields, one [`StageState`] per decided or current stage, the
/// role roster, and the monitoring and timeline entries attached to it.
///
/// # Object Safety
///
/// This trait is object-safe, allowing for dynamic dispatch with
/// `dyn StateStore`. This enables different storage backends (in-memory,
/// SQLite, etc.) to be swapped at runtime.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically applies a stage transition.
    ///
    /// The stored initiative carries version [`TransitionCommit::next_version`].
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::ConcurrentModification`] if the stored version
    /// differs from `expected_version` (or the initiative already exists on
    /// insert), and [`TollgateError::InitiativeNotFound`] if an update targets
    /// a missing initiative. Nothing is written on error.
    async fn commit_transition(&mut self, commit: TransitionCommit) -> Result<Initiative>;

    /// Retrieves an initiative.
    async fn get_initiative(&self, id: &InitiativeId) -> Result<Option<Initiative>>;

    /// Lists all initiatives, oldest first.
    async fn list_initiatives(&self) -> Result<Vec<Initiative>>;

    /// Deletes an initiative together with its stage records, its
    /// initiative-scoped role assignments, and its monitoring and timeline
    /// entries.
    async fn delete_initiative(&mut self, id: &InitiativeId) -> Result<()>;

    /// Retrieves all stage records for an initiative, keyed by stage number.
    async fn get_stage_states(&self, id: &InitiativeId) -> Result<BTreeMap<u32, StageState>>;

    /// Retrieves the assignment stored under exactly `key`.
    async fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<RoleAssignment>>;

    /// Inserts or replaces an assignment.
    async fn save_assignment(&mut self, assignment: &RoleAssignment) -> Result<()>;

    /// Lists the assignments of a site, site-wide entries first, then by stage.
    async fn list_assignments(&self, site: &str) -> Result<Vec<RoleAssignment>>;

    /// Inserts a new monitoring entry.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::DuplicateEntry`] if an entry already exists
    /// for the same initiative, month and KPI, and
    /// [`TollgateError::InitiativeNotFound`] if the initiative does not exist.
    async fn insert_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()>;

    /// Retrieves a monitoring entry.
    async fn get_monitoring_entry(&self, id: &EntryId) -> Result<Option<MonitoringEntry>>;

    /// Replaces an existing monitoring entry.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::MonitoringEntryNotFound`] if it does not exist
    /// and [`TollgateError::DuplicateEntry`] if the edit collides with
    /// another entry's month and KPI.
    async fn save_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()>;

    /// Deletes a monitoring entry. Deleting a missing entry is a no-op.
    async fn delete_monitoring_entry(&mut self, id: &EntryId) -> Result<()>;

    /// Lists the monitoring entries of an initiative ordered by month, then KPI.
    async fn list_monitoring_entries(
        &self,
        initiative_id: &InitiativeId,
    ) -> Result<Vec<MonitoringEntry>>;

    /// Inserts a new timeline milestone.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InitiativeNotFound`] if the initiative does not exist.
    async fn insert_milestone(&mut self, entry: &TimelineEntry) -> Result<()>;

    /// Retrieves a timeline milestone.
    async fn get_milestone(&self, id: &MilestoneId) -> Result<Option<TimelineEntry>>;

    /// Replaces an existing milestone.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::MilestoneNotFound`] if it does not exist.
    async fn save_milestone(&mut self, entry: &TimelineEntry) -> Result<()>;

    /// Deletes a milestone. Deleting a missing milestone is a no-op.
    async fn delete_milestone(&mut self, id: &MilestoneId) -> Result<()>;

    /// Lists the milestones of an initiative ordered by planned date.
    async fn list_milestones(&self, initiative_id: &InitiativeId) -> Result<Vec<TimelineEntry>>;
}
