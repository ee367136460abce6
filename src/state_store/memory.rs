//! In-memory state store implementation.
//!
//! This module provides [`MemoryStateStore`], a thread-safe in-memory
//! implementation of [`StateStore`] suitable for testing and development.

use crate::directory::{AssignmentKey, RoleAssignment};
use crate::initiative::{Initiative, InitiativeId};
use crate::monitoring::{EntryId, MonitoringEntry};
use crate::stage::StageState;
use crate::timeline::{MilestoneId, TimelineEntry};
use crate::{Result, TollgateError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{StateStore, TransitionCommit};

/// Internal storage for the memory state store.
#[derive(Debug, Default)]
struct Storage {
    initiatives: HashMap<InitiativeId, Initiative>,
    /// Stage records indexed by (initiative, stage number).
    stage_states: HashMap<InitiativeId, BTreeMap<u32, StageState>>,
    assignments: BTreeMap<AssignmentKey, RoleAssignment>,
    monitoring: HashMap<EntryId, MonitoringEntry>,
    milestones: HashMap<MilestoneId, TimelineEntry>,
}

impl Storage {
    fn check_unique_entry(&self, entry: &MonitoringEntry) -> Result<()> {
        let clash = self.monitoring.values().any(|other| {
            other.id != entry.id
                && other.initiative_id == entry.initiative_id
                && other.month == entry.month
                && other.kpi_description == entry.kpi_description
        });
        if clash {
            return Err(TollgateError::DuplicateEntry {
                initiative_id: entry.initiative_id.to_string(),
                month: entry.month.to_string(),
                kpi: entry.kpi_description.clone(),
            });
        }
        Ok(())
    }

    fn require_initiative(&self, id: &InitiativeId) -> Result<()> {
        if !self.initiatives.contains_key(id) {
            return Err(TollgateError::InitiativeNotFound(id.to_string()));
        }
        Ok(())
    }
}

/// An in-memory implementation of [`StateStore`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it
/// safe to clone and share across async tasks. Clones share the same data.
/// Each transition commit runs under a single write lock, so the version
/// check and the writes it guards are atomic.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    storage: Arc<RwLock<Storage>>,
}

impl MemoryStateStore {
    /// Creates a new, empty in-memory state store.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(Storage::default())),
        }
    }

    /// Returns the number of initiatives currently stored.
    ///
    /// Useful for testing.
    pub async fn initiative_count(&self) -> usize {
        self.storage.read().await.initiatives.len()
    }

    /// Returns the total number of role assignments currently stored.
    ///
    /// Useful for testing.
    pub async fn assignment_count(&self) -> usize {
        self.storage.read().await.assignments.len()
    }

    /// Clears all stored data.
    ///
    /// Useful for resetting state between tests.
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        *storage = Storage::default();
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn commit_transition(&mut self, commit: TransitionCommit) -> Result<Initiative> {
        let mut guard = self.storage.write().await;
        let storage = &mut *guard;
        let id = commit.initiative.id;
        let stored = storage.initiatives.get(&id).map(|i| i.version);
        commit.check_version(stored)?;

        let mut initiative = commit.initiative.clone();
        initiative.version = commit.next_version();

        let stages = storage.stage_states.entry(id).or_default();
        for (number, state) in commit.stage_states {
            stages.insert(number, state);
        }
        for assignment in commit.assignments {
            storage.assignments.insert(assignment.key.clone(), assignment);
        }
        storage.initiatives.insert(id, initiative.clone());
        debug!(initiative_id = %id, version = initiative.version, "transition committed");
        Ok(initiative)
    }

    async fn get_initiative(&self, id: &InitiativeId) -> Result<Option<Initiative>> {
        let storage = self.storage.read().await;
        Ok(storage.initiatives.get(id).cloned())
    }

    async fn list_initiatives(&self) -> Result<Vec<Initiative>> {
        let storage = self.storage.read().await;
        let mut all: Vec<Initiative> = storage.initiatives.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn delete_initiative(&mut self, id: &InitiativeId) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.initiatives.remove(id);
        storage.stage_states.remove(id);
        storage
            .assignments
            .retain(|key, _| key.initiative.as_ref() != Some(id));
        storage.monitoring.retain(|_, e| e.initiative_id != *id);
        storage.milestones.retain(|_, m| m.initiative_id != *id);
        Ok(())
    }

    async fn get_stage_states(&self, id: &InitiativeId) -> Result<BTreeMap<u32, StageState>> {
        let storage = self.storage.read().await;
        Ok(storage.stage_states.get(id).cloned().unwrap_or_default())
    }

    async fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<RoleAssignment>> {
        let storage = self.storage.read().await;
        Ok(storage.assignments.get(key).cloned())
    }

    async fn save_assignment(&mut self, assignment: &RoleAssignment) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage
            .assignments
            .insert(assignment.key.clone(), assignment.clone());
        Ok(())
    }

    async fn list_assignments(&self, site: &str) -> Result<Vec<RoleAssignment>> {
        let storage = self.storage.read().await;
        let mut found: Vec<RoleAssignment> = storage
            .assignments
            .values()
            .filter(|a| a.key.site == site)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.key.initiative.is_some(), a.key.stage_number, a.key.initiative));
        Ok(found)
    }

    async fn insert_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.require_initiative(&entry.initiative_id)?;
        storage.check_unique_entry(entry)?;
        storage.monitoring.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_monitoring_entry(&self, id: &EntryId) -> Result<Option<MonitoringEntry>> {
        let storage = self.storage.read().await;
        Ok(storage.monitoring.get(id).cloned())
    }

    async fn save_monitoring_entry(&mut self, entry: &MonitoringEntry) -> Result<()> {
        let mut storage = self.storage.write().await;
        if !storage.monitoring.contains_key(&entry.id) {
            return Err(TollgateError::MonitoringEntryNotFound(entry.id.to_string()));
        }
        storage.check_unique_entry(entry)?;
        storage.monitoring.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_monitoring_entry(&mut self, id: &EntryId) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.monitoring.remove(id);
        Ok(())
    }

    async fn list_monitoring_entries(
        &self,
        initiative_id: &InitiativeId,
    ) -> Result<Vec<MonitoringEntry>> {
        let storage = self.storage.read().await;
        let mut entries: Vec<MonitoringEntry> = storage
            .monitoring
            .values()
            .filter(|e| e.initiative_id == *initiative_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.month
                .cmp(&b.month)
                .then_with(|| a.kpi_description.cmp(&b.kpi_description))
        });
        Ok(entries)
    }

    async fn insert_milestone(&mut self, entry: &TimelineEntry) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.require_initiative(&entry.initiative_id)?;
        storage.milestones.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_milestone(&self, id: &MilestoneId) -> Result<Option<TimelineEntry>> {
        let storage = self.storage.read().await;
        Ok(storage.milestones.get(id).cloned())
    }

    async fn save_milestone(&mut self, entry: &TimelineEntry) -> Result<()> {
        let mut storage = self.storage.write().await;
        if !storage.milestones.contains_key(&entry.id) {
            return Err(TollgateError::MilestoneNotFound(entry.id.to_string()));
        }
        storage.milestones.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_milestone(&mut self, id: &MilestoneId) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.milestones.remove(id);
        Ok(())
    }

    async fn list_milestones(&self, initiative_id: &InitiativeId) -> Result<Vec<TimelineEntry>> {
        let storage = self.storage.read().await;
        let mut entries: Vec<TimelineEntry> = storage
            .milestones
            .values()
            .filter(|m| m.initiative_id == *initiative_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.planned_date
                .cmp(&b.planned_date)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MonitoringMonth;
    use crate::{Identity, NewInitiative, RoleCode, StageStatus};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn initiative() -> Initiative {
        Initiative::register(
            NewInitiative::new("Heat recovery", "NDS"),
            Identity::new("stld@nds.example"),
        )
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryStateStore::new();
        assert_eq!(store.initiative_count().await, 0);
        assert_eq!(store.assignment_count().await, 0);
    }

    #[tokio::test]
    async fn test_insert_and_get_initiative() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()).with_stage(1, StageState::started()))
            .await
            .unwrap();
        assert_eq!(stored.version, 0);

        let retrieved = store.get_initiative(&stored.id).await.unwrap().unwrap();
        assert_eq!(retrieved.title, "Heat recovery");

        let stages = store.get_stage_states(&stored.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[&1].status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_nonexistent_initiative() {
        let store = MemoryStateStore::new();
        assert!(store.get_initiative(&InitiativeId::new()).await.unwrap().is_none());
        assert!(store
            .get_stage_states(&InitiativeId::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_commit_bumps_version_and_rejects_stale() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();

        let mut next = stored.clone();
        next.current_stage = 2;
        let updated = store
            .commit_transition(TransitionCommit::update(next.clone(), stored.version))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let stale = store
            .commit_transition(TransitionCommit::update(next, stored.version))
            .await;
        assert!(matches!(
            stale,
            Err(TollgateError::ConcurrentModification {
                expected: 0,
                found: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();

        let assignment = RoleAssignment::new(
            AssignmentKey::scoped(&stored, 4),
            RoleCode::InitiativeLead,
            Identity::new("il@nds.example"),
        );
        let result = store
            .commit_transition(
                TransitionCommit::update(stored.clone(), 7)
                    .with_stage(3, StageState::started())
                    .with_assignment(assignment),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.assignment_count().await, 0);
        assert!(store.get_stage_states(&stored.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitoring_entry_unique_per_month_and_kpi() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();
        let month = MonitoringMonth::new(2025, 5).unwrap();

        let first = MonitoringEntry::new(stored.id, month, "Steam", Decimal::ONE, RoleCode::SiteTsdLead);
        store.insert_monitoring_entry(&first).await.unwrap();

        let second = MonitoringEntry::new(stored.id, month, "Steam", Decimal::TEN, RoleCode::SiteTsdLead);
        assert!(matches!(
            store.insert_monitoring_entry(&second).await,
            Err(TollgateError::DuplicateEntry { .. })
        ));

        // saving the same entry again is not a clash with itself
        store.save_monitoring_entry(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_for_unknown_initiative() {
        let mut store = MemoryStateStore::new();
        let entry = MonitoringEntry::new(
            InitiativeId::new(),
            MonitoringMonth::new(2025, 5).unwrap(),
            "Steam",
            Decimal::ONE,
            RoleCode::SiteTsdLead,
        );
        assert!(matches!(
            store.insert_monitoring_entry(&entry).await,
            Err(TollgateError::InitiativeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_initiative_cascades() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(
                TransitionCommit::insert(initiative()).with_stage(1, StageState::started()),
            )
            .await
            .unwrap();

        store
            .save_assignment(&RoleAssignment::new(
                AssignmentKey::site_wide("NDS", 2),
                RoleCode::SiteHead,
                Identity::new("sh@nds.example"),
            ))
            .await
            .unwrap();
        store
            .save_assignment(&RoleAssignment::new(
                AssignmentKey::scoped(&stored, 6),
                RoleCode::InitiativeLead,
                Identity::new("il@nds.example"),
            ))
            .await
            .unwrap();

        let entry = MonitoringEntry::new(
            stored.id,
            MonitoringMonth::new(2025, 5).unwrap(),
            "Steam",
            Decimal::ONE,
            RoleCode::SiteTsdLead,
        );
        store.insert_monitoring_entry(&entry).await.unwrap();
        let milestone = TimelineEntry::new(
            stored.id,
            "Survey",
            NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
        );
        store.insert_milestone(&milestone).await.unwrap();

        store.delete_initiative(&stored.id).await.unwrap();

        assert!(store.get_initiative(&stored.id).await.unwrap().is_none());
        assert!(store.get_monitoring_entry(&entry.id).await.unwrap().is_none());
        assert!(store.get_milestone(&milestone.id).await.unwrap().is_none());
        assert!(store.get_stage_states(&stored.id).await.unwrap().is_empty());
        // site roster survives
        assert_eq!(store.assignment_count().await, 1);
    }

    #[tokio::test]
    async fn test_list_assignments_site_wide_first() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();
        for (key, role) in [
            (AssignmentKey::scoped(&stored, 4), RoleCode::InitiativeLead),
            (AssignmentKey::site_wide("NDS", 7), RoleCode::SiteTsdLead),
            (AssignmentKey::site_wide("NDS", 2), RoleCode::SiteHead),
            (AssignmentKey::site_wide("OTHER", 2), RoleCode::SiteHead),
        ] {
            store
                .save_assignment(&RoleAssignment::new(key, role, Identity::new("x@y")))
                .await
                .unwrap();
        }

        let listed = store.list_assignments("NDS").await.unwrap();
        let stages: Vec<u32> = listed.iter().map(|a| a.key.stage_number).collect();
        assert_eq!(stages, vec![2, 7, 4]);
    }

    #[tokio::test]
    async fn test_store_trait_object() {
        let mut store: Box<dyn StateStore> = Box::new(MemoryStateStore::new());
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();
        assert!(store.get_initiative(&stored.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_commits_on_same_version() {
        let mut store = MemoryStateStore::new();
        let stored = store
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mut store_clone = store.clone();
            let snapshot = stored.clone();
            handles.push(tokio::spawn(async move {
                store_clone
                    .commit_transition(TransitionCommit::update(snapshot, 0))
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_store_is_clone() {
        let mut store1 = MemoryStateStore::new();
        let store2 = store1.clone();

        let stored = store1
            .commit_transition(TransitionCommit::insert(initiative()))
            .await
            .unwrap();

        // Changes visible through clone
        assert!(store2.get_initiative(&stored.id).await.unwrap().is_some());

        store2.clear().await;
        assert_eq!(store1.initiative_count().await, 0);
    }
}
