//! Monthly KPI monitoring with a finalize then finance-approve gate.
//!
//! Each [`MonitoringEntry`] records one KPI for one month of one initiative.
//! The entry owner fills in the achieved value and finalizes it, which locks
//! the figures; finance then approves or returns it. Stage 9 cannot be
//! approved while any entry is unfinalized, and stage 10 not while any entry
//! lacks finance approval.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{STAGE_SAVINGS_MONITORING, STAGE_SAVINGS_VALIDATION};
use crate::initiative::{Initiative, InitiativeId};
use crate::role::RoleCode;
use crate::state_store::{require_initiative, StateStore};
use crate::{Result, TollgateError, WorkflowEvent};

/// A calendar month, serialized as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonitoringMonth {
    year: i32,
    month: u32,
}

impl MonitoringMonth {
    /// Creates a month.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidMonth`] if `month` is not 1..=12.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(TollgateError::InvalidMonth(format!("{}-{:02}", year, month)));
        }
        Ok(Self { year, month })
    }

    /// The month containing `date`.
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Calendar year.
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month of the year, 1..=12.
    pub fn month(&self) -> u32 {
        self.month
    }

    /// First day of the month.
    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    /// The following month.
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Starting year of the April-to-March fiscal year this month falls in.
    pub fn fiscal_year(&self) -> i32 {
        if self.month >= 4 {
            self.year
        } else {
            self.year - 1
        }
    }

    /// The twelve months of the fiscal year starting April `start_year`.
    pub fn fiscal_year_months(start_year: i32) -> Vec<Self> {
        let mut months = Vec::with_capacity(12);
        let mut current = Self {
            year: start_year,
            month: 4,
        };
        for _ in 0..12 {
            months.push(current);
            current = current.next();
        }
        months
    }

    /// Short label such as `Apr.25`, used as a report sheet name.
    pub fn sheet_label(&self) -> String {
        const NAMES: [&str; 12] = [
            "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
        ];
        let name = NAMES[(self.month as usize - 1) % 12];
        format!("{}.{:02}", name, self.year.rem_euclid(100))
    }
}

impl fmt::Display for MonitoringMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonitoringMonth {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TollgateError::InvalidMonth(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for MonitoringMonth {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MonitoringMonth> for String {
    fn from(value: MonitoringMonth) -> Self {
        value.to_string()
    }
}

/// Unique identifier of a monitoring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One KPI reading for one month of one initiative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringEntry {
    /// Unique identifier.
    pub id: EntryId,
    /// Owning initiative.
    pub initiative_id: InitiativeId,
    /// Month the reading covers.
    pub month: MonitoringMonth,
    /// KPI being tracked.
    pub kpi_description: String,
    /// Target value.
    pub target_value: Decimal,
    /// Achieved value, once measured.
    pub achieved_value: Option<Decimal>,
    /// `achieved - target`, present whenever both are set.
    pub deviation: Option<Decimal>,
    /// Free-text remarks.
    pub remarks: Option<String>,
    /// Figures locked for finance review.
    pub is_finalized: bool,
    /// Finance signed off the figures.
    pub finance_approved: bool,
    /// Finance reviewer comments.
    pub finance_comments: Option<String>,
    /// When finance last reviewed the entry.
    pub finance_reviewed_at: Option<DateTime<Utc>>,
    /// Role of whoever created the entry.
    pub entered_by: RoleCode,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl MonitoringEntry {
    /// Creates an open entry with no achieved value.
    pub fn new(
        initiative_id: InitiativeId,
        month: MonitoringMonth,
        kpi_description: impl Into<String>,
        target_value: Decimal,
        entered_by: RoleCode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::new(),
            initiative_id,
            month,
            kpi_description: kpi_description.into(),
            target_value,
            achieved_value: None,
            deviation: None,
            remarks: None,
            is_finalized: false,
            finance_approved: false,
            finance_comments: None,
            finance_reviewed_at: None,
            entered_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recomputes `deviation` from the current target and achieved values.
    pub fn recompute_deviation(&mut self) {
        self.deviation = self.achieved_value.map(|achieved| achieved - self.target_value);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_finalized {
            return Err(TollgateError::AlreadyFinalized(self.id.to_string()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.recompute_deviation();
        self.updated_at = Utc::now();
    }
}

/// Editable fields of an open entry. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryRevision {
    /// New KPI description.
    pub kpi_description: Option<String>,
    /// New target value.
    pub target_value: Option<Decimal>,
    /// New remarks.
    pub remarks: Option<String>,
}

/// Monthly monitoring operations for initiatives that reached stage 9.
pub struct MonitoringSubworkflow<'a, S: StateStore + ?Sized> {
    store: &'a mut S,
    events: Option<broadcast::Sender<WorkflowEvent>>,
}

impl<'a, S: StateStore + ?Sized> MonitoringSubworkflow<'a, S> {
    /// Opens the sub-workflow over a store, without event broadcasting.
    pub fn new(store: &'a mut S) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Broadcasts finalize and finance-review events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Monitoring is writable from stage 9 until stage 10 is approved.
    async fn writable_initiative(&self, id: &InitiativeId) -> Result<Initiative> {
        let initiative = require_initiative(&*self.store, id).await?;
        initiative.ensure_reached(STAGE_SAVINGS_MONITORING)?;
        if initiative.current_stage > STAGE_SAVINGS_VALIDATION {
            warn!(
                initiative_id = %initiative.id,
                stage = initiative.current_stage,
                "monitoring is locked after savings validation"
            );
            return Err(TollgateError::MonitoringLocked {
                initiative_id: initiative.id.to_string(),
                current: initiative.current_stage,
            });
        }
        Ok(initiative)
    }

    async fn load(&self, id: &EntryId) -> Result<MonitoringEntry> {
        self.store
            .get_monitoring_entry(id)
            .await?
            .ok_or_else(|| TollgateError::MonitoringEntryNotFound(id.to_string()))
    }

    /// Loads an entry whose initiative still accepts monitoring writes.
    async fn load_writable(&self, id: &EntryId) -> Result<MonitoringEntry> {
        let entry = self.load(id).await?;
        self.writable_initiative(&entry.initiative_id).await?;
        Ok(entry)
    }

    /// Creates an entry for (initiative, month, KPI).
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::DuplicateEntry`] if the triple already
    /// exists, [`TollgateError::StageNotReached`] before stage 9,
    /// [`TollgateError::MonitoringLocked`] once stage 10 is approved and
    /// [`TollgateError::WorkflowHalted`] once the initiative is halted.
    pub async fn record_entry(
        &mut self,
        initiative_id: &InitiativeId,
        month: MonitoringMonth,
        kpi_description: impl Into<String>,
        target_value: Decimal,
        entered_by: RoleCode,
    ) -> Result<MonitoringEntry> {
        self.writable_initiative(initiative_id).await?;

        let entry = MonitoringEntry::new(
            *initiative_id,
            month,
            kpi_description,
            target_value,
            entered_by,
        );
        self.store.insert_monitoring_entry(&entry).await?;
        info!(
            initiative_id = %initiative_id,
            entry_id = %entry.id,
            month = %month,
            kpi = %entry.kpi_description,
            "monitoring entry recorded"
        );
        Ok(entry)
    }

    /// Sets the achieved value and recomputes the deviation.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::AlreadyFinalized`] once the entry is locked.
    pub async fn set_achieved(&mut self, id: &EntryId, value: Decimal) -> Result<MonitoringEntry> {
        let mut entry = self.load_writable(id).await?;
        entry.ensure_open()?;

        entry.achieved_value = Some(value);
        entry.touch();
        self.store.save_monitoring_entry(&entry).await?;
        debug!(entry_id = %id, achieved = %value, deviation = ?entry.deviation, "achieved value set");
        Ok(entry)
    }

    /// Edits the KPI text, target or remarks of an open entry.
    pub async fn revise_entry(
        &mut self,
        id: &EntryId,
        revision: EntryRevision,
    ) -> Result<MonitoringEntry> {
        let mut entry = self.load_writable(id).await?;
        entry.ensure_open()?;

        if let Some(kpi) = revision.kpi_description {
            entry.kpi_description = kpi;
        }
        if let Some(target) = revision.target_value {
            entry.target_value = target;
        }
        if let Some(remarks) = revision.remarks {
            entry.remarks = Some(remarks);
        }
        entry.touch();
        self.store.save_monitoring_entry(&entry).await?;
        Ok(entry)
    }

    /// Locks the entry's figures for finance review.
    ///
    /// Finalizing an already finalized entry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::IncompleteEntry`] if no achieved value is set.
    pub async fn finalize(&mut self, id: &EntryId) -> Result<MonitoringEntry> {
        let mut entry = self.load_writable(id).await?;
        if entry.is_finalized {
            debug!(entry_id = %id, "entry already finalized");
            return Ok(entry);
        }
        if entry.achieved_value.is_none() {
            return Err(TollgateError::IncompleteEntry(id.to_string()));
        }

        entry.is_finalized = true;
        entry.touch();
        self.store.save_monitoring_entry(&entry).await?;
        info!(initiative_id = %entry.initiative_id, entry_id = %id, "monitoring entry finalized");
        self.emit(WorkflowEvent::MonitoringEntryFinalized {
            initiative_id: entry.initiative_id.to_string(),
            entry_id: id.to_string(),
        });
        Ok(entry)
    }

    /// Records the finance review of a finalized entry.
    ///
    /// Approval sets `finance_approved`. A refusal clears it and returns the
    /// entry to its owner unfinalized so the figures can be corrected and
    /// finalized again.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::NotFinalized`] if the entry is not finalized,
    /// or [`TollgateError::MonitoringLocked`] once stage 10 is approved.
    pub async fn finance_approve(
        &mut self,
        id: &EntryId,
        approved: bool,
        comments: Option<String>,
    ) -> Result<MonitoringEntry> {
        let mut entry = self.load_writable(id).await?;
        if !entry.is_finalized {
            warn!(entry_id = %id, "finance review attempted on unfinalized entry");
            return Err(TollgateError::NotFinalized(id.to_string()));
        }

        entry.finance_approved = approved;
        entry.finance_comments = comments;
        entry.finance_reviewed_at = Some(Utc::now());
        if !approved {
            entry.is_finalized = false;
        }
        entry.touch();
        self.store.save_monitoring_entry(&entry).await?;
        info!(
            initiative_id = %entry.initiative_id,
            entry_id = %id,
            approved,
            "finance review recorded"
        );
        self.emit(WorkflowEvent::FinanceReviewed {
            initiative_id: entry.initiative_id.to_string(),
            entry_id: id.to_string(),
            approved,
        });
        Ok(entry)
    }

    /// Entries of an initiative still lacking finance approval.
    ///
    /// Every call re-reads the store, so the sequence always reflects the
    /// current state.
    pub async fn pending_approvals(
        &self,
        initiative_id: &InitiativeId,
    ) -> Result<impl Iterator<Item = MonitoringEntry>> {
        let entries = self.store.list_monitoring_entries(initiative_id).await?;
        Ok(entries.into_iter().filter(|e| !e.finance_approved))
    }

    /// All entries of an initiative, by month then KPI.
    pub async fn entries(&self, initiative_id: &InitiativeId) -> Result<Vec<MonitoringEntry>> {
        self.store.list_monitoring_entries(initiative_id).await
    }

    /// Entries of an initiative for one month.
    pub async fn entries_for_month(
        &self,
        initiative_id: &InitiativeId,
        month: MonitoringMonth,
    ) -> Result<Vec<MonitoringEntry>> {
        let entries = self.store.list_monitoring_entries(initiative_id).await?;
        Ok(entries.into_iter().filter(|e| e.month == month).collect())
    }

    /// Loads one entry.
    pub async fn get_entry(&self, id: &EntryId) -> Result<MonitoringEntry> {
        self.load(id).await
    }

    /// Deletes an open entry.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::AlreadyFinalized`] if the entry is locked.
    pub async fn delete_entry(&mut self, id: &EntryId) -> Result<()> {
        let entry = self.load_writable(id).await?;
        entry.ensure_open()?;
        self.store.delete_monitoring_entry(id).await?;
        info!(entry_id = %id, "monitoring entry deleted");
        Ok(())
    }
}

/// Stage-9 gate: the first entry that is not finalized, if any.
pub(crate) fn first_unfinalized(entries: &[MonitoringEntry]) -> Option<&MonitoringEntry> {
    entries.iter().find(|e| !e.is_finalized)
}

/// Stage-10 gate: the first entry without finance approval, if any.
pub(crate) fn first_unapproved(entries: &[MonitoringEntry]) -> Option<&MonitoringEntry> {
    entries.iter().find(|e| !e.finance_approved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Identity, MemoryStateStore, NewInitiative, TransitionCommit};

    async fn initiative_at(store: &mut MemoryStateStore, stage: u32) -> Initiative {
        let mut initiative = Initiative::register(
            NewInitiative::new("Boiler efficiency", "NDS"),
            Identity::new("stld@nds.example"),
        );
        initiative.current_stage = stage;
        store
            .commit_transition(TransitionCommit::insert(initiative))
            .await
            .unwrap()
    }

    fn april() -> MonitoringMonth {
        MonitoringMonth::new(2025, 4).unwrap()
    }

    #[test]
    fn test_month_parse_and_display() {
        let month: MonitoringMonth = "2025-04".parse().unwrap();
        assert_eq!(month, april());
        assert_eq!(month.to_string(), "2025-04");
        assert!("2025-13".parse::<MonitoringMonth>().is_err());
        assert!("april".parse::<MonitoringMonth>().is_err());
    }

    #[test]
    fn test_month_serializes_as_string() {
        let json = serde_json::to_string(&april()).unwrap();
        assert_eq!(json, r#""2025-04""#);
        let back: MonitoringMonth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, april());
    }

    #[test]
    fn test_fiscal_year_months() {
        let months = MonitoringMonth::fiscal_year_months(2025);
        assert_eq!(months.len(), 12);
        assert_eq!(months[0].sheet_label(), "Apr.25");
        assert_eq!(months[11].sheet_label(), "Mar.26");
        assert!(months.iter().all(|m| m.fiscal_year() == 2025));
    }

    #[test]
    fn test_deviation_recomputed() {
        let mut entry = MonitoringEntry::new(
            InitiativeId::new(),
            april(),
            "Steam consumption",
            Decimal::new(100, 0),
            RoleCode::SiteTsdLead,
        );
        assert_eq!(entry.deviation, None);
        entry.achieved_value = Some(Decimal::new(85, 0));
        entry.recompute_deviation();
        assert_eq!(entry.deviation, Some(Decimal::new(-15, 0)));
    }

    #[tokio::test]
    async fn test_record_entry_before_stage_nine_fails() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 8).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let result = monitoring
            .record_entry(
                &initiative.id,
                april(),
                "Steam",
                Decimal::new(100, 0),
                RoleCode::SiteTsdLead,
            )
            .await;
        assert!(matches!(
            result,
            Err(TollgateError::StageNotReached { required: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_entry_rejected() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        let duplicate = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(90, 0), RoleCode::SiteTsdLead)
            .await;
        assert!(matches!(duplicate, Err(TollgateError::DuplicateEntry { .. })));

        monitoring
            .record_entry(&initiative.id, april().next(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        assert_eq!(monitoring.entries(&initiative.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_achieved_updates_deviation() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let entry = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();

        let entry = monitoring.set_achieved(&entry.id, Decimal::new(85, 0)).await.unwrap();
        assert_eq!(entry.deviation, Some(Decimal::new(-15, 0)));

        let entry = monitoring.set_achieved(&entry.id, Decimal::new(120, 0)).await.unwrap();
        assert_eq!(entry.deviation, Some(Decimal::new(20, 0)));

        let revised = monitoring
            .revise_entry(
                &entry.id,
                EntryRevision {
                    target_value: Some(Decimal::new(110, 0)),
                    ..EntryRevision::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(revised.deviation, Some(Decimal::new(10, 0)));
    }

    #[tokio::test]
    async fn test_finalize_requires_achieved_and_locks_entry() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let entry = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        assert!(matches!(
            monitoring.finalize(&entry.id).await,
            Err(TollgateError::IncompleteEntry(_))
        ));

        monitoring.set_achieved(&entry.id, Decimal::new(95, 0)).await.unwrap();
        let finalized = monitoring.finalize(&entry.id).await.unwrap();
        assert!(finalized.is_finalized);

        // idempotent
        assert!(monitoring.finalize(&entry.id).await.unwrap().is_finalized);

        assert!(matches!(
            monitoring.set_achieved(&entry.id, Decimal::new(1, 0)).await,
            Err(TollgateError::AlreadyFinalized(_))
        ));
        assert!(matches!(
            monitoring.delete_entry(&entry.id).await,
            Err(TollgateError::AlreadyFinalized(_))
        ));
    }

    #[tokio::test]
    async fn test_finance_approval_requires_finalized() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let entry = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        monitoring.set_achieved(&entry.id, Decimal::new(100, 0)).await.unwrap();

        assert!(matches!(
            monitoring.finance_approve(&entry.id, true, None).await,
            Err(TollgateError::NotFinalized(_))
        ));

        monitoring.finalize(&entry.id).await.unwrap();
        let approved = monitoring
            .finance_approve(&entry.id, true, Some("matches ledger".to_string()))
            .await
            .unwrap();
        assert!(approved.finance_approved);
        assert_eq!(approved.finance_comments.as_deref(), Some("matches ledger"));
        assert_eq!(monitoring.pending_approvals(&initiative.id).await.unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_finance_refusal_reopens_entry() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let entry = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        monitoring.set_achieved(&entry.id, Decimal::new(100, 0)).await.unwrap();
        monitoring.finalize(&entry.id).await.unwrap();

        let refused = monitoring
            .finance_approve(&entry.id, false, Some("wrong meter".to_string()))
            .await
            .unwrap();
        assert!(!refused.finance_approved);
        assert!(!refused.is_finalized);
        assert!(refused.finance_reviewed_at.is_some());

        let corrected = monitoring.set_achieved(&entry.id, Decimal::new(97, 0)).await.unwrap();
        assert_eq!(corrected.deviation, Some(Decimal::new(-3, 0)));
    }

    #[tokio::test]
    async fn test_monitoring_locked_after_savings_validation() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 10).await;

        let entry = {
            let mut monitoring = MonitoringSubworkflow::new(&mut store);
            let entry = monitoring
                .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
                .await
                .unwrap();
            monitoring.set_achieved(&entry.id, Decimal::new(100, 0)).await.unwrap();
            monitoring.finalize(&entry.id).await.unwrap();
            monitoring.finance_approve(&entry.id, true, None).await.unwrap()
        };

        let mut closing = initiative.clone();
        closing.current_stage = 11;
        store
            .commit_transition(TransitionCommit::update(closing, initiative.version))
            .await
            .unwrap();

        let mut monitoring = MonitoringSubworkflow::new(&mut store);
        let refused = monitoring.finance_approve(&entry.id, false, None).await;
        assert!(matches!(
            refused,
            Err(TollgateError::MonitoringLocked { current: 11, .. })
        ));
        let added = monitoring
            .record_entry(&initiative.id, april(), "Power", Decimal::new(5, 0), RoleCode::SiteTsdLead)
            .await;
        assert!(matches!(added, Err(TollgateError::MonitoringLocked { .. })));
        assert!(matches!(
            monitoring.delete_entry(&entry.id).await,
            Err(TollgateError::MonitoringLocked { .. })
        ));

        let kept = monitoring.get_entry(&entry.id).await.unwrap();
        assert!(kept.finance_approved);
        assert!(kept.is_finalized);
        assert_eq!(monitoring.entries(&initiative.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finance_review_open_at_validation_stage() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 10).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        let entry = monitoring
            .record_entry(&initiative.id, april(), "Steam", Decimal::new(100, 0), RoleCode::SiteTsdLead)
            .await
            .unwrap();
        monitoring.set_achieved(&entry.id, Decimal::new(90, 0)).await.unwrap();
        monitoring.finalize(&entry.id).await.unwrap();

        let refused = monitoring.finance_approve(&entry.id, false, None).await.unwrap();
        assert!(!refused.is_finalized);
    }

    #[tokio::test]
    async fn test_pending_approvals_requeries() {
        let mut store = MemoryStateStore::new();
        let initiative = initiative_at(&mut store, 9).await;
        let mut monitoring = MonitoringSubworkflow::new(&mut store);

        for kpi in ["Steam", "Power"] {
            let entry = monitoring
                .record_entry(&initiative.id, april(), kpi, Decimal::new(10, 0), RoleCode::SiteTsdLead)
                .await
                .unwrap();
            monitoring.set_achieved(&entry.id, Decimal::new(10, 0)).await.unwrap();
            monitoring.finalize(&entry.id).await.unwrap();
        }

        let pending: Vec<_> = monitoring.pending_approvals(&initiative.id).await.unwrap().collect();
        assert_eq!(pending.len(), 2);

        monitoring.finance_approve(&pending[0].id, true, None).await.unwrap();
        let pending: Vec<_> = monitoring.pending_approvals(&initiative.id).await.unwrap().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            monitoring.entries_for_month(&initiative.id, april()).await.unwrap().len(),
            2
        );
    }

    #[test]
    fn test_gate_helpers() {
        let id = InitiativeId::new();
        let mut a = MonitoringEntry::new(id, april(), "a", Decimal::ONE, RoleCode::SiteTsdLead);
        let b = MonitoringEntry::new(id, april(), "b", Decimal::ONE, RoleCode::SiteTsdLead);
        a.is_finalized = true;
        a.finance_approved = true;
        let entries = vec![a, b];
        assert_eq!(first_unfinalized(&entries).map(|e| e.kpi_description.as_str()), Some("b"));
        assert_eq!(first_unapproved(&entries).map(|e| e.kpi_description.as_str()), Some("b"));
        assert!(first_unfinalized(&entries[..1]).is_none());
    }
}
