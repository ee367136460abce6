//! Milestone timeline tracker with dual sign-off.
//!
//! Milestones become available once the initiative reaches the timeline
//! stage and its Initiative Lead is bound. A milestone is complete when both
//! the Site TSD Lead and the Initiative Lead have approved it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::STAGE_TIMELINE_TRACKER;
use crate::initiative::{Initiative, InitiativeId};
use crate::role::{Identity, RoleCode};
use crate::state_store::{require_initiative, StateStore};
use crate::{Result, TollgateError, WorkflowEvent};

/// Unique identifier of a timeline milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MilestoneId(Uuid);

impl MilestoneId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MilestoneId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MilestoneId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Execution status reported for a milestone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MilestoneStatus {
    /// Not started.
    #[default]
    Pending,
    /// Under way.
    InProgress,
    /// Work finished.
    Completed,
    /// Behind plan.
    Delayed,
}

/// Which flag an approver role controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalSlot {
    SiteLead,
    InitiativeLead,
}

impl TryFrom<RoleCode> for ApprovalSlot {
    type Error = TollgateError;

    fn try_from(role: RoleCode) -> Result<Self> {
        match role {
            RoleCode::SiteTsdLead => Ok(Self::SiteLead),
            RoleCode::InitiativeLead => Ok(Self::InitiativeLead),
            other => Err(TollgateError::InvalidApprover(other)),
        }
    }
}

/// One milestone on an initiative's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Unique identifier.
    pub id: MilestoneId,
    /// Owning initiative.
    pub initiative_id: InitiativeId,
    /// What the milestone delivers.
    pub description: String,
    /// Planned (start) date.
    pub planned_date: NaiveDate,
    /// Planned end date.
    pub planned_end_date: Option<NaiveDate>,
    /// Person responsible for delivery.
    pub responsible_person: Option<Identity>,
    /// Reported execution status.
    pub status: MilestoneStatus,
    /// Free-text remarks.
    pub remarks: Option<String>,
    /// Site TSD Lead sign-off.
    pub site_lead_approval: bool,
    /// Initiative Lead sign-off.
    pub initiative_lead_approval: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl TimelineEntry {
    /// Creates an unapproved milestone.
    pub fn new(
        initiative_id: InitiativeId,
        description: impl Into<String>,
        planned_date: NaiveDate,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MilestoneId::new(),
            initiative_id,
            description: description.into(),
            planned_date,
            planned_end_date: None,
            responsible_person: None,
            status: MilestoneStatus::Pending,
            remarks: None,
            site_lead_approval: false,
            initiative_lead_approval: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// True iff both approvals are present.
    pub fn is_complete(&self) -> bool {
        self.site_lead_approval && self.initiative_lead_approval
    }
}

/// Editable milestone details. `None` leaves a field unchanged; approvals
/// are not part of an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MilestoneUpdate {
    /// New description.
    pub description: Option<String>,
    /// New planned date.
    pub planned_date: Option<NaiveDate>,
    /// New planned end date.
    pub planned_end_date: Option<NaiveDate>,
    /// New responsible person.
    pub responsible_person: Option<Identity>,
    /// New status.
    pub status: Option<MilestoneStatus>,
    /// New remarks.
    pub remarks: Option<String>,
}

/// Milestone operations for initiatives past the timeline stage.
pub struct TimelineSubworkflow<'a, S: StateStore + ?Sized> {
    store: &'a mut S,
    events: Option<broadcast::Sender<WorkflowEvent>>,
}

impl<'a, S: StateStore + ?Sized> TimelineSubworkflow<'a, S> {
    /// Opens the sub-workflow over a store, without event broadcasting.
    pub fn new(store: &'a mut S) -> Self {
        Self {
            store,
            events: None,
        }
    }

    /// Broadcasts milestone approval events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<WorkflowEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn writable_initiative(&self, id: &InitiativeId) -> Result<Initiative> {
        let initiative = require_initiative(&*self.store, id).await?;
        initiative.ensure_reached(STAGE_TIMELINE_TRACKER)?;
        if initiative.initiative_lead.is_none() {
            return Err(TollgateError::Unassigned {
                site: initiative.site.clone(),
                stage: STAGE_TIMELINE_TRACKER,
            });
        }
        Ok(initiative)
    }

    async fn load(&self, id: &MilestoneId) -> Result<TimelineEntry> {
        self.store
            .get_milestone(id)
            .await?
            .ok_or_else(|| TollgateError::MilestoneNotFound(id.to_string()))
    }

    async fn load_writable(&self, id: &MilestoneId) -> Result<TimelineEntry> {
        let entry = self.load(id).await?;
        self.writable_initiative(&entry.initiative_id).await?;
        Ok(entry)
    }

    /// Adds a milestone to an initiative's timeline.
    pub async fn record_milestone(
        &mut self,
        initiative_id: &InitiativeId,
        description: impl Into<String>,
        planned_date: NaiveDate,
    ) -> Result<TimelineEntry> {
        self.writable_initiative(initiative_id).await?;

        let entry = TimelineEntry::new(*initiative_id, description, planned_date);
        self.store.insert_milestone(&entry).await?;
        info!(
            initiative_id = %initiative_id,
            milestone_id = %entry.id,
            planned = %planned_date,
            "milestone recorded"
        );
        Ok(entry)
    }

    /// Edits milestone details. Approval flags are never touched.
    pub async fn update_milestone(
        &mut self,
        id: &MilestoneId,
        update: MilestoneUpdate,
    ) -> Result<TimelineEntry> {
        let mut entry = self.load_writable(id).await?;

        if let Some(description) = update.description {
            entry.description = description;
        }
        if let Some(date) = update.planned_date {
            entry.planned_date = date;
        }
        if let Some(date) = update.planned_end_date {
            entry.planned_end_date = Some(date);
        }
        if let Some(person) = update.responsible_person {
            entry.responsible_person = Some(person);
        }
        if let Some(status) = update.status {
            entry.status = status;
        }
        if let Some(remarks) = update.remarks {
            entry.remarks = Some(remarks);
        }
        entry.updated_at = Utc::now();
        self.store.save_milestone(&entry).await?;
        Ok(entry)
    }

    /// Records an approval. `STLD` controls the site-lead flag and `IL` the
    /// initiative-lead flag.
    ///
    /// Approvals are monotone: passing `false` for a flag that is already
    /// set leaves it set. Use [`reset_approvals`](Self::reset_approvals) to
    /// clear them.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidApprover`] for any other role.
    pub async fn set_approval(
        &mut self,
        id: &MilestoneId,
        approver: RoleCode,
        value: bool,
    ) -> Result<TimelineEntry> {
        let slot = ApprovalSlot::try_from(approver)?;
        let mut entry = self.load_writable(id).await?;

        let flag = match slot {
            ApprovalSlot::SiteLead => &mut entry.site_lead_approval,
            ApprovalSlot::InitiativeLead => &mut entry.initiative_lead_approval,
        };
        if !value {
            debug!(milestone_id = %id, role = %approver, "approval withdrawal ignored");
            return Ok(entry);
        }
        if *flag {
            debug!(milestone_id = %id, role = %approver, "approval already recorded");
            return Ok(entry);
        }
        *flag = true;

        entry.updated_at = Utc::now();
        self.store.save_milestone(&entry).await?;
        let complete = entry.is_complete();
        info!(milestone_id = %id, role = %approver, complete, "milestone approved");
        if let Some(tx) = &self.events {
            let _ = tx.send(WorkflowEvent::MilestoneApproved {
                initiative_id: entry.initiative_id.to_string(),
                milestone_id: id.to_string(),
                role: approver,
                complete,
            });
        }
        Ok(entry)
    }

    /// Clears both approvals, e.g. after the milestone was re-planned.
    pub async fn reset_approvals(&mut self, id: &MilestoneId) -> Result<TimelineEntry> {
        let mut entry = self.load_writable(id).await?;
        entry.site_lead_approval = false;
        entry.initiative_lead_approval = false;
        entry.updated_at = Utc::now();
        self.store.save_milestone(&entry).await?;
        info!(milestone_id = %id, "milestone approvals reset");
        Ok(entry)
    }

    /// Milestones of an initiative that still lack an approval.
    ///
    /// Every call re-reads the store.
    pub async fn pending_approvals(
        &self,
        initiative_id: &InitiativeId,
    ) -> Result<impl Iterator<Item = TimelineEntry>> {
        let entries = self.store.list_milestones(initiative_id).await?;
        Ok(entries.into_iter().filter(|e| !e.is_complete()))
    }

    /// All milestones of an initiative, by planned date.
    pub async fn entries(&self, initiative_id: &InitiativeId) -> Result<Vec<TimelineEntry>> {
        self.store.list_milestones(initiative_id).await
    }

    /// Loads one milestone.
    pub async fn get_milestone(&self, id: &MilestoneId) -> Result<TimelineEntry> {
        self.load(id).await
    }

    /// Deletes a milestone.
    pub async fn delete_milestone(&mut self, id: &MilestoneId) -> Result<()> {
        self.load_writable(id).await?;
        self.store.delete_milestone(id).await?;
        info!(milestone_id = %id, "milestone deleted");
        Ok(())
    }
}
