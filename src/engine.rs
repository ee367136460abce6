//! The stage transition engine.
//!
//! [`TransitionEngine`] applies one [`Decision`] at a time to an initiative:
//! it authorizes the actor against the stage the initiative is waiting on,
//! enforces the stage-specific payload and the savings gates, resolves the
//! conditional path, binds the Initiative Lead at stage 3, and writes the
//! result through a single [`TransitionCommit`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::catalog::{
    StageCatalog, STAGE_CAPITAL_APPROVAL, STAGE_DEFINE_RESPONSIBILITIES, STAGE_ENGINEERING_CHANGE,
    STAGE_SAVINGS_MONITORING, STAGE_SAVINGS_VALIDATION, STAGE_SITE_HEAD_APPROVAL,
};
use crate::config::{EngineSettings, TollgateConfig};
use crate::directory::{self, AssignMode, RoleAssignment, RoleAssignmentDirectory};
use crate::event::WorkflowEvent;
use crate::initiative::{Initiative, InitiativeId, InitiativeStatus, NewInitiative};
use crate::monitoring::{self, MonitoringSubworkflow};
use crate::progress::{self, InitiativeProgress};
use crate::role::Identity;
use crate::stage::{Decision, StageDetails, StageState};
use crate::state_store::{require_initiative, StateStore, TransitionCommit};
use crate::timeline::TimelineSubworkflow;
use crate::{Result, TollgateError};

/// What a successful `advance` did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionKind {
    /// The stage was approved and the initiative moved on.
    Advanced {
        /// The stage now awaiting action.
        to_stage: u32,
        /// Conditional stages skipped on the way.
        bypassed: Vec<u32>,
    },
    /// The final stage was approved.
    Completed,
    /// The initiative was rejected at the stage.
    Rejected,
}

/// Result of [`TransitionEngine::advance`].
#[derive(Debug, Clone)]
pub struct Transition {
    /// The initiative as committed, carrying its new version.
    pub initiative: Initiative,
    /// The stage the decision applied to.
    pub from_stage: u32,
    /// What happened.
    pub kind: TransitionKind,
}

impl Transition {
    /// Returns the stages bypassed by this transition.
    pub fn bypassed(&self) -> &[u32] {
        match &self.kind {
            TransitionKind::Advanced { bypassed, .. } => bypassed,
            _ => &[],
        }
    }

    /// Returns true if the transition completed the initiative.
    pub fn is_completion(&self) -> bool {
        self.kind == TransitionKind::Completed
    }
}

/// Validates and applies stage transitions.
///
/// The engine holds no per-initiative state; everything lives in the
/// [`StateStore`] passed to each call. Concurrent `advance` calls on the same
/// initiative are serialized by the store's optimistic version check: only
/// one commit per version succeeds, the others fail with
/// [`TollgateError::ConcurrentModification`].
///
/// # Example
///
/// ```
/// use tollgate::{Decision, Identity, MemoryStateStore, NewInitiative, TransitionEngine};
///
/// # async fn example() -> tollgate::Result<()> {
/// let engine = TransitionEngine::default();
/// let mut store = MemoryStateStore::new();
///
/// let initiator = Identity::new("stld@nds.example");
/// let initiative = engine
///     .register(NewInitiative::new("Steam trap survey", "NDS"), initiator.clone(), &mut store)
///     .await?;
///
/// // The initiator submits stage 1.
/// let transition = engine
///     .advance(&initiative, &initiator, Decision::approve(), &mut store)
///     .await?;
/// assert_eq!(transition.initiative.current_stage, 2);
/// # Ok(())
/// # }
/// ```
///
/// # Thread Safety
///
/// `TransitionEngine` is `Send + Sync` and cheap to clone; clones share the
/// catalog and the event channel.
#[derive(Clone)]
pub struct TransitionEngine {
    catalog: Arc<StageCatalog>,
    settings: EngineSettings,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl TransitionEngine {
    /// Creates an engine over a catalog with default settings.
    pub fn new(catalog: StageCatalog) -> Self {
        Self::with_settings(catalog, EngineSettings::default())
    }

    /// Creates an engine with explicit settings.
    pub fn with_settings(catalog: StageCatalog, settings: EngineSettings) -> Self {
        let (event_tx, _) = broadcast::channel(settings.event_channel_capacity.max(1));
        Self {
            catalog: Arc::new(catalog),
            settings,
            event_tx,
        }
    }

    /// Creates an engine over the standard catalog from loaded configuration.
    pub fn from_config(config: &TollgateConfig) -> Self {
        Self::with_settings(StageCatalog::standard(), config.engine.clone())
    }

    /// Returns the stage catalog.
    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Returns the engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Subscribes to workflow events.
    ///
    /// Returns a receiver that will receive all events broadcast by this
    /// engine and the sub-workflows it opens. Events are not persisted; if
    /// the receiver is too slow, events may be dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Emits an event to all subscribers.
    ///
    /// Ignores send errors (no subscribers or channel full).
    pub(crate) fn emit(&self, event: WorkflowEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Registers a new initiative at stage 1, status Pending.
    ///
    /// Any identity may register; no role is checked at the entry point.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidDecision`] if the title or site is
    /// blank, or a store error if the initiative cannot be written.
    pub async fn register<S: StateStore + ?Sized>(
        &self,
        draft: NewInitiative,
        created_by: Identity,
        store: &mut S,
    ) -> Result<Initiative> {
        let first = self.catalog.first_stage();
        if draft.title.trim().is_empty() || draft.site.trim().is_empty() {
            return Err(TollgateError::InvalidDecision {
                stage: first,
                reason: "an initiative needs a title and a site".to_string(),
            });
        }

        let mut initiative = Initiative::register(draft, created_by);
        initiative.current_stage = first;
        let stored = store
            .commit_transition(
                TransitionCommit::insert(initiative).with_stage(first, StageState::started()),
            )
            .await?;

        info!(
            initiative_id = %stored.id,
            site = %stored.site,
            created_by = %stored.created_by,
            "initiative registered"
        );
        self.emit(WorkflowEvent::InitiativeRegistered {
            initiative_id: stored.id.to_string(),
            site: stored.site.clone(),
            created_by: stored.created_by.to_string(),
        });
        Ok(stored)
    }

    /// Applies `decision` to the stage `initiative` is waiting on.
    ///
    /// `initiative` is the caller's snapshot. The engine reloads the stored
    /// record and decides against it, never against the snapshot's fields;
    /// the call fails with [`TollgateError::ConcurrentModification`] if the
    /// stored initiative has moved on since the snapshot was read.
    ///
    /// # Errors
    ///
    /// - [`TollgateError::WorkflowHalted`] if the initiative is Rejected or Completed
    /// - [`TollgateError::Unauthorized`] if `actor` does not hold the stage
    /// - [`TollgateError::Unassigned`] if nobody holds the stage
    /// - [`TollgateError::InvalidDecision`] if the payload does not fit the stage
    /// - [`TollgateError::NotFinalized`] / [`TollgateError::FinanceApprovalPending`]
    ///   if the savings gates are not met
    /// - [`TollgateError::DuplicateAssignment`] if the Initiative-Lead stages
    ///   are already held by someone else
    pub async fn advance<S: StateStore + ?Sized>(
        &self,
        initiative: &Initiative,
        actor: &Identity,
        decision: Decision,
        store: &mut S,
    ) -> Result<Transition> {
        let span = info_span!(
            "advance",
            initiative_id = %initiative.id,
            stage = initiative.current_stage
        );
        self.advance_internal(initiative, actor, decision, store)
            .instrument(span)
            .await
    }

    async fn advance_internal<S: StateStore + ?Sized>(
        &self,
        snapshot: &Initiative,
        actor: &Identity,
        decision: Decision,
        store: &mut S,
    ) -> Result<Transition> {
        let stored = self.current(snapshot, &*store).await?;
        let initiative = &stored;
        if let Err(e) = initiative.ensure_active() {
            warn!(status = %initiative.status, "initiative accepts no further action");
            return Err(e);
        }

        let stage = initiative.current_stage;
        self.catalog.stage_by_number(stage)?;
        self.authorize(initiative, stage, actor, &*store).await?;

        let mut states = store.get_stage_states(&initiative.id).await?;
        let mut record = states.get(&stage).cloned().unwrap_or_else(StageState::started);
        let mut updated = initiative.clone();
        updated.updated_at = Utc::now();

        let approval = match decision {
            Decision::Reject { reason } => {
                record.mark_rejected(actor.clone(), reason.clone());
                states.insert(stage, record.clone());
                updated.status = InitiativeStatus::Rejected;
                updated.progress_percentage =
                    progress::percentage_for(&self.catalog, updated.path, &states);

                let commit =
                    TransitionCommit::update(updated, initiative.version).with_stage(stage, record);
                let stored = self.commit(store, commit).await?;

                info!(actor = %actor, reason = %reason, "initiative rejected");
                self.emit(WorkflowEvent::StageRejected {
                    initiative_id: stored.id.to_string(),
                    stage,
                    actor: actor.to_string(),
                    reason,
                });
                return Ok(Transition {
                    initiative: stored,
                    from_stage: stage,
                    kind: TransitionKind::Rejected,
                });
            }
            Decision::Approve(approval) => approval,
        };

        let assignments = self
            .apply_details(&mut updated, stage, approval.details, store)
            .await?;
        self.check_gates(&updated, stage, &*store).await?;

        record.mark_approved(actor.clone(), approval.comments);
        states.insert(stage, record.clone());
        let mut touched = vec![(stage, record)];

        let next = self.catalog.next_stage(stage, updated.path)?;
        for &number in &next.bypassed {
            let mut skipped = states.get(&number).cloned().unwrap_or_default();
            skipped.mark_bypassed();
            states.insert(number, skipped.clone());
            touched.push((number, skipped));
        }

        if updated.status == InitiativeStatus::Pending && stage >= STAGE_SITE_HEAD_APPROVAL {
            updated.status = InitiativeStatus::InProgress;
        }
        let kind = match next.next {
            Some(number) => {
                let mut upcoming = states.get(&number).cloned().unwrap_or_default();
                upcoming.mark_started();
                states.insert(number, upcoming.clone());
                touched.push((number, upcoming));
                updated.current_stage = number;
                TransitionKind::Advanced {
                    to_stage: number,
                    bypassed: next.bypassed.clone(),
                }
            }
            None => {
                updated.status = InitiativeStatus::Completed;
                TransitionKind::Completed
            }
        };
        updated.progress_percentage =
            progress::percentage_for(&self.catalog, updated.path, &states);

        let mut commit = TransitionCommit::update(updated, initiative.version);
        commit.stage_states = touched;
        commit.assignments = assignments;
        let stored = self.commit(store, commit).await?;

        info!(
            actor = %actor,
            to_stage = stored.current_stage,
            progress = stored.progress_percentage,
            "stage approved"
        );
        self.emit_approval(&stored, stage, actor, &next.bypassed, &kind);

        Ok(Transition {
            initiative: stored,
            from_stage: stage,
            kind,
        })
    }

    fn emit_approval(
        &self,
        stored: &Initiative,
        stage: u32,
        actor: &Identity,
        bypassed: &[u32],
        kind: &TransitionKind,
    ) {
        let initiative_id = stored.id.to_string();
        self.emit(WorkflowEvent::StageApproved {
            initiative_id: initiative_id.clone(),
            stage,
            actor: actor.to_string(),
        });
        if stage == STAGE_DEFINE_RESPONSIBILITIES {
            if let Some(lead) = &stored.initiative_lead {
                self.emit(WorkflowEvent::InitiativeLeadBound {
                    initiative_id: initiative_id.clone(),
                    lead: lead.to_string(),
                });
            }
        }
        for &number in bypassed {
            debug!(stage = number, "stage bypassed");
            self.emit(WorkflowEvent::StageBypassed {
                initiative_id: initiative_id.clone(),
                stage: number,
            });
        }
        if *kind == TransitionKind::Completed {
            info!("initiative completed");
            self.emit(WorkflowEvent::InitiativeCompleted { initiative_id });
        }
    }

    /// Loads the stored initiative behind a caller's snapshot.
    ///
    /// Every decision is evaluated against the stored record; the snapshot
    /// only pins the version the caller saw.
    async fn current<S: StateStore + ?Sized>(
        &self,
        snapshot: &Initiative,
        store: &S,
    ) -> Result<Initiative> {
        let stored = require_initiative(store, &snapshot.id).await?;
        if stored.version != snapshot.version {
            warn!(
                expected = snapshot.version,
                found = stored.version,
                "decision based on a stale snapshot"
            );
            return Err(TollgateError::ConcurrentModification {
                initiative_id: stored.id.to_string(),
                expected: snapshot.version,
                found: stored.version,
            });
        }
        Ok(stored)
    }

    /// Returns the identity entitled to act on `stage`, if the roster is consistent.
    async fn holder<S: StateStore + ?Sized>(
        &self,
        initiative: &Initiative,
        stage: u32,
        store: &S,
    ) -> Result<Option<Identity>> {
        if stage == self.catalog.first_stage() {
            return Ok(Some(initiative.created_by.clone()));
        }
        let required_role = self.catalog.required_role(stage)?;
        let assignment = directory::lookup(store, initiative, stage).await?;
        if assignment.role != required_role {
            warn!(
                stage,
                required = %required_role,
                assigned = %assignment.role,
                "assignment role does not match the catalog"
            );
            return Ok(None);
        }
        Ok(Some(assignment.identity))
    }

    async fn authorize<S: StateStore + ?Sized>(
        &self,
        initiative: &Initiative,
        stage: u32,
        actor: &Identity,
        store: &S,
    ) -> Result<()> {
        match self.holder(initiative, stage, store).await? {
            Some(holder) if holder == *actor => {
                debug!(actor = %actor, "actor authorized");
                Ok(())
            }
            _ => {
                let required_role = self.catalog.required_role(stage)?;
                warn!(actor = %actor, required = %required_role, "actor does not hold the stage");
                Err(TollgateError::Unauthorized {
                    stage,
                    required_role,
                    actor: actor.clone(),
                })
            }
        }
    }

    /// Applies the stage-specific payload to `updated` and returns the role
    /// assignments the transition must write.
    async fn apply_details<S: StateStore + ?Sized>(
        &self,
        updated: &mut Initiative,
        stage: u32,
        details: StageDetails,
        store: &mut S,
    ) -> Result<Vec<RoleAssignment>> {
        match (stage, details) {
            (STAGE_DEFINE_RESPONSIBILITIES, StageDetails::Responsibilities(assignment)) => {
                updated.path = Some(assignment.path());
                let planned = RoleAssignmentDirectory::new(&mut *store)
                    .plan_initiative_lead(
                        &self.catalog,
                        updated,
                        &assignment.initiative_lead,
                        AssignMode::KeepExisting,
                    )
                    .await?;
                debug!(
                    lead = %assignment.initiative_lead,
                    new_assignments = planned.len(),
                    "initiative lead planned"
                );
                updated.initiative_lead = Some(assignment.initiative_lead);
                Ok(planned)
            }
            (STAGE_DEFINE_RESPONSIBILITIES, _) => Err(TollgateError::InvalidDecision {
                stage,
                reason: "approval must name the initiative lead and the conditional path"
                    .to_string(),
            }),
            (STAGE_ENGINEERING_CHANGE, StageDetails::EngineeringChange { moc_number }) => {
                updated.moc_number = Some(moc_number);
                Ok(Vec::new())
            }
            (STAGE_CAPITAL_APPROVAL, StageDetails::CapitalApproval { capex_number }) => {
                updated.capex_number = Some(capex_number);
                Ok(Vec::new())
            }
            (STAGE_SAVINGS_VALIDATION, StageDetails::SavingsValidated { actual_savings }) => {
                updated.actual_savings = Some(actual_savings);
                Ok(Vec::new())
            }
            (_, StageDetails::None) => Ok(Vec::new()),
            (_, other) => Err(TollgateError::InvalidDecision {
                stage,
                reason: format!("{:?} does not apply to this stage", other),
            }),
        }
    }

    /// Savings gates: stage 9 needs every entry finalized, stage 10 every
    /// entry finance-approved.
    async fn check_gates<S: StateStore + ?Sized>(
        &self,
        initiative: &Initiative,
        stage: u32,
        store: &S,
    ) -> Result<()> {
        if stage != STAGE_SAVINGS_MONITORING && stage != STAGE_SAVINGS_VALIDATION {
            return Ok(());
        }

        let entries = store.list_monitoring_entries(&initiative.id).await?;
        if entries.is_empty() && self.settings.require_monitoring_entries {
            warn!("no monitoring entries recorded");
            return Err(TollgateError::InvalidDecision {
                stage,
                reason: "no monitoring entries recorded".to_string(),
            });
        }

        if stage == STAGE_SAVINGS_MONITORING {
            if let Some(entry) = monitoring::first_unfinalized(&entries) {
                warn!(entry_id = %entry.id, "monitoring entry not finalized");
                return Err(TollgateError::NotFinalized(entry.id.to_string()));
            }
        } else if let Some(entry) = monitoring::first_unapproved(&entries) {
            warn!(entry_id = %entry.id, "monitoring entry awaits finance approval");
            return Err(TollgateError::FinanceApprovalPending {
                stage,
                entry: entry.id.to_string(),
            });
        }
        debug!(entries = entries.len(), "savings gate passed");
        Ok(())
    }

    async fn commit<S: StateStore + ?Sized>(
        &self,
        store: &mut S,
        commit: TransitionCommit,
    ) -> Result<Initiative> {
        store.commit_transition(commit).await.map_err(|e| {
            if e.is_retryable() {
                warn!(error = %e, "stale transition rejected");
            }
            e
        })
    }

    /// Hands the Initiative-Lead stages of an initiative to a new lead.
    ///
    /// Only the holder of stage 3 may reassign, and only after stage 3 was
    /// approved. Reassigning to the current lead changes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::StageNotReached`] before stage 3 completes,
    /// [`TollgateError::Unauthorized`] for anyone but the stage-3 holder, and
    /// [`TollgateError::WorkflowHalted`] once the initiative is halted.
    pub async fn reassign_initiative_lead<S: StateStore + ?Sized>(
        &self,
        initiative_id: &InitiativeId,
        actor: &Identity,
        new_lead: Identity,
        store: &mut S,
    ) -> Result<Initiative> {
        let span = info_span!("reassign_lead", initiative_id = %initiative_id);
        async move {
            let initiative = require_initiative(&*store, initiative_id).await?;
            initiative.ensure_reached(STAGE_DEFINE_RESPONSIBILITIES + 1)?;
            self.authorize(&initiative, STAGE_DEFINE_RESPONSIBILITIES, actor, &*store)
                .await?;

            let assignments = RoleAssignmentDirectory::new(&mut *store)
                .plan_initiative_lead(&self.catalog, &initiative, &new_lead, AssignMode::Overwrite)
                .await?;
            if assignments.is_empty() && initiative.initiative_lead.as_ref() == Some(&new_lead) {
                debug!(lead = %new_lead, "lead unchanged");
                return Ok(initiative);
            }

            let mut updated = initiative.clone();
            updated.initiative_lead = Some(new_lead.clone());
            updated.updated_at = Utc::now();
            let mut commit = TransitionCommit::update(updated, initiative.version);
            commit.assignments = assignments;
            let stored = self.commit(store, commit).await?;

            info!(actor = %actor, lead = %new_lead, "initiative lead reassigned");
            self.emit(WorkflowEvent::InitiativeLeadBound {
                initiative_id: stored.id.to_string(),
                lead: new_lead.to_string(),
            });
            Ok(stored)
        }
        .instrument(span)
        .await
    }

    /// Gets the per-stage progress of an initiative.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InitiativeNotFound`] if it does not exist.
    pub async fn status<S: StateStore + ?Sized>(
        &self,
        initiative_id: &InitiativeId,
        store: &S,
    ) -> Result<InitiativeProgress> {
        let initiative = require_initiative(store, initiative_id).await?;
        let states: BTreeMap<u32, StageState> = store.get_stage_states(initiative_id).await?;
        Ok(InitiativeProgress::build(&self.catalog, &initiative, &states))
    }

    /// The work queue of `identity`: active initiatives whose current stage
    /// it is entitled to decide, oldest first.
    pub async fn pending_for<S: StateStore + ?Sized>(
        &self,
        identity: &Identity,
        store: &S,
    ) -> Result<Vec<Initiative>> {
        let mut queue = Vec::new();
        for initiative in store.list_initiatives().await? {
            if initiative.is_halted() {
                continue;
            }
            match self.holder(&initiative, initiative.current_stage, store).await {
                Ok(Some(holder)) if holder == *identity => queue.push(initiative),
                Ok(_) | Err(TollgateError::Unassigned { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(identity = %identity, pending = queue.len(), "work queue collected");
        Ok(queue)
    }

    /// Opens the monitoring sub-workflow, broadcasting on this engine's channel.
    pub fn monitoring<'a, S: StateStore + ?Sized>(
        &self,
        store: &'a mut S,
    ) -> MonitoringSubworkflow<'a, S> {
        MonitoringSubworkflow::new(store).with_events(self.event_tx.clone())
    }

    /// Opens the timeline sub-workflow, broadcasting on this engine's channel.
    pub fn timeline<'a, S: StateStore + ?Sized>(
        &self,
        store: &'a mut S,
    ) -> TimelineSubworkflow<'a, S> {
        TimelineSubworkflow::new(store).with_events(self.event_tx.clone())
    }
}

impl Default for TransitionEngine {
    fn default() -> Self {
        Self::new(StageCatalog::standard())
    }
}

impl std::fmt::Debug for TransitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionEngine")
            .field("stage_count", &self.catalog.len())
            .field("settings", &self.settings)
            .finish()
    }
}
