//! The role assignment directory: who holds the role a stage requires.
//!
//! Assignments are keyed by [`AssignmentKey`]. Site-wide entries (no
//! initiative) form the static roster seeded at setup for the fixed stages.
//! Initiative-scoped entries are created at stage-3 completion for the
//! Initiative-Lead stages and shadow any site-wide entry for the same stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::catalog::StageCatalog;
use crate::initiative::{Initiative, InitiativeId};
use crate::role::{Identity, RoleCode};
use crate::state_store::StateStore;
use crate::{Result, TollgateError};

/// Lookup key of a role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignmentKey {
    /// Owning site.
    pub site: String,
    /// Stage number.
    pub stage_number: u32,
    /// Initiative scope; `None` for the site-wide roster.
    pub initiative: Option<InitiativeId>,
}

impl AssignmentKey {
    /// Key of a site-wide roster entry.
    pub fn site_wide(site: impl Into<String>, stage_number: u32) -> Self {
        Self {
            site: site.into(),
            stage_number,
            initiative: None,
        }
    }

    /// Key of an entry scoped to one initiative.
    pub fn scoped(initiative: &Initiative, stage_number: u32) -> Self {
        Self {
            site: initiative.site.clone(),
            stage_number,
            initiative: Some(initiative.id),
        }
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.initiative {
            Some(id) => write!(f, "{}/stage-{}/{}", self.site, self.stage_number, id),
            None => write!(f, "{}/stage-{}", self.site, self.stage_number),
        }
    }
}

/// A stage's responsible identity at a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Where the assignment applies.
    pub key: AssignmentKey,
    /// Role held for the stage.
    pub role: RoleCode,
    /// Identity holding it.
    pub identity: Identity,
    /// When the assignment was written.
    pub assigned_at: DateTime<Utc>,
}

impl RoleAssignment {
    /// Creates an assignment stamped now.
    pub fn new(key: AssignmentKey, role: RoleCode, identity: Identity) -> Self {
        Self {
            key,
            role,
            identity,
            assigned_at: Utc::now(),
        }
    }
}

/// What `assign` does when the key is already taken by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssignMode {
    /// Fail with `DuplicateAssignment`.
    #[default]
    KeepExisting,
    /// Replace the holder. Reassignment is always explicit.
    Overwrite,
}

/// Result of an `assign` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// A new entry was written.
    Created,
    /// The same identity already held the entry; nothing was written.
    Unchanged,
    /// The entry was handed over from `previous`.
    Replaced {
        /// Former holder.
        previous: Identity,
    },
}

/// Per-site mapping from stage to responsible identity, backed by a [`StateStore`].
pub struct RoleAssignmentDirectory<'a, S: StateStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: StateStore + ?Sized> RoleAssignmentDirectory<'a, S> {
    /// Opens the directory over a store.
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    /// Resolves the site-wide roster entry for a stage.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Unassigned`] if nobody holds the stage.
    pub async fn resolve(&self, site: &str, stage_number: u32) -> Result<RoleAssignment> {
        let key = AssignmentKey::site_wide(site, stage_number);
        self.store
            .get_assignment(&key)
            .await?
            .ok_or_else(|| TollgateError::Unassigned {
                site: site.to_string(),
                stage: stage_number,
            })
    }

    /// Resolves the holder of a stage for one initiative, preferring an
    /// initiative-scoped entry over the site-wide one.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::Unassigned`] if neither exists.
    pub async fn resolve_for(
        &self,
        initiative: &Initiative,
        stage_number: u32,
    ) -> Result<RoleAssignment> {
        lookup(&*self.store, initiative, stage_number).await
    }

    /// Idempotent upsert of an assignment.
    ///
    /// Writing the identity that already holds the key is a no-op. A
    /// different identity is only written with [`AssignMode::Overwrite`].
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::DuplicateAssignment`] when the key is held by
    /// another identity and `mode` is [`AssignMode::KeepExisting`].
    pub async fn assign(
        &mut self,
        key: AssignmentKey,
        role: RoleCode,
        identity: Identity,
        mode: AssignMode,
    ) -> Result<AssignOutcome> {
        let existing = self.store.get_assignment(&key).await?;
        let outcome = check_existing(existing, &key, &role, &identity, mode)?;
        if outcome != AssignOutcome::Unchanged {
            info!(key = %key, role = %role, identity = %identity, "role assigned");
            self.store
                .save_assignment(&RoleAssignment::new(key, role, identity))
                .await?;
        }
        Ok(outcome)
    }

    /// Computes the assignments that bind `lead` to every Initiative-Lead
    /// stage of `initiative`, without writing them.
    ///
    /// Stages already held by `lead` are left out, so planning a retry of the
    /// same stage-3 completion yields nothing to write.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::DuplicateAssignment`] if a stage is held by
    /// another identity and `mode` is [`AssignMode::KeepExisting`].
    pub async fn plan_initiative_lead(
        &self,
        catalog: &StageCatalog,
        initiative: &Initiative,
        lead: &Identity,
        mode: AssignMode,
    ) -> Result<Vec<RoleAssignment>> {
        let mut planned = Vec::new();
        for definition in catalog.dynamic_stages() {
            let key = AssignmentKey::scoped(initiative, definition.number);
            let existing = self.store.get_assignment(&key).await?;
            let outcome = check_existing(existing, &key, &definition.required_role, lead, mode)?;
            if outcome != AssignOutcome::Unchanged {
                planned.push(RoleAssignment::new(
                    key,
                    definition.required_role,
                    lead.clone(),
                ));
            }
        }
        Ok(planned)
    }

    /// Lists every assignment of a site.
    pub async fn assignments(&self, site: &str) -> Result<Vec<RoleAssignment>> {
        self.store.list_assignments(site).await
    }
}

/// Scoped-then-site-wide lookup over a shared store reference.
pub(crate) async fn lookup<S: StateStore + ?Sized>(
    store: &S,
    initiative: &Initiative,
    stage_number: u32,
) -> Result<RoleAssignment> {
    let scoped = AssignmentKey::scoped(initiative, stage_number);
    if let Some(assignment) = store.get_assignment(&scoped).await? {
        debug!(key = %scoped, identity = %assignment.identity, "resolved scoped assignment");
        return Ok(assignment);
    }
    let site_wide = AssignmentKey::site_wide(&initiative.site, stage_number);
    store
        .get_assignment(&site_wide)
        .await?
        .ok_or_else(|| TollgateError::Unassigned {
            site: initiative.site.clone(),
            stage: stage_number,
        })
}

fn check_existing(
    existing: Option<RoleAssignment>,
    key: &AssignmentKey,
    role: &RoleCode,
    identity: &Identity,
    mode: AssignMode,
) -> Result<AssignOutcome> {
    match existing {
        None => Ok(AssignOutcome::Created),
        Some(current) if current.identity == *identity && current.role == *role => {
            Ok(AssignOutcome::Unchanged)
        }
        Some(current) => match mode {
            AssignMode::Overwrite => Ok(AssignOutcome::Replaced {
                previous: current.identity,
            }),
            AssignMode::KeepExisting => Err(TollgateError::DuplicateAssignment {
                site: key.site.clone(),
                stage: key.stage_number,
                existing: current.identity,
                requested: identity.clone(),
            }),
        },
    }
}
