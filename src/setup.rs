//! One-time seeding of the static role roster.
//!
//! Seeding runs before the engine is reachable. It writes site-wide
//! assignments for the fixed stages only; the Initiative-Lead stages are
//! bound per initiative by the engine at stage 3.

use std::collections::HashSet;
use tracing::info;

use crate::catalog::{StageCatalog, StageSlot};
use crate::config::SeedConfig;
use crate::directory::{AssignMode, AssignOutcome, AssignmentKey, RoleAssignmentDirectory};
use crate::state_store::StateStore;
use crate::{Result, TollgateError};

/// What a seeding run wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    /// Assignments written for the first time.
    pub created: usize,
    /// Assignments already present with the same holder.
    pub unchanged: usize,
}

/// Checks a roster against the catalog without writing anything.
///
/// # Errors
///
/// Returns [`TollgateError::InvalidSeed`] if an entry names an unknown
/// stage, targets an Initiative-Lead stage, disagrees with the catalog on
/// the role, or repeats a (site, stage) pair.
pub fn validate_seed(catalog: &StageCatalog, seed: &SeedConfig) -> Result<()> {
    let mut seen = HashSet::new();
    for roster in &seed.sites {
        if roster.site.trim().is_empty() {
            return Err(TollgateError::InvalidSeed("empty site code".to_string()));
        }
        for entry in &roster.assignments {
            let slot = catalog.slot(entry.stage).map_err(|_| {
                TollgateError::InvalidSeed(format!(
                    "site {}: stage {} is not in the catalog",
                    roster.site, entry.stage
                ))
            })?;
            if !matches!(slot, StageSlot::Fixed(_)) {
                return Err(TollgateError::InvalidSeed(format!(
                    "site {}: stage {} is bound per initiative and cannot be seeded",
                    roster.site, entry.stage
                )));
            }
            let required = slot.definition().required_role;
            if entry.role != required {
                return Err(TollgateError::InvalidSeed(format!(
                    "site {}: stage {} requires {}, seed names {}",
                    roster.site, entry.stage, required, entry.role
                )));
            }
            if !seen.insert((roster.site.as_str(), entry.stage)) {
                return Err(TollgateError::InvalidSeed(format!(
                    "site {}: stage {} listed twice",
                    roster.site, entry.stage
                )));
            }
        }
    }
    Ok(())
}

/// Writes the roster into the directory.
///
/// Running the same seed twice writes nothing the second time.
///
/// # Errors
///
/// Fails validation as [`validate_seed`] does, and with
/// [`TollgateError::DuplicateAssignment`] if a stage is already held by a
/// different identity.
pub async fn seed_directory<S: StateStore + ?Sized>(
    store: &mut S,
    catalog: &StageCatalog,
    seed: &SeedConfig,
) -> Result<SeedSummary> {
    validate_seed(catalog, seed)?;

    let mut directory = RoleAssignmentDirectory::new(store);
    let mut summary = SeedSummary::default();
    for roster in &seed.sites {
        for entry in &roster.assignments {
            let key = AssignmentKey::site_wide(roster.site.clone(), entry.stage);
            match directory
                .assign(key, entry.role, entry.identity.clone(), AssignMode::KeepExisting)
                .await?
            {
                AssignOutcome::Unchanged => summary.unchanged += 1,
                _ => summary.created += 1,
            }
        }
        info!(site = %roster.site, entries = roster.assignments.len(), "site roster seeded");
    }
    Ok(summary)
}
