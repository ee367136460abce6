//! Initiative progress reporting.
//!
//! This module provides [`InitiativeProgress`] for inspecting where an
//! initiative stands across every stage of the catalog, and the
//! progress-percentage rule the engine applies on every transition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::catalog::{ConditionalPath, Resolution, StageCatalog};
use crate::initiative::{Initiative, InitiativeId, InitiativeStatus};
use crate::role::{Identity, RoleCode};
use crate::stage::{StageState, StageStatus};

/// Returns `floor(100 * approved / applicable)`, clamped to 100.
///
/// An empty path counts as fully done.
pub fn progress_percentage(approved: usize, applicable: usize) -> u8 {
    if applicable == 0 {
        return 100;
    }
    let percent = (approved.min(applicable) * 100) / applicable;
    percent as u8
}

/// Computes the progress percentage of stage records against a path.
///
/// Only applicable stages count; bypassed stages are neither in the
/// numerator nor the denominator.
pub(crate) fn percentage_for(
    catalog: &StageCatalog,
    path: Option<ConditionalPath>,
    states: &BTreeMap<u32, StageState>,
) -> u8 {
    let applicable: Vec<u32> = catalog
        .resolve_path(path)
        .into_iter()
        .filter(|step| step.resolution == Resolution::Applicable)
        .map(|step| step.number)
        .collect();
    let approved = applicable
        .iter()
        .filter(|n| matches!(states.get(n), Some(s) if s.status == StageStatus::Approved))
        .count();
    progress_percentage(approved, applicable.len())
}

/// Progress entry for a single stage of an initiative.
#[derive(Debug, Clone)]
pub struct StageProgressEntry {
    /// Stage number.
    pub number: u32,
    /// Stage name from the catalog.
    pub name: String,
    /// Role the stage requires.
    pub required_role: RoleCode,
    /// Whether the stage applies on the initiative's path.
    pub resolution: Resolution,
    /// Recorded status; `Pending` if never reached.
    pub status: StageStatus,
    /// When the stage became current.
    pub started_at: Option<DateTime<Utc>>,
    /// When it was decided.
    pub completed_at: Option<DateTime<Utc>>,
    /// Who decided it.
    pub actor: Option<Identity>,
    /// Comments or rejection reason.
    pub comments: Option<String>,
}

impl StageProgressEntry {
    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.status {
            StageStatus::Pending => '⏳',
            StageStatus::Approved => '✅',
            StageStatus::Bypassed => '⏭',
            StageStatus::Rejected => '❌',
        }
    }
}

/// Snapshot of an initiative's progression across the whole catalog.
#[derive(Debug, Clone)]
pub struct InitiativeProgress {
    /// The initiative's identifier.
    pub initiative_id: InitiativeId,
    /// Its title.
    pub title: String,
    /// Overall status.
    pub status: InitiativeStatus,
    /// Stage awaiting action.
    pub current_stage: u32,
    /// One entry per catalog stage, in stage order.
    pub stages: Vec<StageProgressEntry>,
}

impl InitiativeProgress {
    /// Builds a snapshot from the initiative and its stored stage records.
    pub fn build(
        catalog: &StageCatalog,
        initiative: &Initiative,
        states: &BTreeMap<u32, StageState>,
    ) -> Self {
        let stages = catalog
            .resolve_path(initiative.path)
            .into_iter()
            .filter_map(|step| {
                let definition = catalog.stage_by_number(step.number).ok()?;
                let state = states.get(&step.number);
                Some(StageProgressEntry {
                    number: step.number,
                    name: definition.name.clone(),
                    required_role: definition.required_role,
                    resolution: step.resolution,
                    status: state.map_or(StageStatus::Pending, |s| s.status),
                    started_at: state.and_then(|s| s.started_at),
                    completed_at: state.and_then(|s| s.completed_at),
                    actor: state.and_then(|s| s.actor.clone()),
                    comments: state.and_then(|s| s.comments.clone()),
                })
            })
            .collect();

        Self {
            initiative_id: initiative.id,
            title: initiative.title.clone(),
            status: initiative.status,
            current_stage: initiative.current_stage,
            stages,
        }
    }

    /// Returns true if the initiative completed its final stage.
    pub fn is_complete(&self) -> bool {
        self.status == InitiativeStatus::Completed
    }

    /// Returns the stage the initiative was rejected at, if any.
    pub fn rejected_stage(&self) -> Option<u32> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Rejected)
            .map(|s| s.number)
    }

    /// Returns the numbers of the stages that were bypassed.
    pub fn bypassed_stages(&self) -> Vec<u32> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Bypassed)
            .map(|s| s.number)
            .collect()
    }

    /// Returns the numbers of the stages that were approved.
    pub fn approved_stages(&self) -> Vec<u32> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Approved)
            .map(|s| s.number)
            .collect()
    }

    /// Returns the number of stages that apply on the initiative's path.
    pub fn applicable_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.resolution == Resolution::Applicable)
            .count()
    }

    /// Returns the overall progress as a percentage.
    pub fn progress_percent(&self) -> u8 {
        let approved = self
            .stages
            .iter()
            .filter(|s| s.resolution == Resolution::Applicable && s.status == StageStatus::Approved)
            .count();
        progress_percentage(approved, self.applicable_count())
    }
}

impl fmt::Display for InitiativeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Initiative \"{}\" ({}):",
            self.title, self.initiative_id
        )?;
        writeln!(f)?;

        for stage in &self.stages {
            let marker = if stage.number == self.current_stage && !self.status.is_terminal() {
                '>'
            } else {
                ' '
            };
            let time_str = stage
                .completed_at
                .or(stage.started_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "{} {} {:>2} {:<42} {:<5} {:<9} {}",
                marker,
                stage.status_char(),
                stage.number,
                stage.name,
                stage.required_role,
                stage.status,
                time_str
            )?;

            if let Some(ref actor) = stage.actor {
                write!(f, "  by {}", actor)?;
            }
            if stage.status == StageStatus::Rejected {
                if let Some(ref reason) = stage.comments {
                    write!(f, "  Reason: {}", reason)?;
                }
            }

            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Progress: {}%", self.progress_percent())?;
        writeln!(f, "Status: {}", self.status)?;

        Ok(())
    }
}
