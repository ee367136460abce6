//! The stage catalog: what stage N means.
//!
//! The catalog is the single source of truth for stage numbers, names and the
//! role each stage requires. It is seeded once and never mutated. Each entry
//! is a [`StageSlot`] that also says *how* the stage takes part in a run:
//!
//! - [`StageSlot::Fixed`] stages always apply and resolve their approver
//!   from the static site roster.
//! - [`StageSlot::Conditional`] stages apply only when the stage-3 decision
//!   sets their [`GatingFlag`]; otherwise they are bypassed.
//! - [`StageSlot::DynamicallyBound`] stages always apply, but their approver
//!   is the Initiative Lead chosen at stage 3.
//!
//! Bypass and insertion are a pure function of the catalog and the
//! [`ConditionalPath`] chosen at stage 3; see [`StageCatalog::resolve_path`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::role::RoleCode;
use crate::{Result, TollgateError};

/// Register Initiative.
pub const STAGE_REGISTER: u32 = 1;
/// Site Head approval.
pub const STAGE_SITE_HEAD_APPROVAL: u32 = 2;
/// Engineering Head approval; defines responsibilities and the conditional path.
pub const STAGE_DEFINE_RESPONSIBILITIES: u32 = 3;
/// Engineering change (MOC) review.
pub const STAGE_ENGINEERING_CHANGE: u32 = 4;
/// Capital (CAPEX) approval.
pub const STAGE_CAPITAL_APPROVAL: u32 = 5;
/// Initiative timeline tracker.
pub const STAGE_TIMELINE_TRACKER: u32 = 6;
/// Trial implementation and performance check.
pub const STAGE_TRIAL_IMPLEMENTATION: u32 = 7;
/// Periodic status review.
pub const STAGE_PERIODIC_REVIEW: u32 = 8;
/// Savings monitoring.
pub const STAGE_SAVINGS_MONITORING: u32 = 9;
/// Savings validation with finance.
pub const STAGE_SAVINGS_VALIDATION: u32 = 10;
/// Initiative closure.
pub const STAGE_CLOSURE: u32 = 11;

/// An immutable stage definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Position of the stage in the sequence, unique within the catalog.
    pub number: u32,
    /// Display name.
    pub name: String,
    /// Role whose holder decides this stage.
    pub required_role: RoleCode,
}

impl StageDefinition {
    /// Creates a stage definition.
    pub fn new(number: u32, name: impl Into<String>, required_role: RoleCode) -> Self {
        Self {
            number,
            name: name.into(),
            required_role,
        }
    }
}

/// The decision flag that switches a conditional stage on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatingFlag {
    /// The initiative requires an engineering-change (MOC) review.
    EngineeringChange,
    /// The initiative requires capital (CAPEX) approval.
    CapitalApproval,
}

/// The conditional path chosen by the stage-3 approver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalPath {
    /// Whether stage 4 applies.
    pub requires_engineering_change: bool,
    /// Whether stage 5 applies.
    pub requires_capital_approval: bool,
}

impl ConditionalPath {
    /// Creates a path from the two flags.
    pub fn new(requires_engineering_change: bool, requires_capital_approval: bool) -> Self {
        Self {
            requires_engineering_change,
            requires_capital_approval,
        }
    }

    /// Returns true if the flag is set on this path.
    pub fn allows(&self, flag: GatingFlag) -> bool {
        match flag {
            GatingFlag::EngineeringChange => self.requires_engineering_change,
            GatingFlag::CapitalApproval => self.requires_capital_approval,
        }
    }
}

/// How a stage takes part in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSlot {
    /// Always applies; approver from the static roster.
    Fixed(StageDefinition),
    /// Applies only when the gating flag is set; approver is the Initiative Lead.
    Conditional(StageDefinition, GatingFlag),
    /// Always applies; approver is the Initiative Lead.
    DynamicallyBound(StageDefinition),
}

impl StageSlot {
    /// Returns the underlying definition.
    pub fn definition(&self) -> &StageDefinition {
        match self {
            StageSlot::Fixed(def) | StageSlot::Conditional(def, _) | StageSlot::DynamicallyBound(def) => {
                def
            }
        }
    }

    /// Returns the stage number.
    pub fn number(&self) -> u32 {
        self.definition().number
    }

    /// Returns the gating flag for conditional stages.
    pub fn gate(&self) -> Option<GatingFlag> {
        match self {
            StageSlot::Conditional(_, flag) => Some(*flag),
            _ => None,
        }
    }

    /// Returns true if the approver is bound at runtime by the stage-3 decision.
    pub fn binds_initiative_lead(&self) -> bool {
        matches!(self, StageSlot::Conditional(..) | StageSlot::DynamicallyBound(_))
    }
}

/// Whether a stage applies on a given path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The stage must be decided.
    Applicable,
    /// The stage is skipped because its gating flag is false.
    Bypassed,
}

/// One step of a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// Stage number.
    pub number: u32,
    /// Whether it applies.
    pub resolution: Resolution,
}

/// Where the engine goes after a stage is approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStage {
    /// The next applicable stage, or `None` after the last one.
    pub next: Option<u32>,
    /// Conditional stages skipped on the way, in order.
    pub bypassed: Vec<u32>,
}

/// The immutable master list of stages.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    slots: Vec<StageSlot>,
}

impl StageCatalog {
    /// Returns the canonical 11-stage catalog.
    pub fn standard() -> Self {
        use RoleCode::*;

        let fixed = |n, name: &str, role| StageSlot::Fixed(StageDefinition::new(n, name, role));
        Self {
            slots: vec![
                fixed(STAGE_REGISTER, "Register Initiative", SiteTsdLead),
                fixed(STAGE_SITE_HEAD_APPROVAL, "Site Head Approval", SiteHead),
                fixed(STAGE_DEFINE_RESPONSIBILITIES, "Engineering Head Approval", EngineeringHead),
                StageSlot::Conditional(
                    StageDefinition::new(STAGE_ENGINEERING_CHANGE, "MOC Stage", InitiativeLead),
                    GatingFlag::EngineeringChange,
                ),
                StageSlot::Conditional(
                    StageDefinition::new(STAGE_CAPITAL_APPROVAL, "CAPEX Stage", InitiativeLead),
                    GatingFlag::CapitalApproval,
                ),
                StageSlot::DynamicallyBound(StageDefinition::new(
                    STAGE_TIMELINE_TRACKER,
                    "Initiative Timeline Tracker",
                    InitiativeLead,
                )),
                fixed(
                    STAGE_TRIAL_IMPLEMENTATION,
                    "Trial Implementation & Performance Check",
                    SiteTsdLead,
                ),
                fixed(STAGE_PERIODIC_REVIEW, "Periodic Status Review with CMO", CorporateTsd),
                fixed(STAGE_SAVINGS_MONITORING, "Savings Monitoring (1 Month)", SiteTsdLead),
                fixed(STAGE_SAVINGS_VALIDATION, "Saving Validation with F&A", SiteTsdLead),
                fixed(STAGE_CLOSURE, "Initiative Closure", SiteTsdLead),
            ],
        }
    }

    /// Builds a catalog from explicit slots.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::InvalidCatalog`] if the slots are empty, do
    /// not number contiguously from 1, repeat a number, or bind a
    /// conditional/dynamic stage to a role other than Initiative Lead.
    pub fn new(mut slots: Vec<StageSlot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(TollgateError::InvalidCatalog("no stages".to_string()));
        }

        let mut seen = HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.number()) {
                return Err(TollgateError::InvalidCatalog(format!(
                    "duplicate stage number {}",
                    slot.number()
                )));
            }
            if slot.binds_initiative_lead()
                && slot.definition().required_role != RoleCode::InitiativeLead
            {
                return Err(TollgateError::InvalidCatalog(format!(
                    "stage {} is bound at runtime but requires {}",
                    slot.number(),
                    slot.definition().required_role
                )));
            }
        }

        slots.sort_by_key(StageSlot::number);
        for (idx, slot) in slots.iter().enumerate() {
            if slot.number() != idx as u32 + 1 {
                return Err(TollgateError::InvalidCatalog(format!(
                    "stage numbers must be contiguous from 1, found {} at position {}",
                    slot.number(),
                    idx + 1
                )));
            }
        }

        Ok(Self { slots })
    }

    /// Looks up a stage definition by number.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::UnknownStage`] if the number is not present.
    pub fn stage_by_number(&self, number: u32) -> Result<&StageDefinition> {
        self.slot(number).map(StageSlot::definition)
    }

    /// Looks up a slot by stage number.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::UnknownStage`] if the number is not present.
    pub fn slot(&self, number: u32) -> Result<&StageSlot> {
        self.slots
            .iter()
            .find(|slot| slot.number() == number)
            .ok_or(TollgateError::UnknownStage(number))
    }

    /// Returns the role required by a stage.
    pub fn required_role(&self, number: u32) -> Result<RoleCode> {
        Ok(self.stage_by_number(number)?.required_role)
    }

    /// Returns true if the stage number is in the catalog.
    pub fn contains(&self, number: u32) -> bool {
        self.slot(number).is_ok()
    }

    /// Returns all slots in stage order.
    pub fn slots(&self) -> &[StageSlot] {
        &self.slots
    }

    /// Returns the number of stages.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the catalog has no stages (never the case once built).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the number of the first stage.
    pub fn first_stage(&self) -> u32 {
        self.slots.first().map(StageSlot::number).unwrap_or(STAGE_REGISTER)
    }

    /// Returns the number of the final stage.
    pub fn last_stage(&self) -> u32 {
        self.slots.last().map(StageSlot::number).unwrap_or(STAGE_CLOSURE)
    }

    /// Returns the stages whose approver is the stage-3 Initiative Lead.
    pub fn dynamic_stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.slots
            .iter()
            .filter(|slot| slot.binds_initiative_lead())
            .map(StageSlot::definition)
    }

    /// Resolves every stage against a conditional path.
    ///
    /// With `None` (path not yet decided) every stage is applicable.
    pub fn resolve_path(&self, path: Option<ConditionalPath>) -> Vec<PathStep> {
        self.slots
            .iter()
            .map(|slot| {
                let bypassed = match (slot.gate(), path) {
                    (Some(flag), Some(path)) => !path.allows(flag),
                    _ => false,
                };
                PathStep {
                    number: slot.number(),
                    resolution: if bypassed {
                        Resolution::Bypassed
                    } else {
                        Resolution::Applicable
                    },
                }
            })
            .collect()
    }

    /// Returns how many stages apply on the path.
    pub fn applicable_count(&self, path: Option<ConditionalPath>) -> usize {
        self.resolve_path(path)
            .iter()
            .filter(|step| step.resolution == Resolution::Applicable)
            .count()
    }

    /// Computes the stage that follows `after` on the given path.
    ///
    /// # Errors
    ///
    /// Returns [`TollgateError::UnknownStage`] if `after` is not in the catalog.
    pub fn next_stage(&self, after: u32, path: Option<ConditionalPath>) -> Result<NextStage> {
        self.slot(after)?;

        let mut bypassed = Vec::new();
        for step in self.resolve_path(path).into_iter().filter(|s| s.number > after) {
            match step.resolution {
                Resolution::Applicable => {
                    return Ok(NextStage {
                        next: Some(step.number),
                        bypassed,
                    })
                }
                Resolution::Bypassed => bypassed.push(step.number),
            }
        }

        Ok(NextStage {
            next: None,
            bypassed,
        })
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
