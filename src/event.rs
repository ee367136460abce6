//! Workflow events.
//!
//! This module provides [`WorkflowEvent`] for observing initiatives as they
//! move through the approval stages and their sub-workflows. Events are
//! broadcast through a channel that can be subscribed to for notifications,
//! audit trails, or dashboards.

use crate::role::RoleCode;

/// An event emitted by the engine or one of its sub-workflows.
///
/// Events use `String` for identifiers to keep the event type simple
/// and easy to serialize for logging or transmission.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum WorkflowEvent {
    /// A new initiative was registered at stage 1.
    InitiativeRegistered {
        /// The initiative's identifier.
        initiative_id: String,
        /// Owning site.
        site: String,
        /// The initiator.
        created_by: String,
    },

    /// A stage was approved.
    StageApproved {
        /// The initiative's identifier.
        initiative_id: String,
        /// The approved stage.
        stage: u32,
        /// Who approved it.
        actor: String,
    },

    /// A conditional stage was bypassed.
    StageBypassed {
        /// The initiative's identifier.
        initiative_id: String,
        /// The bypassed stage.
        stage: u32,
    },

    /// The initiative was rejected at a stage.
    StageRejected {
        /// The initiative's identifier.
        initiative_id: String,
        /// The rejecting stage.
        stage: u32,
        /// Who rejected it.
        actor: String,
        /// Stated reason.
        reason: String,
    },

    /// The Initiative Lead was bound (or rebound) to the dynamic stages.
    InitiativeLeadBound {
        /// The initiative's identifier.
        initiative_id: String,
        /// The lead's identity.
        lead: String,
    },

    /// Closure was approved.
    InitiativeCompleted {
        /// The initiative's identifier.
        initiative_id: String,
    },

    /// A monitoring entry was finalized.
    MonitoringEntryFinalized {
        /// The initiative's identifier.
        initiative_id: String,
        /// The entry's identifier.
        entry_id: String,
    },

    /// Finance reviewed a monitoring entry.
    FinanceReviewed {
        /// The initiative's identifier.
        initiative_id: String,
        /// The entry's identifier.
        entry_id: String,
        /// Whether finance approved it.
        approved: bool,
    },

    /// A timeline milestone received an approval.
    MilestoneApproved {
        /// The initiative's identifier.
        initiative_id: String,
        /// The milestone's identifier.
        milestone_id: String,
        /// Which approver signed.
        role: RoleCode,
        /// Whether both approvals are now present.
        complete: bool,
    },
}

impl WorkflowEvent {
    /// Returns the initiative ID for this event.
    pub fn initiative_id(&self) -> &str {
        match self {
            Self::InitiativeRegistered { initiative_id, .. }
            | Self::StageApproved { initiative_id, .. }
            | Self::StageBypassed { initiative_id, .. }
            | Self::StageRejected { initiative_id, .. }
            | Self::InitiativeLeadBound { initiative_id, .. }
            | Self::InitiativeCompleted { initiative_id }
            | Self::MonitoringEntryFinalized { initiative_id, .. }
            | Self::FinanceReviewed { initiative_id, .. }
            | Self::MilestoneApproved { initiative_id, .. } => initiative_id,
        }
    }

    /// Returns the stage number for this event, if applicable.
    pub fn stage(&self) -> Option<u32> {
        match self {
            Self::StageApproved { stage, .. }
            | Self::StageBypassed { stage, .. }
            | Self::StageRejected { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Returns true if this event halted the initiative.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::StageRejected { .. })
    }

    /// Returns true if this is a completion event.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::InitiativeCompleted { .. } | Self::MilestoneApproved { complete: true, .. }
        )
    }
}
