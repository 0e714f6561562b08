//! Formal finite state machine for the ClusterServiceVersion lifecycle
//!
//! Every phase change goes through an explicit transition table with guards. The
//! reconciler gathers observations into a [`TransitionContext`], [`determine_event`]
//! turns them into at most one [`CsvEvent`], and the table decides the target phase
//! and the reason written to status.

use std::fmt;

use crate::crd::{CsvPhase, CsvReason, PhaseSet};

/// Events that trigger state transitions in the CSV lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsvEvent {
    /// At least one requirement is `NotPresent`
    RequirementsNotMet,
    /// Every requirement is `Present`
    RequirementsMet,
    /// Another live CSV owns something this one declares as owned
    OwnerConflict,
    /// The install strategy and API service resources were applied
    StrategyApplied,
    /// Applying the install strategy failed
    InstallFailed,
    /// Every Deployment rolled out and every owned APIService is available
    ComponentsReady,
    /// Components exist but are still rolling out
    ComponentsPending,
    /// A previously healthy component became unavailable
    ComponentUnhealthy,
    /// A component is missing or does not match the strategy
    NeedsReinstall,
    /// Serving certificates are due for rotation
    CertRotationDue,
    /// A CSV in the namespace replaces this one
    SuccessorFound,
    /// The successor went away before the upgrade completed
    SuccessorGone,
    /// The head of the replacement chain reached `Succeeded`
    ChainHeadSucceeded,
}

impl fmt::Display for CsvEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Health of the managed components, judged after the strategy was applied
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComponentHealth {
    /// Not checked in this pass
    #[default]
    Unknown,
    Ready,
    /// A rollout is in progress
    RollingOut(String),
    /// Below minimum availability
    Unavailable(String),
    /// A Deployment or APIService does not exist
    Missing(String),
    /// A component does not carry the expected template or CA hash
    Stale(String),
    /// The rollout cannot complete without intervention
    Failed(String),
}

impl ComponentHealth {
    pub fn message(&self) -> Option<&str> {
        match self {
            ComponentHealth::Unknown | ComponentHealth::Ready => None,
            ComponentHealth::RollingOut(m)
            | ComponentHealth::Unavailable(m)
            | ComponentHealth::Missing(m)
            | ComponentHealth::Stale(m)
            | ComponentHealth::Failed(m) => Some(m),
        }
    }
}

/// Observations available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Every requirement is `Present`
    pub requirements_met: bool,
    /// Summary of unmet requirements
    pub requirements_message: String,
    /// Description of an ownership conflict, if any
    pub owner_conflict: Option<String>,
    /// Error from applying the install strategy
    pub install_error: Option<String>,
    pub components: ComponentHealth,
    pub cert_rotation_due: bool,
    pub has_successor: bool,
    pub chain_head_succeeded: bool,
}

impl TransitionContext {
    /// Human-readable detail for the chosen event
    pub fn message_for(&self, event: CsvEvent) -> String {
        match event {
            CsvEvent::RequirementsNotMet => self.requirements_message.clone(),
            CsvEvent::RequirementsMet => "all requirements found, attempting install".to_string(),
            CsvEvent::OwnerConflict => self
                .owner_conflict
                .clone()
                .unwrap_or_else(|| "owner conflict".to_string()),
            CsvEvent::StrategyApplied => {
                "waiting for install components to report healthy".to_string()
            }
            CsvEvent::InstallFailed => self
                .install_error
                .clone()
                .or_else(|| self.components.message().map(str::to_string))
                .unwrap_or_else(|| "install strategy failed".to_string()),
            CsvEvent::ComponentsReady => "install strategy completed with no errors".to_string(),
            CsvEvent::ComponentsPending
            | CsvEvent::ComponentUnhealthy
            | CsvEvent::NeedsReinstall => self
                .components
                .message()
                .unwrap_or("waiting for install components")
                .to_string(),
            CsvEvent::CertRotationDue => "serving certificates are due for rotation".to_string(),
            CsvEvent::SuccessorFound => "being replaced by a newer version".to_string(),
            CsvEvent::SuccessorGone => "replacement was removed, reinstalling".to_string(),
            CsvEvent::ChainHeadSucceeded => "replacement installed successfully".to_string(),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: CsvPhase,
    pub to: CsvPhase,
    pub event: CsvEvent,
    /// Reason written to status when the transition is taken
    pub reason: CsvReason,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: CsvPhase,
        to: CsvPhase,
        event: CsvEvent,
        reason: CsvReason,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            reason,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: CsvPhase,
        to: CsvPhase,
        event: CsvEvent,
        reason: CsvReason,
        description: &'static str,
    },
    InvalidTransition {
        current: CsvPhase,
        event: CsvEvent,
    },
    GuardFailed {
        from: CsvPhase,
        to: CsvPhase,
        event: CsvEvent,
        reason: String,
    },
}

/// Formal state machine for the CSV lifecycle
pub struct CsvStateMachine {
    transitions: Vec<Transition>,
}

impl Default for CsvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Phases that can be superseded or put into conflict
const ACTIVE: PhaseSet = PhaseSet::INSTALLING
    .with(CsvPhase::Succeeded)
    .with(CsvPhase::Failed);

impl CsvStateMachine {
    pub fn new() -> Self {
        use CsvEvent as E;
        use CsvPhase as P;
        use CsvReason as R;

        let mut transitions = vec![
            // === Pending ===
            Transition::new(
                P::Pending,
                P::Pending,
                E::RequirementsNotMet,
                R::RequirementsNotMet,
                "Waiting for requirements",
            ),
            Transition::new(
                P::Pending,
                P::InstallReady,
                E::RequirementsMet,
                R::AllRequirementsMet,
                "All requirements met",
            ),
            // === InstallReady ===
            Transition::new(
                P::InstallReady,
                P::Pending,
                E::RequirementsNotMet,
                R::RequirementsNotMet,
                "Requirements lost before install",
            ),
            Transition::new(
                P::InstallReady,
                P::Installing,
                E::StrategyApplied,
                R::InstallWaiting,
                "Install strategy applied",
            ),
            Transition::new(
                P::InstallReady,
                P::Failed,
                E::InstallFailed,
                R::InstallComponentFailed,
                "Install strategy could not be applied",
            ),
            // === Installing ===
            Transition::new(
                P::Installing,
                P::Pending,
                E::RequirementsNotMet,
                R::RequirementsNotMet,
                "Requirements lost during install",
            ),
            Transition::new(
                P::Installing,
                P::Installing,
                E::ComponentsPending,
                R::InstallWaiting,
                "Waiting for install components",
            ),
            Transition::new(
                P::Installing,
                P::Succeeded,
                E::ComponentsReady,
                R::InstallSucceeded,
                "Install completed",
            ),
            Transition::new(
                P::Installing,
                P::Failed,
                E::InstallFailed,
                R::InstallComponentFailed,
                "Install component failed",
            ),
            // === Succeeded ===
            Transition::new(
                P::Succeeded,
                P::Failed,
                E::RequirementsNotMet,
                R::RequirementsNotMet,
                "Requirements lost after install",
            ),
            Transition::new(
                P::Succeeded,
                P::Failed,
                E::ComponentUnhealthy,
                R::ComponentUnhealthy,
                "Installed component became unhealthy",
            ),
            Transition::new(
                P::Succeeded,
                P::InstallReady,
                E::NeedsReinstall,
                R::NeedsReinstall,
                "Installed components drifted from the strategy",
            ),
            Transition::new(
                P::Succeeded,
                P::InstallReady,
                E::CertRotationDue,
                R::NeedsCertRotation,
                "Serving certificates need rotation",
            ),
            // === Failed ===
            Transition::new(
                P::Failed,
                P::Failed,
                E::RequirementsNotMet,
                R::RequirementsNotMet,
                "Still missing requirements",
            ),
            Transition::new(
                P::Failed,
                P::Pending,
                E::RequirementsMet,
                R::RequirementsUnknown,
                "Retrying install",
            ),
            // === Replacing ===
            Transition::new(
                P::Replacing,
                P::Deleting,
                E::ChainHeadSucceeded,
                R::Replaced,
                "Replacement succeeded",
            ),
            Transition::new(
                P::Replacing,
                P::Pending,
                E::SuccessorGone,
                R::RequirementsUnknown,
                "Replacement removed",
            ),
            // === Deleting is terminal: the object is removed ===
        ];

        for phase in ACTIVE.iter() {
            transitions.push(Transition::new(
                phase,
                P::Replacing,
                E::SuccessorFound,
                R::BeingReplaced,
                "Superseded by a newer version",
            ));
        }
        for phase in ACTIVE.iter() {
            transitions.push(Transition::new(
                phase,
                P::Failed,
                E::OwnerConflict,
                R::OwnerConflict,
                "Owned resource belongs to another CSV",
            ));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: CsvPhase,
        event: CsvEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    reason: t.reason,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: CsvPhase, event: CsvEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: CsvPhase) -> Vec<CsvEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.to, transition.event) {
            (CsvPhase::InstallReady | CsvPhase::Pending, CsvEvent::RequirementsMet) => {
                if !ctx.requirements_met {
                    Some(ctx.requirements_message.clone())
                } else {
                    ctx.owner_conflict.clone()
                }
            }
            (CsvPhase::Succeeded, CsvEvent::ComponentsReady) => {
                if ctx.components != ComponentHealth::Ready {
                    Some(format!("components not ready: {:?}", ctx.components))
                } else if !ctx.requirements_met {
                    Some(ctx.requirements_message.clone())
                } else {
                    None
                }
            }
            (CsvPhase::Deleting, CsvEvent::ChainHeadSucceeded) => {
                if !ctx.chain_head_succeeded {
                    Some("replacement has not succeeded".to_string())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Determine the event for the current observations.
///
/// `None` means the CSV stays where it is and nothing about its phase needs writing.
pub fn determine_event(current: CsvPhase, ctx: &TransitionContext) -> Option<CsvEvent> {
    if current == CsvPhase::Deleting {
        return None;
    }

    if current == CsvPhase::Replacing {
        return if !ctx.has_successor {
            Some(CsvEvent::SuccessorGone)
        } else if ctx.chain_head_succeeded {
            Some(CsvEvent::ChainHeadSucceeded)
        } else {
            None
        };
    }

    if ctx.has_successor {
        return Some(CsvEvent::SuccessorFound);
    }

    if ctx.owner_conflict.is_some() {
        return Some(CsvEvent::OwnerConflict);
    }

    if !ctx.requirements_met {
        return Some(CsvEvent::RequirementsNotMet);
    }

    match current {
        CsvPhase::Pending | CsvPhase::Failed => Some(CsvEvent::RequirementsMet),
        CsvPhase::InstallReady => Some(if ctx.install_error.is_some() {
            CsvEvent::InstallFailed
        } else {
            CsvEvent::StrategyApplied
        }),
        CsvPhase::Installing => {
            if ctx.install_error.is_some() {
                return Some(CsvEvent::InstallFailed);
            }
            match ctx.components {
                ComponentHealth::Ready => Some(CsvEvent::ComponentsReady),
                ComponentHealth::Failed(_) => Some(CsvEvent::InstallFailed),
                _ => Some(CsvEvent::ComponentsPending),
            }
        }
        CsvPhase::Succeeded => {
            if ctx.cert_rotation_due {
                return Some(CsvEvent::CertRotationDue);
            }
            match ctx.components {
                ComponentHealth::Missing(_) | ComponentHealth::Stale(_) => {
                    Some(CsvEvent::NeedsReinstall)
                }
                ComponentHealth::Unavailable(_) | ComponentHealth::Failed(_) => {
                    Some(CsvEvent::ComponentUnhealthy)
                }
                // Deployment-level readiness only; a rollout in progress is not a regression
                ComponentHealth::Ready
                | ComponentHealth::RollingOut(_)
                | ComponentHealth::Unknown => None,
            }
        }
        CsvPhase::Replacing | CsvPhase::Deleting => None,
    }
}
