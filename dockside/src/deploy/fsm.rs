//! Finite state machine of one build attempt

use serde::{Deserialize, Serialize};

use crate::models::deployment::DeploymentStatus;

/// Step of a build attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStep {
    /// Reaching the container engine
    Connect,

    /// Checking out the sources
    Clone,

    /// Building the image
    Build,

    /// Running the containers
    Run,

    Succeeded,
    Failed,
}

impl BuildStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStep::Connect => "connect",
            BuildStep::Clone => "clone",
            BuildStep::Build => "build",
            BuildStep::Run => "run",
            BuildStep::Succeeded => "succeeded",
            BuildStep::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStep::Succeeded | BuildStep::Failed)
    }
}

/// Build event
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// Current step completed
    StepDone,

    /// Current step failed
    Fail(String),
}

/// Build attempt FSM
#[derive(Debug, Clone)]
pub struct BuildFsm {
    step: BuildStep,
    error: Option<String>,
}

impl BuildFsm {
    /// Create a new FSM at the first step
    pub fn new() -> Self {
        Self {
            step: BuildStep::Connect,
            error: None,
        }
    }

    /// Get current step
    pub fn step(&self) -> BuildStep {
        self.step
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Deployment status seen from outside
    pub fn status(&self) -> DeploymentStatus {
        match self.step {
            BuildStep::Succeeded => DeploymentStatus::Succeeded,
            BuildStep::Failed => DeploymentStatus::Failed,
            _ => DeploymentStatus::Running,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: BuildEvent) -> Result<BuildStep, String> {
        let next = match (self.step, &event) {
            (BuildStep::Connect, BuildEvent::StepDone) => BuildStep::Clone,
            (BuildStep::Clone, BuildEvent::StepDone) => BuildStep::Build,
            (BuildStep::Build, BuildEvent::StepDone) => BuildStep::Run,
            (BuildStep::Run, BuildEvent::StepDone) => BuildStep::Succeeded,
            (step, BuildEvent::Fail(err)) if !step.is_terminal() => {
                self.error = Some(err.clone());
                BuildStep::Failed
            }

            // Invalid transitions
            (step, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", step, event));
            }
        };

        self.step = next;
        Ok(next)
    }
}

impl Default for BuildFsm {
    fn default() -> Self {
        Self::new()
    }
}
