// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Registered, never started.
    Created,
    /// Child process is alive.
    Running,
    /// SHUTDOWN was sent, waiting for the child to exit.
    Stopping,
    /// Exited after being asked to stop.
    Stopped,
    /// Exited on its own; may be respawned.
    Exited,
    /// Respawn gave up, or supervision of the child was lost.
    Failed,
}

impl ProcessState {
    /// Whether a child may still be attached to the command stream.
    pub fn is_alive(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Stopping)
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Stopping)
                | (Running, Exited)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Exited, Running)
                | (Exited, Failed)
                | (Failed, Running)
                | (Stopped, Running)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Created => write!(f, "created"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Exited => write!(f, "exited"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_states() {
        assert!(ProcessState::Running.is_alive());
        assert!(ProcessState::Stopping.is_alive());
        assert!(!ProcessState::Created.is_alive());
        assert!(!ProcessState::Stopped.is_alive());
        assert!(!ProcessState::Exited.is_alive());
        assert!(!ProcessState::Failed.is_alive());
    }

    #[test]
    fn test_lifecycle_cycles() {
        use ProcessState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Exited));
        assert!(Exited.can_transition_to(Running));
        assert!(Exited.can_transition_to(Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use ProcessState::*;
        assert!(!Created.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Exited));
        assert!(!Running.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessState::Stopping.to_string(), "stopping");
        assert_eq!(ProcessState::Failed.to_string(), "failed");
    }
}
