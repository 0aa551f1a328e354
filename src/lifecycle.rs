//! Lifecycle state machine (§4.5): `Initializing -> Starting -> Running ->
//! Stopping -> {Stopped|Failed}`, with `Restarting` looping back to
//! `Starting` when the restart policy allows it.

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Initializing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Restarting,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    /// True if `next` is a transition the table in §4.5 permits from
    /// `self`. Used by tests to check lifecycle monotonicity (§8); the
    /// runtime state machine in `supervisor.rs` never constructs an
    /// illegal transition in the first place, but this lets a fuzz-style
    /// test assert the table matches the spec's diagram.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Initializing, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Failed, Restarting)
                | (Stopped, Restarting)
                | (Restarting, Starting)
        )
    }
}

/// Why the stop algorithm's child wait loop ended (§4.5 steps 3-4); callers
/// use this to decide whether the eventual terminal state is `Stopped` or
/// whether a forced kill happened (which also disqualifies auto-restart).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    GracefulExit,
    ForcedAfterTimeout,
}

/// Decide whether the restart policy permits another attempt (§4.5
/// "Auto-restart"). Pure function so the policy is unit-testable without
/// spinning up a child process.
pub fn should_restart(config: &ServerConfig, stop_outcome: Option<StopOutcome>, restart_count: u32) -> bool {
    if !config.auto_restart {
        return false;
    }
    if stop_outcome == Some(StopOutcome::ForcedAfterTimeout) {
        return false;
    }
    restart_count < config.max_restart_attempts
}

/// Resolve the effective graceful-stop timeout per the precedence decided
/// for the Open Question in spec.md §9: a per-request `Stop` command's
/// `timeoutSeconds`, when present, overrides the configured
/// `gracefulShutdownTimeoutSeconds` (see DESIGN.md).
pub fn effective_graceful_timeout(config: &ServerConfig, requested: Option<u64>) -> std::time::Duration {
    std::time::Duration::from_secs(requested.unwrap_or(config.graceful_shutdown_timeout_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ServerConfig {
        ServerConfig {
            executable_path: "/bin/true".to_string(),
            auto_restart: true,
            max_restart_attempts: 3,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn emitted_sequence_is_a_prefix_of_the_canonical_order() {
        use LifecycleState::*;
        let canonical = [Initializing, Starting, Running, Stopping, Stopped];
        let emitted = [Initializing, Starting, Running, Stopping];
        assert_eq!(&canonical[..emitted.len()], &emitted[..]);
    }

    #[test]
    fn illegal_transition_is_rejected_by_the_table() {
        assert!(!LifecycleState::Initializing.can_transition_to(LifecycleState::Running));
        assert!(!LifecycleState::Stopped.can_transition_to(LifecycleState::Running));
    }

    #[test]
    fn legal_happy_path_transitions_are_accepted() {
        use LifecycleState::*;
        assert!(Initializing.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn restart_denied_without_auto_restart() {
        let mut config = base_config();
        config.auto_restart = false;
        assert!(!should_restart(&config, Some(StopOutcome::GracefulExit), 0));
    }

    #[test]
    fn restart_denied_after_forced_kill() {
        let config = base_config();
        assert!(!should_restart(
            &config,
            Some(StopOutcome::ForcedAfterTimeout),
            0
        ));
    }

    #[test]
    fn restart_denied_once_attempts_exhausted() {
        let config = base_config();
        assert!(!should_restart(&config, Some(StopOutcome::GracefulExit), 3));
        assert!(should_restart(&config, Some(StopOutcome::GracefulExit), 2));
    }

    #[test]
    fn stop_timeout_prefers_request_override() {
        let config = base_config();
        assert_eq!(
            effective_graceful_timeout(&config, Some(2)),
            std::time::Duration::from_secs(2)
        );
        assert_eq!(
            effective_graceful_timeout(&config, None),
            std::time::Duration::from_secs(config.graceful_shutdown_timeout_seconds)
        );
    }
}
