use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Verifying,
    Connected,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Connected,
    Retry { attempt: u32, delay: Duration },
    Abort { attempts: u32 },
    /// The probe finished after the attempt it belonged to was superseded
    Stale,
}

///
/// Tracks the RPC connection lifecycle. Every reset starts a new epoch with a fresh
/// cancellation token; timers and subscriptions started for an epoch stop when it ends
/// and events tagged with an older epoch are dropped by the node.
///
/// Failed probes back off linearly (`base_delay * attempts`). Once `max_attempts`
/// retries have failed the supervisor aborts and never leaves that state.
///
#[derive(Debug)]
pub struct ConnectionSupervisor {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    epoch: u64,
    parent: CancellationToken,
    token: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(max_attempts: u32, base_delay: Duration, parent: CancellationToken) -> Self {
        let token = parent.child_token();
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
            base_delay,
            epoch: 0,
            parent,
            token,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_aborted(&self) -> bool {
        self.state == ConnectionState::Aborted
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Token of the current epoch
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns false when no probe should be issued
    pub fn begin_attempt(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.state = ConnectionState::Verifying;
                true
            }
            ConnectionState::Verifying | ConnectionState::Connected | ConnectionState::Aborted => {
                false
            }
        }
    }

    /// Applies the result of a liveness probe. A head of 0 counts as a failure.
    pub fn on_probe(&mut self, head: Option<u64>) -> ProbeOutcome {
        if self.state != ConnectionState::Verifying {
            return ProbeOutcome::Stale;
        }

        match head {
            Some(head) if head > 0 => {
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                ProbeOutcome::Connected
            }
            _ if self.attempts < self.max_attempts => {
                self.attempts += 1;
                self.state = ConnectionState::Connecting;
                ProbeOutcome::Retry {
                    attempt: self.attempts,
                    delay: self.base_delay * self.attempts,
                }
            }
            _ => {
                self.state = ConnectionState::Aborted;
                self.token.cancel();
                ProbeOutcome::Abort {
                    attempts: self.attempts,
                }
            }
        }
    }

    /// Ends the current epoch. Returns false once aborted.
    pub fn reset(&mut self) -> bool {
        if self.is_aborted() {
            return false;
        }
        self.token.cancel();
        self.token = self.parent.child_token();
        self.epoch += 1;
        self.attempts = 0;
        self.state = ConnectionState::Disconnected;
        true
    }

    /// Cancels everything started under the current epoch without starting a new one
    pub fn shutdown(&mut self) {
        self.token.cancel();
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max_attempts: u32) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            max_attempts,
            Duration::from_millis(100),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_connects_on_positive_head() {
        let mut supervisor = supervisor(3);
        assert!(supervisor.begin_attempt());
        assert!(!supervisor.begin_attempt());
        assert_eq!(supervisor.on_probe(Some(10)), ProbeOutcome::Connected);
        assert!(supervisor.is_connected());
        assert!(!supervisor.begin_attempt());
    }

    #[test]
    fn test_linear_backoff_then_abort() {
        let mut supervisor = supervisor(3);
        for attempt in 1..=3 {
            assert!(supervisor.begin_attempt());
            assert_eq!(
                supervisor.on_probe(None),
                ProbeOutcome::Retry {
                    attempt,
                    delay: Duration::from_millis(100) * attempt
                }
            );
        }

        let token = supervisor.token();
        assert!(supervisor.begin_attempt());
        assert_eq!(supervisor.on_probe(Some(0)), ProbeOutcome::Abort { attempts: 3 });
        assert!(supervisor.is_aborted());
        assert!(token.is_cancelled());

        // terminal
        assert!(!supervisor.begin_attempt());
        assert_eq!(supervisor.on_probe(Some(5)), ProbeOutcome::Stale);
        assert!(!supervisor.reset());
        assert_eq!(supervisor.epoch(), 0);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut supervisor = supervisor(5);
        supervisor.begin_attempt();
        supervisor.on_probe(None);
        supervisor.begin_attempt();
        supervisor.on_probe(None);
        assert_eq!(supervisor.attempts(), 2);

        supervisor.begin_attempt();
        supervisor.on_probe(Some(1));
        assert_eq!(supervisor.attempts(), 0);
    }

    #[test]
    fn test_reset_starts_new_epoch() {
        let mut supervisor = supervisor(5);
        supervisor.begin_attempt();
        supervisor.on_probe(Some(1));

        let old = supervisor.token();
        assert!(supervisor.reset());
        assert!(old.is_cancelled());
        assert!(!supervisor.token().is_cancelled());
        assert_eq!(supervisor.epoch(), 1);
        assert!(supervisor.is_current(1));
        assert!(!supervisor.is_current(0));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_probe_after_reset_is_stale() {
        let mut supervisor = supervisor(5);
        supervisor.begin_attempt();
        supervisor.reset();
        assert_eq!(supervisor.on_probe(Some(1)), ProbeOutcome::Stale);
    }

    #[test]
    fn test_parent_cancel_reaches_epoch_token() {
        let parent = CancellationToken::new();
        let mut supervisor = ConnectionSupervisor::new(1, Duration::from_millis(1), parent.clone());
        supervisor.reset();
        parent.cancel();
        assert!(supervisor.token().is_cancelled());
    }
}
