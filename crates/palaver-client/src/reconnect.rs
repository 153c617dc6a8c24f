//! Reconnection state machine for the client connection controller.
//!
//! Every transition is validated against the current phase, so "connect
//! while already connecting" and "reconnect after explicit disconnect"
//! are unrepresentable rather than guarded by scattered booleans.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the fixed delay before the next attempt.
    WaitingRetry,
    /// Retry budget exhausted; only an explicit connect() resumes.
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    TransportClosed,
    RetryTimerFired,
    DisconnectRequested,
}

/// What the controller must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    StartConnect,
    RetryAfter(Duration),
    /// Budget exhausted: surface a terminal disconnect to subscribers.
    EmitTerminalDisconnect,
    /// Nothing to do beyond the state change itself.
    Settle,
}

#[derive(Debug, Error)]
#[error("event {event:?} not valid in phase {phase:?}")]
pub struct InvalidTransition {
    pub phase: Phase,
    pub event: MachineEvent,
}

pub struct ReconnectMachine {
    phase: Phase,
    attempt_count: u32,
    should_reconnect: bool,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ReconnectMachine {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            phase: Phase::Disconnected,
            attempt_count: 0,
            should_reconnect: true,
            max_attempts,
            retry_delay,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.phase == Phase::Connecting
    }

    pub fn handle(&mut self, event: MachineEvent) -> Result<Directive, InvalidTransition> {
        use MachineEvent::*;
        use Phase::*;

        match (self.phase, event) {
            // An explicit connect resumes from idle or from exhaustion,
            // with a fresh budget.
            (Disconnected | Halted, ConnectRequested) => {
                self.should_reconnect = true;
                self.attempt_count = 0;
                self.phase = Connecting;
                Ok(Directive::StartConnect)
            }
            (Connecting, ConnectSucceeded) => {
                self.attempt_count = 0;
                self.phase = Connected;
                Ok(Directive::Settle)
            }
            (Connecting, ConnectFailed | TransportClosed) => Ok(self.on_failure()),
            (Connected, TransportClosed) => Ok(self.on_failure()),
            (WaitingRetry, RetryTimerFired) => {
                self.phase = Connecting;
                Ok(Directive::StartConnect)
            }
            // Explicit disconnect is valid everywhere and clears the
            // reconnect flag before the transport observes the close.
            (_, DisconnectRequested) => {
                self.should_reconnect = false;
                self.attempt_count = 0;
                self.phase = Disconnected;
                Ok(Directive::Settle)
            }
            (phase, event) => Err(InvalidTransition { phase, event }),
        }
    }

    fn on_failure(&mut self) -> Directive {
        if !self.should_reconnect {
            self.phase = Phase::Disconnected;
            return Directive::Settle;
        }
        self.attempt_count += 1;
        if self.attempt_count >= self.max_attempts {
            self.should_reconnect = false;
            self.phase = Phase::Halted;
            Directive::EmitTerminalDisconnect
        } else {
            self.phase = Phase::WaitingRetry;
            Directive::RetryAfter(self.retry_delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(100);

    fn machine() -> ReconnectMachine {
        ReconnectMachine::new(3, DELAY)
    }

    #[test]
    fn connect_succeeds_and_resets_attempts() {
        let mut m = machine();
        assert_eq!(
            m.handle(MachineEvent::ConnectRequested).unwrap(),
            Directive::StartConnect
        );
        assert!(m.is_connecting());
        m.handle(MachineEvent::ConnectSucceeded).unwrap();
        assert!(m.is_connected());
        assert_eq!(m.attempt_count(), 0);
    }

    #[test]
    fn duplicate_connect_is_rejected() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();
        assert!(m.handle(MachineEvent::ConnectRequested).is_err());
        m.handle(MachineEvent::ConnectSucceeded).unwrap();
        assert!(m.handle(MachineEvent::ConnectRequested).is_err());
    }

    #[test]
    fn failures_schedule_bounded_retries_then_halt() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();

        // Failures 1 and 2 retry; failure 3 exhausts the budget.
        for expected_attempt in 1..3 {
            assert_eq!(
                m.handle(MachineEvent::ConnectFailed).unwrap(),
                Directive::RetryAfter(DELAY)
            );
            assert_eq!(m.attempt_count(), expected_attempt);
            assert!(!m.is_connected());
            assert_eq!(
                m.handle(MachineEvent::RetryTimerFired).unwrap(),
                Directive::StartConnect
            );
        }
        assert_eq!(
            m.handle(MachineEvent::ConnectFailed).unwrap(),
            Directive::EmitTerminalDisconnect
        );
        assert_eq!(m.phase(), Phase::Halted);
        assert!(!m.should_reconnect());
    }

    #[test]
    fn established_connection_loss_schedules_a_retry() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();
        m.handle(MachineEvent::ConnectSucceeded).unwrap();
        assert_eq!(
            m.handle(MachineEvent::TransportClosed).unwrap(),
            Directive::RetryAfter(DELAY)
        );
        assert_eq!(m.phase(), Phase::WaitingRetry);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();
        m.handle(MachineEvent::ConnectFailed).unwrap();
        m.handle(MachineEvent::RetryTimerFired).unwrap();
        m.handle(MachineEvent::ConnectSucceeded).unwrap();
        assert_eq!(m.attempt_count(), 0);
        // A later drop starts counting from scratch.
        m.handle(MachineEvent::TransportClosed).unwrap();
        assert_eq!(m.attempt_count(), 1);
    }

    #[test]
    fn explicit_disconnect_suppresses_reconnect() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();
        m.handle(MachineEvent::ConnectSucceeded).unwrap();
        m.handle(MachineEvent::DisconnectRequested).unwrap();
        assert_eq!(m.phase(), Phase::Disconnected);
        assert!(!m.should_reconnect());
        // A timer that somehow fires afterwards is an invalid transition,
        // not a reconnect.
        assert!(m.handle(MachineEvent::RetryTimerFired).is_err());
    }

    #[test]
    fn disconnect_mid_retry_wait_cancels_the_cycle() {
        let mut m = machine();
        m.handle(MachineEvent::ConnectRequested).unwrap();
        m.handle(MachineEvent::ConnectFailed).unwrap();
        assert_eq!(m.phase(), Phase::WaitingRetry);
        m.handle(MachineEvent::DisconnectRequested).unwrap();
        assert!(m.handle(MachineEvent::RetryTimerFired).is_err());
    }

    #[test]
    fn connect_after_halt_starts_a_fresh_budget() {
        let mut m = ReconnectMachine::new(1, DELAY);
        m.handle(MachineEvent::ConnectRequested).unwrap();
        assert_eq!(
            m.handle(MachineEvent::ConnectFailed).unwrap(),
            Directive::EmitTerminalDisconnect
        );
        assert_eq!(
            m.handle(MachineEvent::ConnectRequested).unwrap(),
            Directive::StartConnect
        );
        assert!(m.should_reconnect());
        assert_eq!(m.attempt_count(), 0);
    }
}
