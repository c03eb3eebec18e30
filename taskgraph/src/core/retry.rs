//! Retry and continuation state machine for one subtask's engine calls.
//!
//! `Pending -> Retrying(n) -> Continuing(n) -> Done | Failed`. Transient
//! invocation errors are retried with capped exponential backoff; a timeout is
//! terminal; a successful response that asks to continue starts another round
//! up to the continuation limit.

use std::time::Duration;

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_continuations: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Retrying(u32),
    Continuing(u32),
    Done,
    Failed,
}

/// Outcome of one engine call as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Responded(Option<TaskStatus>),
    Transient,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Timeout,
    RetriesExhausted,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Retry { after: Duration },
    Continue,
    Done,
    Fail(FailReason),
}

#[derive(Debug, Clone)]
pub struct InvocationMachine {
    policy: RetryPolicy,
    phase: Phase,
    retries: u32,
    continuations: u32,
}

impl InvocationMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            phase: Phase::Pending,
            retries: 0,
            continuations: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn continuations(&self) -> u32 {
        self.continuations
    }

    /// Retries spent in the current round.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn on_outcome(&mut self, outcome: CallOutcome) -> Next {
        match outcome {
            CallOutcome::TimedOut => {
                self.phase = Phase::Failed;
                Next::Fail(FailReason::Timeout)
            }
            CallOutcome::Transient if self.retries < self.policy.max_retries => {
                self.retries += 1;
                self.phase = Phase::Retrying(self.retries);
                Next::Retry {
                    after: self.policy.backoff(self.retries),
                }
            }
            CallOutcome::Transient => {
                self.phase = Phase::Failed;
                Next::Fail(FailReason::RetriesExhausted)
            }
            CallOutcome::Responded(Some(TaskStatus::Continue))
                if self.continuations < self.policy.max_continuations =>
            {
                self.retries = 0;
                self.continuations += 1;
                self.phase = Phase::Continuing(self.continuations);
                Next::Continue
            }
            CallOutcome::Responded(_) => {
                self.phase = Phase::Done;
                Next::Done
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            max_continuations: 2,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    /// Transient errors are retried up to the limit, then fail.
    #[test]
    fn transient_errors_exhaust_retries() {
        let mut machine = InvocationMachine::new(policy());
        for n in 1..=3 {
            assert!(matches!(
                machine.on_outcome(CallOutcome::Transient),
                Next::Retry { .. }
            ));
            assert_eq!(machine.phase(), Phase::Retrying(n));
        }
        assert_eq!(
            machine.on_outcome(CallOutcome::Transient),
            Next::Fail(FailReason::RetriesExhausted)
        );
        assert_eq!(machine.phase(), Phase::Failed);
    }

    /// A timeout is terminal even with retries left.
    #[test]
    fn timeout_is_not_retried() {
        let mut machine = InvocationMachine::new(policy());
        assert_eq!(
            machine.on_outcome(CallOutcome::TimedOut),
            Next::Fail(FailReason::Timeout)
        );
    }

    #[test]
    fn continuation_rounds_are_bounded() {
        let mut machine = InvocationMachine::new(policy());
        let cont = CallOutcome::Responded(Some(TaskStatus::Continue));
        assert_eq!(machine.on_outcome(cont), Next::Continue);
        assert_eq!(machine.phase(), Phase::Continuing(1));
        assert_eq!(machine.on_outcome(cont), Next::Continue);
        assert_eq!(machine.on_outcome(cont), Next::Done);
        assert_eq!(machine.continuations(), 2);
    }

    /// Retries are counted per round, so a continuation starts fresh.
    #[test]
    fn retries_reset_after_a_response() {
        let mut machine = InvocationMachine::new(policy());
        machine.on_outcome(CallOutcome::Transient);
        machine.on_outcome(CallOutcome::Transient);
        machine.on_outcome(CallOutcome::Responded(Some(TaskStatus::Continue)));
        assert_eq!(machine.retries(), 0);
        assert_eq!(
            machine.on_outcome(CallOutcome::Transient),
            Next::Retry {
                after: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn completed_status_finishes() {
        let mut machine = InvocationMachine::new(policy());
        assert_eq!(
            machine.on_outcome(CallOutcome::Responded(Some(TaskStatus::NeedsVerification))),
            Next::Done
        );
        assert_eq!(machine.phase(), Phase::Done);
    }
}
