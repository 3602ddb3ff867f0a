//! Re-verification of payments the backend has accepted but not yet seen on chain.
//!
//! After a pending confirmation the engine waits a fixed confirmation window,
//! then re-verifies on an exponential schedule until the backend confirms the
//! payment, rejects it, or the attempt budget runs out. One engine serves one
//! purchase attempt at a time; every run carries a scope id, and results that
//! arrive for a scope that is no longer current are dropped.

use crate::types::{TransactionIdentity, VerificationOutcome};
use crate::verifier::PaymentVerifier;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("growth_factor must be at least 1, got {0}")]
    GrowthFactor(f64),
    #[error("max_attempts must be positive")]
    ZeroAttempts,
    #[error("initial_delay_ms {initial_delay_ms} exceeds max_delay_ms {max_delay_ms}")]
    InitialExceedsMax {
        initial_delay_ms: u64,
        max_delay_ms: u64,
    },
}

/// Schedule for automatic re-verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Blind wait before the first attempt while the chain indexes the transaction.
    pub confirmation_window_ms: u64,
    pub initial_delay_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            confirmation_window_ms: 10_000,
            initial_delay_ms: 3_000,
            growth_factor: 1.5,
            max_delay_ms: 15_000,
            max_attempts: 30,
        }
    }
}

impl RetryPolicy {
    /// `min(initial_delay * growth_factor ^ attempt_number, max_delay)`.
    pub fn delay_ms(&self, attempt_number: u32) -> u64 {
        let exponent = i32::try_from(attempt_number).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.growth_factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        // capped is finite and non-negative here
        capped.round() as u64
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(RetryPolicyError::GrowthFactor(self.growth_factor));
        }
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(RetryPolicyError::InitialExceedsMax {
                initial_delay_ms: self.initial_delay_ms,
                max_delay_ms: self.max_delay_ms,
            });
        }
        Ok(())
    }
}

/// Countdown and attempt counter shown while waiting for the next attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Re-verification calls made so far in this run.
    pub attempt_number: u32,
    pub next_delay_ms: u64,
    pub remaining_seconds: u64,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTerminal {
    /// `credits_granted` is `None` when the backend reported no amount.
    Confirmed {
        credits_granted: Option<u64>,
        new_balance: Option<u64>,
        already_processed: bool,
    },
    Exhausted { attempts: u32 },
    Fatal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPhase {
    Idle,
    AwaitingConfirmationWindow,
    /// Waiting for, or performing, the given 1-based attempt.
    Retrying(u32),
    Finished(RetryTerminal),
}

impl RetryPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::AwaitingConfirmationWindow | Self::Retrying(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySnapshot {
    pub phase: RetryPhase,
    pub state: RetryState,
}

/// Receives engine transitions. Called from the engine task, never while the
/// engine's own lock is held.
pub trait RetryObserver: Send + Sync {
    fn on_progress(&self, _phase: &RetryPhase, _state: &RetryState) {}

    fn on_terminal(&self, terminal: &RetryTerminal);
}

struct EngineShared {
    scope: Option<Uuid>,
    target: Option<(TransactionIdentity, String)>,
    phase: RetryPhase,
    state: RetryState,
    abort: Option<AbortHandle>,
}

impl EngineShared {
    fn idle() -> Self {
        Self {
            scope: None,
            target: None,
            phase: RetryPhase::Idle,
            state: RetryState::default(),
            abort: None,
        }
    }
}

fn lock(shared: &Mutex<EngineShared>) -> MutexGuard<'_, EngineShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler for automatic and manual re-verification of one payment.
///
/// Dropping the engine cancels it.
pub struct RetryEngine {
    policy: RetryPolicy,
    verifier: Arc<dyn PaymentVerifier>,
    observer: Arc<dyn RetryObserver>,
    shared: Arc<Mutex<EngineShared>>,
    task: Option<JoinHandle<()>>,
}

impl RetryEngine {
    pub fn new(
        policy: RetryPolicy,
        verifier: Arc<dyn PaymentVerifier>,
        observer: Arc<dyn RetryObserver>,
    ) -> Self {
        Self {
            policy,
            verifier,
            observer,
            shared: Arc::new(Mutex::new(EngineShared::idle())),
            task: None,
        }
    }

    /// Starts automatic re-verification of `identity`, replacing any previous run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, identity: TransactionIdentity, chat_id: String) -> Uuid {
        self.cancel();
        let scope = Uuid::new_v4();
        {
            let mut shared = lock(&self.shared);
            shared.scope = Some(scope);
            shared.target = Some((identity.clone(), chat_id.clone()));
            shared.phase = RetryPhase::AwaitingConfirmationWindow;
        }
        let run = RunContext {
            scope,
            identity,
            chat_id,
            policy: self.policy.clone(),
            verifier: Arc::clone(&self.verifier),
            observer: Arc::clone(&self.observer),
            shared: Arc::clone(&self.shared),
        };
        let handle = tokio::spawn(run_schedule(run));
        {
            let mut shared = lock(&self.shared);
            if shared.scope == Some(scope) {
                shared.abort = Some(handle.abort_handle());
            }
        }
        self.task = Some(handle);
        scope
    }

    /// Stops the scheduled run and resets counters. Nothing fires afterwards;
    /// a verification call already in flight is dropped with its task.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let mut shared = lock(&self.shared);
        if shared.scope.is_some() {
            info!(scope = ?shared.scope, "retry engine cancelled");
        }
        *shared = EngineShared::idle();
    }

    /// One out-of-band re-verification of the current payment.
    ///
    /// A success ends the run and cancels the schedule. Any other outcome is
    /// returned to the caller and leaves the schedule untouched. Returns `None`
    /// when there is no active run.
    pub async fn manual_retry(&self) -> Option<VerificationOutcome> {
        let (scope, identity, chat_id) = {
            let shared = lock(&self.shared);
            if !shared.phase.is_active() {
                return None;
            }
            let scope = shared.scope?;
            let (identity, chat_id) = shared.target.clone()?;
            (scope, identity, chat_id)
        };
        info!(tx_hash = %identity, "manual verification retry");
        let outcome = self.verifier.reverify(&identity, &chat_id).await;
        if outcome.is_success() {
            conclude(
                &self.shared,
                self.observer.as_ref(),
                scope,
                confirmed_terminal(&outcome),
            );
        } else if !outcome.is_retryable() {
            warn!(tx_hash = %identity, outcome = ?outcome, "manual retry failed, schedule continues");
        }
        Some(outcome)
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        let shared = lock(&self.shared);
        RetrySnapshot {
            phase: shared.phase.clone(),
            state: shared.state.clone(),
        }
    }

    pub fn scope(&self) -> Option<Uuid> {
        lock(&self.shared).scope
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).phase.is_active()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Drop for RetryEngine {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn confirmed_terminal(outcome: &VerificationOutcome) -> RetryTerminal {
    match outcome {
        VerificationOutcome::Confirmed {
            credits_granted,
            new_balance,
        } => RetryTerminal::Confirmed {
            credits_granted: *credits_granted,
            new_balance: *new_balance,
            already_processed: false,
        },
        _ => RetryTerminal::Confirmed {
            credits_granted: None,
            new_balance: None,
            already_processed: true,
        },
    }
}

/// Moves `scope` to a terminal phase. Returns false when the scope is stale.
fn conclude(
    shared: &Mutex<EngineShared>,
    observer: &dyn RetryObserver,
    scope: Uuid,
    terminal: RetryTerminal,
) -> bool {
    let abort = {
        let mut shared = lock(shared);
        if shared.scope != Some(scope) {
            return false;
        }
        shared.scope = None;
        shared.target = None;
        shared.phase = RetryPhase::Finished(terminal.clone());
        shared.state = RetryState::default();
        shared.abort.take()
    };
    info!(%scope, terminal = ?terminal, "retry engine finished");
    observer.on_terminal(&terminal);
    if let Some(abort) = abort {
        abort.abort();
    }
    true
}

struct RunContext {
    scope: Uuid,
    identity: TransactionIdentity,
    chat_id: String,
    policy: RetryPolicy,
    verifier: Arc<dyn PaymentVerifier>,
    observer: Arc<dyn RetryObserver>,
    shared: Arc<Mutex<EngineShared>>,
}

/// Automatic schedule for one run: confirmation window, then backed-off attempts.
#[instrument(skip_all, fields(tx_hash = %ctx.identity, scope = %ctx.scope))]
async fn run_schedule(ctx: RunContext) {
    let window = Duration::from_millis(ctx.policy.confirmation_window_ms);
    info!(
        window_ms = ctx.policy.confirmation_window_ms,
        "awaiting confirmation window"
    );
    if !ctx
        .countdown(RetryPhase::AwaitingConfirmationWindow, 0, window)
        .await
    {
        return;
    }

    let mut attempt_number = 0u32;
    loop {
        let delay_ms = ctx.policy.delay_ms(attempt_number);
        let phase = RetryPhase::Retrying(attempt_number + 1);
        if !ctx
            .countdown(phase.clone(), attempt_number, Duration::from_millis(delay_ms))
            .await
        {
            return;
        }

        attempt_number += 1;
        let in_flight = RetryState {
            attempt_number,
            ..RetryState::default()
        };
        if !ctx.publish(phase, in_flight) {
            return;
        }
        let outcome = ctx.verifier.reverify(&ctx.identity, &ctx.chat_id).await;

        let terminal = if outcome.is_success() {
            confirmed_terminal(&outcome)
        } else if outcome.is_retryable() {
            if attempt_number < ctx.policy.max_attempts {
                warn!(
                    attempt = attempt_number,
                    max_attempts = ctx.policy.max_attempts,
                    next_delay_ms = ctx.policy.delay_ms(attempt_number),
                    outcome = ?outcome,
                    "payment not confirmed yet"
                );
                continue;
            }
            RetryTerminal::Exhausted {
                attempts: attempt_number,
            }
        } else {
            RetryTerminal::Fatal {
                reason: outcome.message(),
            }
        };
        conclude(&ctx.shared, ctx.observer.as_ref(), ctx.scope, terminal);
        return;
    }
}

impl RunContext {
    /// Sleeps for `delay`, publishing the remaining whole seconds once per second.
    async fn countdown(&self, phase: RetryPhase, attempt_number: u32, delay: Duration) -> bool {
        let next_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let state = RetryState {
                attempt_number,
                next_delay_ms,
                remaining_seconds: remaining.as_millis().div_ceil(1000) as u64,
                deadline: Some(deadline),
            };
            if !self.publish(phase.clone(), state.clone()) {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            // wake when the displayed whole-second count changes
            let whole_seconds_left = state.remaining_seconds - 1;
            sleep_until(deadline - Duration::from_secs(whole_seconds_left)).await;
        }
    }

    /// Records progress for this run. Returns false once the run is stale.
    fn publish(&self, phase: RetryPhase, state: RetryState) -> bool {
        {
            let mut shared = lock(&self.shared);
            if shared.scope != Some(self.scope) {
                return false;
            }
            shared.phase = phase.clone();
            shared.state = state.clone();
        }
        self.observer.on_progress(&phase, &state);
        true
    }
}
