//! Remediation with bounded retry.
//!
//! Each attempt applies the corrective action, re-inspects the resource and
//! checks the result against the desired state. Attempts move through an
//! explicit state machine:
//!
//! ```text
//! Pending -> InProgress -> Verified
//!                       -> FailedRetryable -> Pending (after backoff)
//!                       -> FailedTerminal
//! ```
//!
//! Cancellation is only observed while an attempt is `Pending`: before it
//! starts or during the backoff sleep. An apply and its verification always
//! run to completion.
//!
//! Inspections go through the same machine, so a throttled or slow describe
//! call is retried with the same backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_cloud::{ObservedState, ResourceProvider, ResourceRef};

use crate::error::{ErrorKind, ReconcileError};
use crate::inspector::Inspector;
use crate::policy::DesiredState;

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(900),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1).min(32)).unwrap_or(32);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Whether another attempt may follow `attempt` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// State of a remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    InProgress,
    Verified,
    FailedRetryable,
    FailedTerminal,
}

impl AttemptState {
    /// Whether the machine may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (
                    Self::InProgress,
                    Self::Verified | Self::FailedRetryable | Self::FailedTerminal
                )
                | (Self::FailedRetryable, Self::Pending)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::FailedTerminal)
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal attempt transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: AttemptState,
    pub to: AttemptState,
}

/// Bookkeeping for one remediation run.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationAttempt {
    pub resource_id: String,
    /// Number of attempts started so far.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub state: AttemptState,
}

impl RemediationAttempt {
    #[must_use]
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            attempt: 0,
            last_error: None,
            last_error_kind: None,
            next_retry_at: None,
            state: AttemptState::Pending,
        }
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] if the move is not allowed.
    pub fn transition(&mut self, next: AttemptState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Start the next attempt.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] unless the attempt is `Pending`.
    pub fn begin(&mut self) -> Result<(), IllegalTransition> {
        self.transition(AttemptState::InProgress)?;
        self.attempt += 1;
        self.next_retry_at = None;
        Ok(())
    }

    /// Record a verified attempt.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] unless the attempt is `InProgress`.
    pub fn succeed(&mut self) -> Result<(), IllegalTransition> {
        self.transition(AttemptState::Verified)
    }

    /// Record a failed attempt and decide whether another one may follow.
    ///
    /// Returns the delay before the next attempt, or `None` when the failure
    /// is terminal.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] unless the attempt is `InProgress`.
    pub fn fail(
        &mut self,
        err: &ReconcileError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, IllegalTransition> {
        let kind = err.kind();
        self.last_error = Some(err.to_string());
        self.last_error_kind = Some(kind);

        if kind.is_retryable() && policy.should_retry(self.attempt) {
            self.transition(AttemptState::FailedRetryable)?;
            let delay = policy
                .delay_after(self.attempt)
                .max(err.retry_after().unwrap_or_default());
            self.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d));
            Ok(Some(delay))
        } else {
            self.transition(AttemptState::FailedTerminal)?;
            Ok(None)
        }
    }

    /// Return to `Pending` after backoff.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] unless the attempt is `FailedRetryable`.
    pub fn retry(&mut self) -> Result<(), IllegalTransition> {
        self.transition(AttemptState::Pending)
    }
}

/// How a remediation run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationResult {
    /// The desired state was applied and confirmed by re-inspection.
    Verified {
        attempts: u32,
        observed: ObservedState,
    },
    /// The run gave up.
    Failed {
        attempts: u32,
        kind: ErrorKind,
        error: String,
    },
    /// The resource's work was cancelled between attempts.
    Cancelled { attempts: u32 },
}

impl RemediationResult {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Verified { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// How an inspection with retries ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectionResult {
    Observed {
        attempts: u32,
        observed: ObservedState,
    },
    Failed {
        attempts: u32,
        kind: ErrorKind,
        error: String,
    },
    /// The resource's work was cancelled between attempts.
    Cancelled { attempts: u32 },
}

enum Retried<T> {
    Succeeded(T),
    Failed(ReconcileError),
    Cancelled,
}

/// Applies desired states to resources.
#[derive(Clone)]
pub struct Executor {
    provider: Arc<dyn ResourceProvider>,
    inspector: Inspector,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Executor {
    /// `timeout` bounds each corrective call; verification uses the
    /// inspector's own deadline.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        inspector: Inspector,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            inspector,
            retry,
            timeout,
        }
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Drive `resource` to `desired`, retrying transient failures.
    ///
    /// Idempotent: remediating an already-remediated resource verifies on the
    /// first attempt without changing it.
    pub async fn remediate(
        &self,
        resource: &ResourceRef,
        desired: &DesiredState,
        cancel: &CancellationToken,
    ) -> RemediationResult {
        let mut attempt = RemediationAttempt::new(&resource.id);
        let step = move || self.apply_and_verify(resource, desired);
        match self.retrying("Remediation", cancel, &mut attempt, step).await {
            Ok(Retried::Succeeded(observed)) => RemediationResult::Verified {
                attempts: attempt.attempt,
                observed,
            },
            Ok(Retried::Failed(err)) => RemediationResult::Failed {
                attempts: attempt.attempt,
                kind: err.kind(),
                error: err.to_string(),
            },
            Ok(Retried::Cancelled) => RemediationResult::Cancelled {
                attempts: attempt.attempt,
            },
            Err(illegal) => {
                Self::log_violation(&attempt, &illegal);
                RemediationResult::Failed {
                    attempts: attempt.attempt,
                    kind: ErrorKind::Invalid,
                    error: illegal.to_string(),
                }
            }
        }
    }

    /// Read the current state of `resource`, retrying transient failures
    /// with the same backoff as remediation.
    pub async fn observe(
        &self,
        resource: &ResourceRef,
        cancel: &CancellationToken,
    ) -> InspectionResult {
        let mut attempt = RemediationAttempt::new(&resource.id);
        let step = move || self.inspector.inspect(resource);
        match self.retrying("Inspection", cancel, &mut attempt, step).await {
            Ok(Retried::Succeeded(observed)) => InspectionResult::Observed {
                attempts: attempt.attempt,
                observed,
            },
            Ok(Retried::Failed(err)) => InspectionResult::Failed {
                attempts: attempt.attempt,
                kind: err.kind(),
                error: format!("inspection failed: {err}"),
            },
            Ok(Retried::Cancelled) => InspectionResult::Cancelled {
                attempts: attempt.attempt,
            },
            Err(illegal) => {
                Self::log_violation(&attempt, &illegal);
                InspectionResult::Failed {
                    attempts: attempt.attempt,
                    kind: ErrorKind::Invalid,
                    error: illegal.to_string(),
                }
            }
        }
    }

    fn log_violation(attempt: &RemediationAttempt, illegal: &IllegalTransition) {
        error!(resource_id = %attempt.resource_id, error = %illegal, "Attempt state machine violated");
    }

    /// Run `step` until it succeeds, fails terminally or `cancel` fires
    /// while the next attempt is pending.
    async fn retrying<T, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        attempt: &mut RemediationAttempt,
        mut step: F,
    ) -> Result<Retried<T>, IllegalTransition>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReconcileError>>,
    {
        let resource_id = attempt.resource_id.clone();
        loop {
            if cancel.is_cancelled() {
                info!(resource_id = %resource_id, attempts = attempt.attempt, "{what} cancelled");
                return Ok(Retried::Cancelled);
            }

            attempt.begin()?;
            debug!(resource_id = %resource_id, attempt = attempt.attempt, "{what} attempt started");

            let err = match step().await {
                Ok(value) => {
                    attempt.succeed()?;
                    if attempt.attempt > 1 {
                        info!(resource_id = %resource_id, attempts = attempt.attempt, "{what} succeeded after retry");
                    }
                    return Ok(Retried::Succeeded(value));
                }
                Err(err) => err,
            };

            let Some(delay) = attempt.fail(&err, &self.retry, Utc::now())? else {
                let kind = err.kind();
                if kind == ErrorKind::PermissionDenied {
                    error!(resource_id = %resource_id, attempts = attempt.attempt, error = %err, "{what} denied");
                } else {
                    warn!(resource_id = %resource_id, attempts = attempt.attempt, error_kind = %kind, error = %err, "{what} failed");
                }
                return Ok(Retried::Failed(err));
            };

            warn!(
                resource_id = %resource_id,
                attempt = attempt.attempt,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "{what} attempt failed, will retry"
            );
            attempt.retry()?;

            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn apply_and_verify(
        &self,
        resource: &ResourceRef,
        desired: &DesiredState,
    ) -> Result<ObservedState, ReconcileError> {
        match desired {
            DesiredState::WebAclAssociated { web_acl_arn } => {
                let call = self.provider.associate_web_acl(resource, web_acl_arn);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ReconcileError::Timeout {
                            operation: "associate_web_acl",
                            timeout: self.timeout,
                        })
                    }
                }
            }
        }

        let observed = self.inspector.inspect(resource).await?;
        let verdict = desired.check(&resource.id, &observed);
        if verdict.compliant {
            Ok(observed)
        } else {
            Err(ReconcileError::Unverified {
                detail: verdict.detail,
            })
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("provider", &self.provider.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
