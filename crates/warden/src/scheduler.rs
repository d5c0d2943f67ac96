//! Reconciliation scheduling.
//!
//! The scheduler owns the job body (inspect, evaluate, remediate, record) and
//! the rules for running it:
//!
//! - at most one job per resource id is in flight, tracked by an explicit
//!   claim map;
//! - a request for an id that is already in flight is coalesced: the running
//!   job makes one more pass when it finishes, however many requests arrived;
//! - jobs for distinct ids run in parallel up to `workers`;
//! - one resource's failure never aborts the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;
use warden_cloud::{ResourceProvider, ResourceRef};

use crate::config::WardenConfig;
use crate::error::ErrorKind;
use crate::executor::{Executor, InspectionResult, RemediationResult, RetryPolicy};
use crate::fleet::Fleet;
use crate::inspector::Inspector;
use crate::outcome::{Action, OutcomeRecord, OutcomeSink, OutcomeStatus, Trigger};
use crate::policy::PolicySet;

/// Tuning knobs for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub inspect_timeout: Duration,
    pub remediate_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            inspect_timeout: Duration::from_secs(10),
            remediate_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerSettings {
    #[must_use]
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            workers: config.workers,
            inspect_timeout: config.inspect_timeout(),
            remediate_timeout: config.remediate_timeout(),
            retry: config.retry_policy(),
        }
    }
}

// ============================================================================
// In-flight registry
// ============================================================================

/// Per-id claims. A claim records whether another pass was requested while
/// the owner was running.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    claims: Mutex<HashMap<String, bool>>,
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. If it is already claimed, request a rerun from the owner
    /// and return `false`.
    pub fn try_claim(&self, id: &str) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rerun) = claims.get_mut(id) {
            *rerun = true;
            return false;
        }
        claims.insert(id.to_string(), false);
        true
    }

    /// Called by the owner after a pass. Returns `true` (keeping the claim) if
    /// a rerun was requested, otherwise releases the claim.
    pub fn finish(&self, id: &str) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        match claims.get_mut(id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                claims.remove(id);
                false
            }
        }
    }

    /// Drop a claim unconditionally.
    pub fn release(&self, id: &str) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    #[must_use]
    pub fn is_claimed(&self, id: &str) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a claim and releases it on drop unless `finish` already did.
struct ClaimGuard<'a> {
    registry: &'a InFlightRegistry,
    id: &'a str,
    held: bool,
}

impl<'a> ClaimGuard<'a> {
    fn acquire(registry: &'a InFlightRegistry, id: &'a str) -> Option<Self> {
        registry.try_claim(id).then(|| Self {
            registry,
            id,
            held: true,
        })
    }

    fn rerun_requested(&mut self) -> bool {
        let rerun = self.registry.finish(self.id);
        self.held = rerun;
        rerun
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.registry.release(self.id);
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of a single-resource request.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The job ran; the record is from its last pass.
    Completed(OutcomeRecord),
    /// A job for the id was already in flight and will run once more.
    Coalesced,
    /// The id is not in the fleet.
    Unmanaged,
}

/// Result of a scan over several resources.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub outcomes: Vec<OutcomeRecord>,
    pub coalesced: Vec<String>,
    pub unmanaged: Vec<String>,
}

impl ScanReport {
    fn push(&mut self, id: String, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed(record) => self.outcomes.push(record),
            JobOutcome::Coalesced => self.coalesced.push(id),
            JobOutcome::Unmanaged => self.unmanaged.push(id),
        }
    }

    /// Number of completed jobs that ended with `status`.
    #[must_use]
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|r| r.status == status).count()
    }

    #[must_use]
    pub fn has_terminal_failures(&self) -> bool {
        self.outcomes.iter().any(OutcomeRecord::is_terminal_failure)
    }

    /// Outcomes sorted by resource id.
    #[must_use]
    pub fn sorted(mut self) -> Self {
        self.outcomes.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        self.coalesced.sort();
        self.unmanaged.sort();
        self
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Runs reconciliation jobs over the fleet.
#[derive(Debug)]
pub struct Scheduler {
    fleet: Arc<Fleet>,
    policies: Arc<PolicySet>,
    inspector: Inspector,
    executor: Executor,
    sink: Arc<OutcomeSink>,
    registry: InFlightRegistry,
    permits: Semaphore,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        fleet: Arc<Fleet>,
        policies: Arc<PolicySet>,
        provider: Arc<dyn ResourceProvider>,
        sink: Arc<OutcomeSink>,
        settings: &SchedulerSettings,
    ) -> Self {
        let inspector = Inspector::new(Arc::clone(&provider), settings.inspect_timeout);
        let executor = Executor::new(
            provider,
            inspector.clone(),
            settings.retry.clone(),
            settings.remediate_timeout,
        );
        Self {
            fleet,
            policies,
            inspector,
            executor,
            sink,
            registry: InFlightRegistry::new(),
            permits: Semaphore::new(settings.workers.max(1)),
        }
    }

    #[must_use]
    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    #[must_use]
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    #[must_use]
    pub const fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    #[must_use]
    pub const fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    /// Wait for outcome notifications to be delivered. Call before exiting.
    pub async fn flush(&self) {
        self.sink.flush().await;
    }

    /// Reconcile one resource now.
    pub async fn run_one(&self, id: &str, trigger: Trigger) -> JobOutcome {
        if !self.fleet.contains(id).await {
            debug!(resource_id = %id, "Ignoring request for unmanaged resource");
            return JobOutcome::Unmanaged;
        }

        let Some(mut claim) = ClaimGuard::acquire(&self.registry, id) else {
            debug!(resource_id = %id, %trigger, "Job already in flight, coalesced");
            return JobOutcome::Coalesced;
        };

        let mut record = self.pass(id, trigger).await;
        while claim.rerun_requested() {
            debug!(resource_id = %id, "Running coalesced pass");
            match self.pass(id, trigger).await {
                Some(next) => record = Some(next),
                None => break,
            }
        }

        record.map_or(JobOutcome::Unmanaged, JobOutcome::Completed)
    }

    /// Reconcile the given resources, in parallel up to the worker limit.
    pub async fn run_scan(
        self: &Arc<Self>,
        ids: impl IntoIterator<Item = String>,
        trigger: Trigger,
    ) -> ScanReport {
        let mut jobs = JoinSet::new();
        for id in ids {
            let scheduler = Arc::clone(self);
            jobs.spawn(async move {
                let outcome = scheduler.run_one(&id, trigger).await;
                (id, outcome)
            });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((id, outcome)) => report.push(id, outcome),
                Err(e) => error!(error = %e, "Reconciliation job aborted"),
            }
        }
        report.sorted()
    }

    /// Reconcile every managed resource.
    pub async fn run_full_scan(self: &Arc<Self>) -> ScanReport {
        let ids = self.fleet.ids().await;
        info!(resources = ids.len(), "Starting fleet scan");
        let report = self.run_scan(ids, Trigger::Scan).await;
        info!(
            compliant = report.count(OutcomeStatus::Compliant),
            remediated = report.count(OutcomeStatus::Remediated),
            failed = report.count(OutcomeStatus::Failed),
            removed = report.count(OutcomeStatus::Removed),
            coalesced = report.coalesced.len(),
            "Fleet scan finished"
        );
        report
    }

    /// Scan the fleet every `interval` until `shutdown` fires. The first scan
    /// starts immediately.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Periodic scanning stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_full_scan().await;
                }
            }
        }
    }

    /// One pass of the job body, bounded by the worker limit. Returns `None`
    /// if the resource left the fleet before the pass started.
    async fn pass(&self, id: &str, trigger: Trigger) -> Option<OutcomeRecord> {
        let _permit = self.permits.acquire().await.ok()?;
        let (resource, cancel) = self.fleet.lease(id).await?;

        let job_id = Uuid::new_v4();
        let span = info_span!(
            "job",
            %job_id,
            resource_id = %resource.id,
            kind = %resource.kind,
            %trigger
        );
        let record = self
            .execute(job_id, &resource, &cancel, trigger)
            .instrument(span)
            .await;
        self.sink.record(&record).await;
        Some(record)
    }

    async fn execute(
        &self,
        job_id: Uuid,
        resource: &ResourceRef,
        cancel: &CancellationToken,
        trigger: Trigger,
    ) -> OutcomeRecord {
        let outcome = |status, detail: String| {
            OutcomeRecord::new(job_id, resource, trigger, status, detail)
        };

        let observed = match self.executor.observe(resource, cancel).await {
            InspectionResult::Observed { observed, .. } => observed,
            InspectionResult::Failed {
                kind: ErrorKind::NotFound,
                ..
            } => {
                self.fleet.remove(&resource.id).await;
                return outcome(OutcomeStatus::Removed, "resource no longer exists".into())
                    .with_action(Action::Removed)
                    .with_error_kind(ErrorKind::NotFound);
            }
            InspectionResult::Failed {
                attempts,
                kind,
                error,
            } => {
                return outcome(OutcomeStatus::Failed, error)
                    .with_error_kind(kind)
                    .with_attempts(attempts);
            }
            InspectionResult::Cancelled { attempts } => {
                return outcome(OutcomeStatus::Cancelled, "resource left the fleet".into())
                    .with_attempts(attempts);
            }
        };
        self.fleet
            .record(&resource.id, observed.clone(), Utc::now())
            .await;

        let verdict = self.policies.evaluate(resource, &observed);
        if verdict.compliant {
            return outcome(OutcomeStatus::Compliant, verdict.detail).with_compliant_before(true);
        }
        let Some(policy) = self.policies.get(resource.kind) else {
            return outcome(OutcomeStatus::Compliant, verdict.detail).with_compliant_before(true);
        };

        info!(detail = %verdict.detail, "Resource out of compliance, remediating");
        let result = self
            .executor
            .remediate(resource, &policy.desired(), cancel)
            .await;
        let attempts = result.attempts();

        let record = match result {
            RemediationResult::Verified { observed, .. } => {
                self.fleet.record(&resource.id, observed, Utc::now()).await;
                outcome(
                    OutcomeStatus::Remediated,
                    format!("remediated: {}", verdict.detail),
                )
                .with_action(Action::Remediated)
            }
            RemediationResult::Failed {
                kind: ErrorKind::NotFound,
                ..
            } => {
                self.fleet.remove(&resource.id).await;
                outcome(OutcomeStatus::Removed, "resource no longer exists".into())
                    .with_action(Action::Removed)
                    .with_error_kind(ErrorKind::NotFound)
            }
            RemediationResult::Failed { kind, error, .. } => {
                outcome(OutcomeStatus::Failed, error).with_error_kind(kind)
            }
            RemediationResult::Cancelled { .. } => {
                outcome(OutcomeStatus::Cancelled, "resource left the fleet".into())
            }
        };
        record.with_compliant_before(false).with_attempts(attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Policy;
    use warden_cloud::memory::{Fault, InMemoryProvider, Operation};
    use warden_cloud::{ObservedState, ResourceKind};

    fn alb(id: &str) -> ResourceRef {
        ResourceRef::new(id, ResourceKind::ApplicationLoadBalancer)
    }

    fn scheduler(provider: &Arc<InMemoryProvider>, ids: &[&str]) -> Arc<Scheduler> {
        let fleet = Arc::new(Fleet::from_refs(ids.iter().map(|id| alb(id))));
        let policies = PolicySet::new([Policy::web_acl(
            ResourceKind::ApplicationLoadBalancer,
            "waf-default",
        )])
        .unwrap();
        let settings = SchedulerSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(4),
                multiplier: 2.0,
            },
            ..SchedulerSettings::default()
        };
        Arc::new(Scheduler::new(
            fleet,
            Arc::new(policies),
            provider.clone(),
            Arc::new(OutcomeSink::disabled()),
            &settings,
        ))
    }

    #[test]
    fn test_registry_claim_and_release() {
        let registry = InFlightRegistry::new();
        assert!(registry.try_claim("alb-1"));
        assert!(!registry.try_claim("alb-1"));
        assert!(registry.try_claim("alb-2"));

        // The second claim on alb-1 requested a rerun.
        assert!(registry.finish("alb-1"));
        assert!(registry.is_claimed("alb-1"));
        assert!(!registry.finish("alb-1"));
        assert!(!registry.is_claimed("alb-1"));

        registry.release("alb-2");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_claim_guard_releases_on_drop() {
        let registry = InFlightRegistry::new();
        {
            let _claim = ClaimGuard::acquire(&registry, "alb-1").unwrap();
            assert!(ClaimGuard::acquire(&registry, "alb-1").is_none());
        }
        assert!(!registry.is_claimed("alb-1"));
    }

    #[test]
    fn test_refused_claim_keeps_owner() {
        let registry = InFlightRegistry::new();
        let _owner = ClaimGuard::acquire(&registry, "alb-1").unwrap();

        assert!(ClaimGuard::acquire(&registry, "alb-1").is_none());
        assert!(registry.is_claimed("alb-1"));
        assert!(ClaimGuard::acquire(&registry, "alb-1").is_none());

        // Both refusals folded into one pending rerun.
        assert!(registry.finish("alb-1"));
        assert!(!registry.finish("alb-1"));
    }

    #[tokio::test]
    async fn test_compliant_resource_is_left_alone() {
        let provider = Arc::new(
            InMemoryProvider::new().with_resource("alb-1", ObservedState::with_web_acl("waf-default")),
        );
        let scheduler = scheduler(&provider, &["alb-1"]);

        let JobOutcome::Completed(record) = scheduler.run_one("alb-1", Trigger::Manual).await else {
            panic!("job did not run");
        };

        assert_eq!(record.status, OutcomeStatus::Compliant);
        assert_eq!(record.action, Action::None);
        assert_eq!(record.compliant_before, Some(true));
        assert_eq!(provider.call_count("alb-1", Operation::Associate).await, 0);
    }

    #[tokio::test]
    async fn test_non_compliant_resource_is_remediated() {
        let provider = Arc::new(InMemoryProvider::new().with_resource("alb-1", ObservedState::new()));
        let scheduler = scheduler(&provider, &["alb-1"]);

        let JobOutcome::Completed(record) = scheduler.run_one("alb-1", Trigger::Manual).await else {
            panic!("job did not run");
        };

        assert_eq!(record.status, OutcomeStatus::Remediated);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.compliant_before, Some(false));
        let cached = scheduler.fleet().get("alb-1").await.unwrap();
        assert_eq!(cached.observed.unwrap().web_acl_arn(), Some("waf-default"));
    }

    #[tokio::test]
    async fn test_missing_resource_is_removed() {
        let provider = Arc::new(InMemoryProvider::new());
        let scheduler = scheduler(&provider, &["alb-1"]);

        let JobOutcome::Completed(record) = scheduler.run_one("alb-1", Trigger::Scan).await else {
            panic!("job did not run");
        };

        assert_eq!(record.status, OutcomeStatus::Removed);
        assert_eq!(record.action, Action::Removed);
        assert!(!scheduler.fleet().contains("alb-1").await);
        assert_eq!(
            scheduler.run_one("alb-1", Trigger::Scan).await,
            JobOutcome::Unmanaged
        );
    }

    #[tokio::test]
    async fn test_unmanaged_id_is_ignored() {
        let provider = Arc::new(InMemoryProvider::new());
        let scheduler = scheduler(&provider, &[]);

        assert_eq!(
            scheduler.run_one("alb-9", Trigger::Event).await,
            JobOutcome::Unmanaged
        );
        assert_eq!(provider.call_count("alb-9", Operation::Describe).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_abort_scan() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_resource("alb-1", ObservedState::new())
                .with_resource("alb-2", ObservedState::new()),
        );
        provider
            .inject("alb-1", Operation::Associate, Fault::AccessDenied, 1)
            .await;
        let scheduler = scheduler(&provider, &["alb-1", "alb-2"]);

        let report = scheduler
            .run_scan(["alb-1".to_string(), "alb-2".to_string()], Trigger::Scan)
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].status, OutcomeStatus::Failed);
        assert_eq!(
            report.outcomes[0].error_kind,
            Some(ErrorKind::PermissionDenied)
        );
        assert_eq!(report.outcomes[1].status, OutcomeStatus::Remediated);
        assert!(report.has_terminal_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_inspection_is_retried() {
        let provider = Arc::new(InMemoryProvider::new().with_resource("alb-1", ObservedState::new()));
        provider
            .inject("alb-1", Operation::Describe, Fault::Throttled, 1)
            .await;
        let scheduler = scheduler(&provider, &["alb-1"]);

        let JobOutcome::Completed(record) = scheduler.run_one("alb-1", Trigger::Event).await else {
            panic!("job did not run");
        };

        assert_eq!(record.status, OutcomeStatus::Remediated);
        assert!(!record.is_terminal_failure());
        assert_eq!(provider.call_count("alb-1", Operation::Describe).await, 3);
        assert_eq!(
            provider.snapshot("alb-1").await.unwrap().web_acl_arn(),
            Some("waf-default")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_are_coalesced() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_latency(Duration::from_millis(100))
                .with_resource("alb-1", ObservedState::new()),
        );
        let scheduler = scheduler(&provider, &["alb-1"]);

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_one("alb-1", Trigger::Event).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            scheduler.run_one("alb-1", Trigger::Event).await,
            JobOutcome::Coalesced
        );
        assert_eq!(
            scheduler.run_one("alb-1", Trigger::Manual).await,
            JobOutcome::Coalesced
        );

        let JobOutcome::Completed(record) = first.await.unwrap() else {
            panic!("owner did not complete");
        };
        // The coalesced pass found the resource already compliant.
        assert_eq!(record.status, OutcomeStatus::Compliant);
        assert_eq!(provider.call_count("alb-1", Operation::Associate).await, 1);
        assert_eq!(provider.call_count("alb-1", Operation::Describe).await, 3);
        assert_eq!(provider.peak_concurrency("alb-1"), 1);
        assert!(scheduler.registry().is_empty());
    }
}
