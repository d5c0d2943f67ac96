//! In-memory provider implementation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex as SyncMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::providers::traits::{ObservedState, ProviderError, ResourceProvider, ResourceRef};

/// Provider operation, used to target injected faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `describe`
    Describe,
    /// `associate_web_acl`
    Associate,
    /// `disassociate_web_acl`
    Disassociate,
}

/// A failure to return instead of performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Server-side error (5xx).
    ServerError,
    /// Provider throttled the call.
    Throttled,
    /// Call took longer than the given duration, then failed.
    Hang(Duration),
    /// Credentials lack permission.
    AccessDenied,
    /// Resource does not exist.
    NotFound,
}

impl Fault {
    fn into_error(self, resource_id: &str) -> ProviderError {
        match self {
            Self::ServerError => ProviderError::Api {
                status: 500,
                message: "injected server error".to_string(),
            },
            Self::Throttled => ProviderError::Throttled {
                retry_after_secs: None,
            },
            Self::Hang(d) => ProviderError::Timeout(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            Self::AccessDenied => ProviderError::Auth(format!("access denied for {resource_id}")),
            Self::NotFound => ProviderError::NotFound(resource_id.to_string()),
        }
    }
}

/// On-disk fixture layout.
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    resources: BTreeMap<String, ObservedState>,
}

/// Concurrency bookkeeping for one resource.
#[derive(Debug, Default, Clone, Copy)]
struct Occupancy {
    current: usize,
    peak: usize,
}

/// Marks one call as in flight until dropped, including when the caller
/// abandons the call future.
struct InFlight<'a> {
    occupancy: &'a SyncMutex<HashMap<String, Occupancy>>,
    resource_id: String,
}

impl<'a> InFlight<'a> {
    fn enter(occupancy: &'a SyncMutex<HashMap<String, Occupancy>>, resource_id: &str) -> Self {
        let mut map = occupancy.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(resource_id.to_string()).or_default();
        entry.current += 1;
        entry.peak = entry.peak.max(entry.current);
        Self {
            occupancy,
            resource_id: resource_id.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.occupancy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&self.resource_id) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

/// In-memory resource provider.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    /// Current state per resource id.
    resources: Mutex<HashMap<String, ObservedState>>,
    /// Queued faults per (resource id, operation).
    faults: Mutex<HashMap<(String, Operation), VecDeque<Fault>>>,
    /// Call counters per (resource id, operation).
    calls: Mutex<HashMap<(String, Operation), usize>>,
    /// Concurrent calls per resource id.
    occupancy: SyncMutex<HashMap<String, Occupancy>>,
    /// Artificial latency added to every call.
    latency: Duration,
}

impl InMemoryProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add artificial latency to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a resource with the given state.
    #[must_use]
    pub fn with_resource(mut self, id: impl Into<String>, state: ObservedState) -> Self {
        self.resources.get_mut().insert(id.into(), state);
        self
    }

    /// Load resources from a YAML fixture file.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] if the file cannot be read or parsed.
    pub async fn from_fixture(path: &Path) -> Result<Self, ProviderError> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| ProviderError::Config(format!("Failed to read fixture: {e}")))?;

        let fixture: Fixture = serde_yaml::from_str(&contents)
            .map_err(|e| ProviderError::Config(format!("Failed to parse fixture: {e}")))?;

        info!(
            path = %path.display(),
            resources = fixture.resources.len(),
            "Loaded in-memory provider fixture"
        );

        let mut provider = Self::new();
        provider
            .resources
            .get_mut()
            .extend(fixture.resources);
        Ok(provider)
    }

    /// Insert or replace a resource.
    pub async fn put(&self, id: impl Into<String>, state: ObservedState) {
        self.resources.lock().await.insert(id.into(), state);
    }

    /// Delete a resource, as if it was removed out of band.
    pub async fn delete(&self, id: &str) -> Option<ObservedState> {
        self.resources.lock().await.remove(id)
    }

    /// Current state of a resource.
    pub async fn snapshot(&self, id: &str) -> Option<ObservedState> {
        self.resources.lock().await.get(id).cloned()
    }

    /// Queue `times` faults for the next calls of `op` on `resource_id`.
    pub async fn inject(&self, resource_id: &str, op: Operation, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().await;
        let queue = faults
            .entry((resource_id.to_string(), op))
            .or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    /// Number of calls of `op` made for `resource_id`.
    pub async fn call_count(&self, resource_id: &str, op: Operation) -> usize {
        self.calls
            .lock()
            .await
            .get(&(resource_id.to_string(), op))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous calls seen for `resource_id`.
    #[must_use]
    pub fn peak_concurrency(&self, resource_id: &str) -> usize {
        self.occupancy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .map_or(0, |o| o.peak)
    }

    /// Common prologue: count, track concurrency, wait, maybe fail. The
    /// returned guard keeps the call in flight.
    async fn enter(&self, resource_id: &str, op: Operation) -> Result<InFlight<'_>, ProviderError> {
        *self
            .calls
            .lock()
            .await
            .entry((resource_id.to_string(), op))
            .or_default() += 1;

        let in_flight = InFlight::enter(&self.occupancy, resource_id);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let fault = self
            .faults
            .lock()
            .await
            .get_mut(&(resource_id.to_string(), op))
            .and_then(VecDeque::pop_front);

        if let Some(fault) = fault {
            if let Fault::Hang(d) = fault {
                tokio::time::sleep(d).await;
            }
            debug!(resource_id = %resource_id, ?op, ?fault, "Injected fault");
            return Err(fault.into_error(resource_id));
        }

        Ok(in_flight)
    }
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn describe(&self, resource: &ResourceRef) -> Result<ObservedState, ProviderError> {
        let _call = self.enter(&resource.id, Operation::Describe).await?;
        self.resources
            .lock()
            .await
            .get(&resource.id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(resource.id.clone()))
    }

    async fn associate_web_acl(
        &self,
        resource: &ResourceRef,
        web_acl_arn: &str,
    ) -> Result<(), ProviderError> {
        let _call = self.enter(&resource.id, Operation::Associate).await?;
        match self.resources.lock().await.get_mut(&resource.id) {
            Some(state) => {
                state.insert(ObservedState::WEB_ACL_ARN, web_acl_arn);
                Ok(())
            }
            None => Err(ProviderError::NotFound(resource.id.clone())),
        }
    }

    async fn disassociate_web_acl(&self, resource: &ResourceRef) -> Result<(), ProviderError> {
        let _call = self.enter(&resource.id, Operation::Disassociate).await?;
        match self.resources.lock().await.get_mut(&resource.id) {
            Some(state) => {
                state.remove(ObservedState::WEB_ACL_ARN);
                Ok(())
            }
            None => Err(ProviderError::NotFound(resource.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::traits::ResourceKind;
    use std::io::Write;
    use std::sync::Arc;

    fn alb(id: &str) -> ResourceRef {
        ResourceRef::new(id, ResourceKind::ApplicationLoadBalancer)
    }

    #[tokio::test]
    async fn test_associate_is_idempotent() {
        let provider = InMemoryProvider::new().with_resource("alb-1", ObservedState::new());

        provider.associate_web_acl(&alb("alb-1"), "waf-default").await.unwrap();
        let once = provider.snapshot("alb-1").await.unwrap();
        provider.associate_web_acl(&alb("alb-1"), "waf-default").await.unwrap();
        let twice = provider.snapshot("alb-1").await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.web_acl_arn(), Some("waf-default"));
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider.describe(&alb("ghost")).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let provider = InMemoryProvider::new().with_resource("alb-1", ObservedState::new());
        provider
            .inject("alb-1", Operation::Describe, Fault::ServerError, 2)
            .await;

        assert!(provider.describe(&alb("alb-1")).await.is_err());
        assert!(provider.describe(&alb("alb-1")).await.is_err());
        assert!(provider.describe(&alb("alb-1")).await.is_ok());
        assert_eq!(provider.call_count("alb-1", Operation::Describe).await, 3);
    }

    #[tokio::test]
    async fn test_disassociate_removes_association() {
        let provider =
            InMemoryProvider::new().with_resource("alb-1", ObservedState::with_web_acl("waf"));
        provider.disassociate_web_acl(&alb("alb-1")).await.unwrap();
        assert_eq!(provider.snapshot("alb-1").await.unwrap().web_acl_arn(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peak_concurrency_tracking() {
        let provider = Arc::new(
            InMemoryProvider::new()
                .with_latency(Duration::from_millis(50))
                .with_resource("alb-1", ObservedState::new()),
        );

        let a = {
            let p = Arc::clone(&provider);
            tokio::spawn(async move { p.describe(&alb("alb-1")).await })
        };
        let b = {
            let p = Arc::clone(&provider);
            tokio::spawn(async move { p.describe(&alb("alb-1")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(provider.peak_concurrency("alb-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_call_leaves_no_occupancy() {
        let provider = InMemoryProvider::new().with_resource("alb-1", ObservedState::new());
        provider
            .inject(
                "alb-1",
                Operation::Describe,
                Fault::Hang(Duration::from_secs(60)),
                1,
            )
            .await;

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), provider.describe(&alb("alb-1"))).await;
        assert!(abandoned.is_err());

        provider.describe(&alb("alb-1")).await.unwrap();
        assert_eq!(provider.peak_concurrency("alb-1"), 1);
    }

    #[tokio::test]
    async fn test_from_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "resources:\n  alb-1: {{}}\n  alb-2:\n    web_acl_arn: waf-default\n"
        )
        .unwrap();

        let provider = InMemoryProvider::from_fixture(file.path()).await.unwrap();
        assert!(provider.snapshot("alb-1").await.unwrap().is_empty());
        assert_eq!(
            provider.snapshot("alb-2").await.unwrap().web_acl_arn(),
            Some("waf-default")
        );
    }
}
