//! Resource inspection.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use warden_cloud::{ObservedState, ResourceProvider, ResourceRef};

use crate::error::ReconcileError;

/// Reads a resource's current configuration from the provider.
///
/// Inspection has no side effects. Every call runs under the configured
/// deadline; an elapsed deadline is reported as a transient failure.
#[derive(Clone)]
pub struct Inspector {
    provider: Arc<dyn ResourceProvider>,
    timeout: Duration,
}

impl Inspector {
    #[must_use]
    pub fn new(provider: Arc<dyn ResourceProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch the current state of `resource`.
    ///
    /// # Errors
    /// Returns the classified provider error, or a transient
    /// [`ReconcileError::Timeout`] when the deadline elapses.
    pub async fn inspect(&self, resource: &ResourceRef) -> Result<ObservedState, ReconcileError> {
        debug!(
            resource_id = %resource.id,
            provider = self.provider.name(),
            "Inspecting resource"
        );

        match tokio::time::timeout(self.timeout, self.provider.describe(resource)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ReconcileError::Timeout {
                operation: "inspect",
                timeout: self.timeout,
            }),
        }
    }
}

impl std::fmt::Debug for Inspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inspector")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use warden_cloud::memory::{Fault, InMemoryProvider, Operation};
    use warden_cloud::ResourceKind;

    fn alb() -> ResourceRef {
        ResourceRef::new("alb-1", ResourceKind::ApplicationLoadBalancer)
    }

    #[tokio::test]
    async fn test_inspect_returns_observed_state() {
        let provider = Arc::new(
            InMemoryProvider::new().with_resource("alb-1", ObservedState::with_web_acl("waf")),
        );
        let inspector = Inspector::new(provider, Duration::from_secs(1));

        let observed = inspector.inspect(&alb()).await.unwrap();
        assert_eq!(observed.web_acl_arn(), Some("waf"));
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let inspector = Inspector::new(Arc::new(InMemoryProvider::new()), Duration::from_secs(1));

        let err = inspector.inspect(&alb()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_is_transient() {
        let provider = Arc::new(InMemoryProvider::new().with_resource("alb-1", ObservedState::new()));
        provider
            .inject(
                "alb-1",
                Operation::Describe,
                Fault::Hang(Duration::from_secs(60)),
                1,
            )
            .await;
        let inspector = Inspector::new(provider, Duration::from_secs(5));

        let err = inspector.inspect(&alb()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_denied_access_is_permission_denied() {
        let provider = Arc::new(InMemoryProvider::new().with_resource("alb-1", ObservedState::new()));
        provider
            .inject("alb-1", Operation::Describe, Fault::AccessDenied, 1)
            .await;
        let inspector = Inspector::new(provider, Duration::from_secs(1));

        let err = inspector.inspect(&alb()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
