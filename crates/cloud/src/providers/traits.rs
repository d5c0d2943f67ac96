//! Resource provider trait and common types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed (connect, reset, client-side timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an unexpected error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// API rejected the request as malformed.
    #[error("Invalid request ({code}): {message}")]
    InvalidRequest { code: String, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource exists but cannot be changed right now.
    #[error("Resource temporarily unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Provider asked us to slow down.
    #[error("Throttled by provider")]
    Throttled { retry_after_secs: Option<u64> },

    /// Authentication or authorization error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Backoff hint sent by the provider, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

// ============================================================================
// Resource types
// ============================================================================

/// Kind of a protectable regional resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Application Load Balancer.
    ApplicationLoadBalancer,
    /// API Gateway REST API stage.
    ApiGatewayStage,
    /// AppSync GraphQL API.
    AppsyncApi,
    /// Cognito user pool.
    CognitoUserPool,
}

impl ResourceKind {
    /// All supported kinds.
    pub const ALL: [Self; 4] = [
        Self::ApplicationLoadBalancer,
        Self::ApiGatewayStage,
        Self::AppsyncApi,
        Self::CognitoUserPool,
    ];

    /// Configuration name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationLoadBalancer => "application_load_balancer",
            Self::ApiGatewayStage => "api_gateway_stage",
            Self::AppsyncApi => "appsync_api",
            Self::CognitoUserPool => "cognito_user_pool",
        }
    }

    /// Infer the kind from a resource ARN.
    ///
    /// Examples:
    /// - `arn:aws:elasticloadbalancing:us-east-1:1:loadbalancer/app/web/50dc` -> ALB
    /// - `arn:aws:apigateway:us-east-1::/restapis/a1b2/stages/prod` -> API stage
    /// - `arn:aws:appsync:us-east-1:1:apis/xyz` -> AppSync
    /// - `arn:aws:cognito-idp:us-east-1:1:userpool/us-east-1_abc` -> Cognito
    #[must_use]
    pub fn from_arn(arn: &str) -> Option<Self> {
        let mut parts = arn.splitn(6, ':');
        if parts.next()? != "arn" {
            return None;
        }
        let _partition = parts.next()?;
        let service = parts.next()?;
        let _region = parts.next()?;
        let _account = parts.next()?;
        let resource = parts.next()?;

        match service {
            "elasticloadbalancing" if resource.starts_with("loadbalancer/app/") => {
                Some(Self::ApplicationLoadBalancer)
            }
            "apigateway" if resource.starts_with("/restapis/") && resource.contains("/stages/") => {
                Some(Self::ApiGatewayStage)
            }
            "appsync" if resource.starts_with("apis/") => Some(Self::AppsyncApi),
            "cognito-idp" if resource.starts_with("userpool/") => Some(Self::CognitoUserPool),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider resource addressed by id and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Provider-assigned identifier (usually an ARN).
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
}

impl ResourceRef {
    /// Create a new resource reference.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Snapshot of a resource's configuration as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservedState {
    attributes: BTreeMap<String, String>,
}

impl ObservedState {
    /// Key holding the ARN of the associated Web ACL.
    pub const WEB_ACL_ARN: &'static str = "web_acl_arn";

    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot with the given Web ACL associated.
    #[must_use]
    pub fn with_web_acl(web_acl_arn: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.insert(Self::WEB_ACL_ARN, web_acl_arn);
        state
    }

    /// ARN of the associated Web ACL, if any.
    #[must_use]
    pub fn web_acl_arn(&self) -> Option<&str> {
        self.get(Self::WEB_ACL_ARN)
    }

    /// Get an attribute.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Set an attribute.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Remove an attribute.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.attributes.remove(key)
    }

    /// Iterate over attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the snapshot has no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Trait for resource providers.
///
/// Implementations must make writes idempotent: associating the Web ACL that is
/// already associated succeeds without changing anything.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Read the current configuration of a resource.
    async fn describe(&self, resource: &ResourceRef) -> Result<ObservedState, ProviderError>;

    /// Associate a Web ACL with a resource.
    async fn associate_web_acl(
        &self,
        resource: &ResourceRef,
        web_acl_arn: &str,
    ) -> Result<(), ProviderError>;

    /// Remove any Web ACL association from a resource.
    async fn disassociate_web_acl(&self, resource: &ResourceRef) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_arn() {
        assert_eq!(
            ResourceKind::from_arn(
                "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/50dc6c495c0c9188"
            ),
            Some(ResourceKind::ApplicationLoadBalancer)
        );
        assert_eq!(
            ResourceKind::from_arn("arn:aws:apigateway:us-east-1::/restapis/a1b2c3/stages/prod"),
            Some(ResourceKind::ApiGatewayStage)
        );
        assert_eq!(
            ResourceKind::from_arn("arn:aws:appsync:eu-west-1:123456789012:apis/abcdef"),
            Some(ResourceKind::AppsyncApi)
        );
        assert_eq!(
            ResourceKind::from_arn(
                "arn:aws:cognito-idp:us-east-1:123456789012:userpool/us-east-1_AbCdEf"
            ),
            Some(ResourceKind::CognitoUserPool)
        );
    }

    #[test]
    fn test_kind_from_arn_rejects_unknown() {
        // Network load balancers cannot carry a Web ACL
        assert_eq!(
            ResourceKind::from_arn(
                "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/net/nlb/1"
            ),
            None
        );
        assert_eq!(ResourceKind::from_arn("alb-1"), None);
        assert_eq!(ResourceKind::from_arn("arn:aws:s3:::bucket"), None);
    }

    #[test]
    fn test_kind_serde_names() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_observed_state_web_acl() {
        let mut state = ObservedState::new();
        assert!(state.is_empty());
        assert_eq!(state.web_acl_arn(), None);

        state.insert(ObservedState::WEB_ACL_ARN, "waf-default");
        assert_eq!(state.web_acl_arn(), Some("waf-default"));

        state.remove(ObservedState::WEB_ACL_ARN);
        assert_eq!(state, ObservedState::new());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ProviderError::Throttled {
            retry_after_secs: Some(3),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ProviderError::NotFound("x".into()).retry_after(), None);
    }
}
