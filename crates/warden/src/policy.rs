//! Compliance policies and their evaluation.
//!
//! A [`Policy`] states what a resource of one kind must look like. Policies are
//! loaded once, validated, and never change afterwards. Evaluation is a pure
//! comparison of a policy against an [`ObservedState`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_cloud::{ObservedState, ResourceKind, ResourceRef};

/// Shape of a regional WAFv2 Web ACL ARN.
static WEB_ACL_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:wafv2:[a-z0-9-]+:\d{12}:regional/webacl/[\w-]+/[\w-]+$")
        .expect("valid Web ACL ARN pattern")
});

/// Errors raised when loading policies.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Two policies target the same resource kind.
    #[error("duplicate policy for kind {0}")]
    DuplicateKind(ResourceKind),

    /// The required Web ACL is not usable.
    #[error("invalid web_acl_arn for {kind}: {reason}")]
    InvalidWebAclArn { kind: ResourceKind, reason: String },
}

/// Declared compliance rule for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    ApplicationLoadBalancer { web_acl_arn: String },
    ApiGatewayStage { web_acl_arn: String },
    AppsyncApi { web_acl_arn: String },
    CognitoUserPool { web_acl_arn: String },
}

impl Policy {
    /// Policy requiring `web_acl_arn` on resources of `kind`.
    #[must_use]
    pub fn web_acl(kind: ResourceKind, web_acl_arn: impl Into<String>) -> Self {
        let web_acl_arn = web_acl_arn.into();
        match kind {
            ResourceKind::ApplicationLoadBalancer => Self::ApplicationLoadBalancer { web_acl_arn },
            ResourceKind::ApiGatewayStage => Self::ApiGatewayStage { web_acl_arn },
            ResourceKind::AppsyncApi => Self::AppsyncApi { web_acl_arn },
            ResourceKind::CognitoUserPool => Self::CognitoUserPool { web_acl_arn },
        }
    }

    /// Resource kind this policy applies to.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::ApplicationLoadBalancer { .. } => ResourceKind::ApplicationLoadBalancer,
            Self::ApiGatewayStage { .. } => ResourceKind::ApiGatewayStage,
            Self::AppsyncApi { .. } => ResourceKind::AppsyncApi,
            Self::CognitoUserPool { .. } => ResourceKind::CognitoUserPool,
        }
    }

    /// Web ACL that must be associated.
    #[must_use]
    pub fn web_acl_arn(&self) -> &str {
        match self {
            Self::ApplicationLoadBalancer { web_acl_arn }
            | Self::ApiGatewayStage { web_acl_arn }
            | Self::AppsyncApi { web_acl_arn }
            | Self::CognitoUserPool { web_acl_arn } => web_acl_arn,
        }
    }

    /// Corrective target for a non-compliant resource.
    #[must_use]
    pub fn desired(&self) -> DesiredState {
        DesiredState::WebAclAssociated {
            web_acl_arn: self.web_acl_arn().to_string(),
        }
    }

    /// Check the policy's fields.
    ///
    /// # Errors
    /// Returns [`PolicyError::InvalidWebAclArn`] if the ARN is empty, contains
    /// whitespace, or looks like an ARN but is not a regional Web ACL ARN.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let arn = self.web_acl_arn();
        let invalid = |reason: &str| PolicyError::InvalidWebAclArn {
            kind: self.kind(),
            reason: reason.to_string(),
        };

        if arn.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if arn.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }
        if arn.starts_with("arn:") && !WEB_ACL_ARN.is_match(arn) {
            return Err(invalid(&format!("{arn} is not a regional WAFv2 Web ACL ARN")));
        }
        Ok(())
    }
}

/// Target configuration the executor drives a resource towards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DesiredState {
    /// The given Web ACL is associated with the resource.
    WebAclAssociated { web_acl_arn: String },
}

impl DesiredState {
    /// Compare an observed state against this target.
    #[must_use]
    pub fn check(&self, resource_id: &str, observed: &ObservedState) -> ComplianceVerdict {
        match self {
            Self::WebAclAssociated { web_acl_arn } => {
                let (compliant, detail) = match observed.web_acl_arn() {
                    Some(actual) if actual == web_acl_arn => {
                        (true, format!("web ACL {actual} associated"))
                    }
                    Some(actual) => (
                        false,
                        format!("web ACL {actual} associated, expected {web_acl_arn}"),
                    ),
                    None => (
                        false,
                        format!("no web ACL associated, expected {web_acl_arn}"),
                    ),
                };
                ComplianceVerdict {
                    resource_id: resource_id.to_string(),
                    compliant,
                    detail,
                }
            }
        }
    }
}

/// Result of one evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceVerdict {
    pub resource_id: String,
    pub compliant: bool,
    pub detail: String,
}

/// Evaluate `observed` against `policy`.
#[must_use]
pub fn evaluate(resource_id: &str, policy: &Policy, observed: &ObservedState) -> ComplianceVerdict {
    policy.desired().check(resource_id, observed)
}

/// Validated policies, at most one per kind.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    by_kind: BTreeMap<ResourceKind, Policy>,
}

impl PolicySet {
    /// Build a set from loaded policies.
    ///
    /// # Errors
    /// Returns the first invalid policy or duplicated kind.
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Result<Self, PolicyError> {
        let mut by_kind = BTreeMap::new();
        for policy in policies {
            policy.validate()?;
            let kind = policy.kind();
            if by_kind.insert(kind, policy).is_some() {
                return Err(PolicyError::DuplicateKind(kind));
            }
        }
        Ok(Self { by_kind })
    }

    /// Policy for a kind.
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> Option<&Policy> {
        self.by_kind.get(&kind)
    }

    /// Evaluate a resource against the policy for its kind.
    ///
    /// A kind without a policy has nothing to enforce and is compliant.
    #[must_use]
    pub fn evaluate(&self, resource: &ResourceRef, observed: &ObservedState) -> ComplianceVerdict {
        match self.get(resource.kind) {
            Some(policy) => evaluate(&resource.id, policy, observed),
            None => ComplianceVerdict {
                resource_id: resource.id.clone(),
                compliant: true,
                detail: "no policy for kind".to_string(),
            },
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.by_kind.values()
    }
}
