//! AWS WAFv2 API request and response models.

use serde::{Deserialize, Serialize};

/// `GetWebACLForResource` request.
#[derive(Debug, Serialize)]
pub struct GetWebAclForResourceRequest<'a> {
    /// ARN of the protected resource.
    #[serde(rename = "ResourceArn")]
    pub resource_arn: &'a str,
}

/// `GetWebACLForResource` response.
#[derive(Debug, Default, Deserialize)]
pub struct GetWebAclForResourceResponse {
    /// Associated Web ACL, absent when nothing is associated.
    #[serde(rename = "WebACL", default)]
    pub web_acl: Option<WebAcl>,
}

/// Web ACL summary as returned by WAFv2.
#[derive(Debug, Clone, Deserialize)]
pub struct WebAcl {
    /// Web ACL name.
    #[serde(rename = "Name")]
    pub name: String,
    /// Web ACL id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Web ACL ARN.
    #[serde(rename = "ARN")]
    pub arn: String,
}

/// `AssociateWebACL` request.
#[derive(Debug, Serialize)]
pub struct AssociateWebAclRequest<'a> {
    /// ARN of the Web ACL to associate.
    #[serde(rename = "WebACLArn")]
    pub web_acl_arn: &'a str,
    /// ARN of the protected resource.
    #[serde(rename = "ResourceArn")]
    pub resource_arn: &'a str,
}

/// `DisassociateWebACL` request.
#[derive(Debug, Serialize)]
pub struct DisassociateWebAclRequest<'a> {
    /// ARN of the protected resource.
    #[serde(rename = "ResourceArn")]
    pub resource_arn: &'a str,
}

/// Empty success body.
#[derive(Debug, Default, Deserialize)]
pub struct EmptyResponse {}

/// Error body of the AWS JSON protocol.
#[derive(Debug, Default, Deserialize)]
pub struct AwsErrorBody {
    /// Error type, possibly namespaced (`com.amazon...#ThrottlingException`).
    #[serde(rename = "__type", default)]
    pub error_type: Option<String>,
    /// Human-readable message (casing varies by service).
    #[serde(rename = "message", alias = "Message", default)]
    pub message: Option<String>,
}

impl AwsErrorBody {
    /// Error code without its namespace prefix.
    #[must_use]
    pub fn code(&self) -> &str {
        self.error_type
            .as_deref()
            .map_or("", |t| t.rsplit('#').next().unwrap_or(t))
    }
}
