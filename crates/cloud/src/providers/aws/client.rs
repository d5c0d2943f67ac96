//! AWS WAFv2 API client implementation.
//!
//! Speaks the JSON 1.1 protocol (`POST /` with an `X-Amz-Target` header) and
//! signs every request with SigV4.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{
    AssociateWebAclRequest, AwsErrorBody, DisassociateWebAclRequest, EmptyResponse,
    GetWebAclForResourceRequest, GetWebAclForResourceResponse,
};
use super::sigv4::{self, Credentials, SigningRequest};
use crate::providers::traits::{
    ObservedState, ProviderError, ResourceProvider, ResourceRef,
};
use crate::throttle::Throttle;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Signing name of the service.
const SERVICE: &str = "wafv2";

/// Target prefix of the 2019-07-29 API version.
const TARGET_PREFIX: &str = "AWSWAF_20190729";

/// Extra keys reported in the observed state.
const WEB_ACL_NAME: &str = "web_acl_name";
const WEB_ACL_ID: &str = "web_acl_id";

/// AWS WAFv2 provider.
#[derive(Clone)]
pub struct Wafv2 {
    /// HTTP client.
    client: Client,
    /// Signing credentials.
    credentials: Credentials,
    /// AWS region.
    region: String,
    /// API endpoint.
    endpoint: Url,
    /// Client-side request pacing.
    throttle: Arc<Throttle>,
}

impl Wafv2 {
    /// Create a new WAFv2 provider.
    ///
    /// # Arguments
    /// * `credentials` - AWS credentials
    /// * `region` - AWS region (e.g., "us-east-1")
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created or the region is invalid.
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Result<Self, ProviderError> {
        let region = region.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ProviderError::Http)?;

        let endpoint = Url::parse(&format!("https://wafv2.{region}.amazonaws.com/"))
            .map_err(|e| ProviderError::Config(format!("Invalid region '{region}': {e}")))?;

        Ok(Self {
            client,
            credentials,
            region,
            endpoint,
            throttle: Arc::new(Throttle::unlimited()),
        })
    }

    /// Override the API endpoint (VPC endpoints, local test servers).
    ///
    /// # Errors
    /// Returns error if the URL cannot be parsed.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self, ProviderError> {
        self.endpoint = Url::parse(endpoint)
            .map_err(|e| ProviderError::Config(format!("Invalid endpoint '{endpoint}': {e}")))?;
        Ok(self)
    }

    /// Share a request throttle with this client.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// AWS region of this client.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// `Host` header value of the endpoint, port included when non-default.
    fn host_header(&self) -> Result<String, ProviderError> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| ProviderError::Config("Endpoint has no host".to_string()))?;
        Ok(match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Sign and execute a WAFv2 API call.
    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        body: &impl serde::Serialize,
    ) -> Result<T, ProviderError> {
        let target = format!("{TARGET_PREFIX}.{action}");
        let payload = serde_json::to_vec(body)?;
        let host = self.host_header()?;

        self.throttle.acquire().await;

        let signed = sigv4::sign(
            &self.credentials,
            &SigningRequest {
                host: &host,
                region: &self.region,
                service: SERVICE,
                target: &target,
                body: &payload,
                timestamp: chrono::Utc::now(),
            },
        )?;

        debug!(action = %action, endpoint = %self.endpoint, "WAFv2 request");

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", sigv4::CONTENT_TYPE)
            .header("X-Amz-Target", &target)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization);

        if let Some(token) = &signed.security_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request.body(payload).send().await?;
        self.handle_response(action, response).await
    }

    /// Handle API response.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        action: &str,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await?;

        if status.is_success() {
            let text = if text.trim().is_empty() { "{}" } else { &text };
            return serde_json::from_str(text).map_err(|e| {
                warn!(action = %action, error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            });
        }

        let body: AwsErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let err = Self::map_error(status, &body, retry_after_secs, &text);

        if let ProviderError::Throttled { retry_after_secs } = &err {
            let delay = Duration::from_secs(retry_after_secs.unwrap_or(1));
            self.throttle.penalize(delay).await;
        }

        debug!(action = %action, status = status.as_u16(), error = %err, "WAFv2 error response");
        Err(err)
    }

    /// Map an error response onto the provider error taxonomy.
    fn map_error(
        status: StatusCode,
        body: &AwsErrorBody,
        retry_after_secs: Option<u64>,
        raw: &str,
    ) -> ProviderError {
        let code = body.code();
        let message = body.message.clone().unwrap_or_else(|| raw.to_string());

        match code {
            "WAFNonexistentItemException" => ProviderError::NotFound(message),
            "WAFUnavailableEntityException" => ProviderError::Unavailable(message),
            "ThrottlingException" | "TooManyRequestsException" => {
                ProviderError::Throttled { retry_after_secs }
            }
            "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException" => ProviderError::Auth(message),
            _ if status == StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::Throttled { retry_after_secs }
            }
            _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                ProviderError::Auth(message)
            }
            _ if status.is_server_error() => ProviderError::Api {
                status: status.as_u16(),
                message,
            },
            _ => ProviderError::InvalidRequest {
                code: if code.is_empty() {
                    status.as_u16().to_string()
                } else {
                    code.to_string()
                },
                message,
            },
        }
    }
}

impl std::fmt::Debug for Wafv2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wafv2")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceProvider for Wafv2 {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn describe(&self, resource: &ResourceRef) -> Result<ObservedState, ProviderError> {
        let response: GetWebAclForResourceResponse = self
            .call(
                "GetWebACLForResource",
                &GetWebAclForResourceRequest {
                    resource_arn: &resource.id,
                },
            )
            .await?;

        let mut state = ObservedState::new();
        if let Some(acl) = response.web_acl {
            state.insert(ObservedState::WEB_ACL_ARN, acl.arn);
            state.insert(WEB_ACL_NAME, acl.name);
            state.insert(WEB_ACL_ID, acl.id);
        }

        debug!(
            resource_id = %resource.id,
            web_acl_arn = state.web_acl_arn().unwrap_or("<none>"),
            "Described resource"
        );
        Ok(state)
    }

    async fn associate_web_acl(
        &self,
        resource: &ResourceRef,
        web_acl_arn: &str,
    ) -> Result<(), ProviderError> {
        info!(resource_id = %resource.id, web_acl_arn = %web_acl_arn, "Associating Web ACL");

        let _: EmptyResponse = self
            .call(
                "AssociateWebACL",
                &AssociateWebAclRequest {
                    web_acl_arn,
                    resource_arn: &resource.id,
                },
            )
            .await?;

        Ok(())
    }

    async fn disassociate_web_acl(&self, resource: &ResourceRef) -> Result<(), ProviderError> {
        info!(resource_id = %resource.id, "Disassociating Web ACL");

        let _: EmptyResponse = self
            .call(
                "DisassociateWebACL",
                &DisassociateWebAclRequest {
                    resource_arn: &resource.id,
                },
            )
            .await?;

        Ok(())
    }
}
