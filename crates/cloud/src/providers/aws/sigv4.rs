//! AWS Signature Version 4 for the JSON 1.1 protocol.
//!
//! Only what the WAFv2 client needs: `POST /` with an empty query string and a
//! fixed set of signed headers.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::providers::traits::ProviderError;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable for the access key id.
const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable for the secret access key.
const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
/// Environment variable for the session token.
const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Content type of the AWS JSON 1.1 protocol.
pub const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Static AWS credentials.
#[derive(Clone)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl Credentials {
    /// Create credentials from a key pair.
    #[must_use]
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Attach a session token.
    #[must_use]
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Read credentials from the standard environment variables.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] if the key pair is not set.
    pub fn from_env() -> Result<Self, ProviderError> {
        let access_key_id = std::env::var(ENV_ACCESS_KEY_ID)
            .map_err(|_| ProviderError::Config(format!("{ENV_ACCESS_KEY_ID} not set")))?;
        let secret_access_key = std::env::var(ENV_SECRET_ACCESS_KEY)
            .map_err(|_| ProviderError::Config(format!("{ENV_SECRET_ACCESS_KEY} not set")))?;

        let mut creds = Self::new(access_key_id, secret_access_key);
        if let Ok(token) = std::env::var(ENV_SESSION_TOKEN) {
            if !token.is_empty() {
                creds.session_token = Some(token);
            }
        }
        Ok(creds)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Inputs to a signature.
pub struct SigningRequest<'a> {
    /// Value of the `Host` header (with port if non-default).
    pub host: &'a str,
    /// AWS region.
    pub region: &'a str,
    /// Signing service name (e.g. `wafv2`).
    pub service: &'a str,
    /// Value of the `X-Amz-Target` header.
    pub target: &'a str,
    /// Request body.
    pub body: &'a [u8],
    /// Signing time.
    pub timestamp: DateTime<Utc>,
}

/// Headers to add to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// `X-Amz-Date` value.
    pub amz_date: String,
    /// `X-Amz-Security-Token` value, if temporary credentials are used.
    pub security_token: Option<String>,
    /// `Authorization` value.
    pub authorization: String,
}

/// Sign a JSON 1.1 `POST /` request.
///
/// # Errors
/// Returns [`ProviderError::Config`] if a signing key cannot be derived.
pub fn sign(creds: &Credentials, req: &SigningRequest<'_>) -> Result<SignedHeaders, ProviderError> {
    let amz_date = req.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = req.timestamp.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{}/aws4_request", req.region, req.service);

    // Canonical headers must be sorted by lowercase name
    let mut headers: Vec<(&str, &str)> = vec![
        ("content-type", CONTENT_TYPE),
        ("host", req.host),
        ("x-amz-date", amz_date.as_str()),
        ("x-amz-target", req.target),
    ];
    if let Some(token) = creds.session_token.as_deref() {
        headers.push(("x-amz-security-token", token));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
        hex::encode(Sha256::digest(req.body))
    );

    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", creds.secret_access_key).as_bytes(),
        date.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, req.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, req.service.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        amz_date,
        security_token: creds.session_token.clone(),
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        ),
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Err(ProviderError::Config("invalid signing key".to_string()));
    };
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(body: &[u8]) -> SigningRequest<'_> {
        SigningRequest {
            host: "wafv2.us-east-1.amazonaws.com",
            region: "us-east-1",
            service: "wafv2",
            target: "AWSWAF_20190729.GetWebACLForResource",
            body,
            timestamp: Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap(),
        }
    }

    #[test]
    fn test_known_signature() {
        let creds = Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        );
        let body = br#"{"ResourceArn":"arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/1"}"#;

        let signed = sign(&creds, &request(body)).unwrap();

        assert_eq!(signed.amz_date, "20150830T123600Z");
        assert_eq!(signed.security_token, None);
        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/wafv2/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date;x-amz-target, \
             Signature=fb302a72fba70c0223f73b97a5d4016f6220afe03ed41dea11859578a97a637d"
        );
    }

    #[test]
    fn test_session_token_is_signed() {
        let creds = Credentials::new("AKIDEXAMPLE", "secret").with_session_token("token");
        let signed = sign(&creds, &request(b"{}")).unwrap();

        assert_eq!(signed.security_token.as_deref(), Some("token"));
        assert!(signed.authorization.contains(
            "SignedHeaders=content-type;host;x-amz-date;x-amz-security-token;x-amz-target"
        ));
    }

    #[test]
    fn test_signature_depends_on_body() {
        let creds = Credentials::new("AKIDEXAMPLE", "secret");
        let a = sign(&creds, &request(b"{}")).unwrap();
        let b = sign(&creds, &request(b"{\"a\":1}")).unwrap();
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::new("AKIDEXAMPLE", "super-secret").with_session_token("tok");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("tok\""));
        assert!(debug.contains("AKIDEXAMPLE"));
    }
}
