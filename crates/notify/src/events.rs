//! Notification event types for remediation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How urgently an operator should look at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The fleet changed without operator input
    Warning,
    /// A resource is out of compliance and will stay that way
    Critical,
}

impl Severity {
    /// Slack emoji shortcode shown next to the title.
    #[must_use]
    pub const fn emoji(&self) -> &'static str {
        match self {
            Self::Warning => ":warning:",
            Self::Critical => ":rotating_light:",
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Reconciliation outcomes worth telling a human about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A remediation gave up
    RemediationFailed {
        resource_id: String,
        kind: String,
        error_kind: String,
        attempts: u32,
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A resource no longer exists and left the fleet
    ResourceRemoved {
        resource_id: String,
        kind: String,
        reason: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::ResourceRemoved { .. } => Severity::Warning,
            Self::RemediationFailed { .. } => Severity::Critical,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::RemediationFailed { timestamp, .. }
            | Self::ResourceRemoved { timestamp, .. } => timestamp,
        }
    }

    /// Id of the resource the event is about.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::RemediationFailed { resource_id, .. }
            | Self::ResourceRemoved { resource_id, .. } => resource_id,
        }
    }

    /// One-line summary.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RemediationFailed { resource_id, .. } => {
                format!("Remediation Failed: {resource_id}")
            }
            Self::ResourceRemoved { resource_id, .. } => {
                format!("Resource Removed: {resource_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = NotifyEvent::RemediationFailed {
            resource_id: "alb-1".to_string(),
            kind: "application_load_balancer".to_string(),
            error_kind: "permission_denied".to_string(),
            attempts: 1,
            message: "access denied".to_string(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "remediation_failed");
        assert_eq!(json["error_kind"], "permission_denied");
    }

    #[test]
    fn test_timestamp_defaults_when_missing() {
        let event: NotifyEvent = serde_json::from_str(
            r#"{"type":"resource_removed","resource_id":"alb-1","kind":"application_load_balancer","reason":"not found"}"#,
        )
        .unwrap();
        assert_eq!(event.resource_id(), "alb-1");
        assert_eq!(event.severity(), Severity::Warning);
    }
}
