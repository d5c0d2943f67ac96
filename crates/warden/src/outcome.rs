//! Job outcome records.
//!
//! Every reconciliation job produces exactly one [`OutcomeRecord`]. The
//! [`OutcomeSink`] logs it, appends it to the JSON Lines audit file when one
//! is configured, and raises notifications for outcomes that need an
//! operator.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;
use warden_cloud::{ResourceKind, ResourceRef};
use warden_notify::{Notifier, NotifyEvent};

use crate::error::ErrorKind;

/// What started a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scan,
    Event,
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Scan => "scan",
            Self::Event => "event",
            Self::Manual => "manual",
        })
    }
}

/// Change the job made to the resource or the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Remediated,
    Removed,
}

/// How the job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Already compliant, nothing to do
    Compliant,
    /// Brought back into compliance
    Remediated,
    /// No longer exists; dropped from the fleet
    Removed,
    /// Gave up; see `error_kind`
    Failed,
    /// Stopped because the resource left the fleet
    Cancelled,
}

impl OutcomeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::Remediated => "remediated",
            Self::Removed => "removed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Structured result of one reconciliation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub job_id: Uuid,
    pub resource_id: String,
    pub kind: ResourceKind,
    pub trigger: Trigger,
    /// Verdict before any remediation; unknown if inspection failed
    pub compliant_before: Option<bool>,
    pub detail: String,
    pub action: Action,
    pub attempts: u32,
    pub status: OutcomeStatus,
    pub error_kind: Option<ErrorKind>,
    pub finished_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Record for a job that finished now with no action taken.
    #[must_use]
    pub fn new(
        job_id: Uuid,
        resource: &ResourceRef,
        trigger: Trigger,
        status: OutcomeStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            resource_id: resource.id.clone(),
            kind: resource.kind,
            trigger,
            compliant_before: None,
            detail: detail.into(),
            action: Action::None,
            attempts: 0,
            status,
            error_kind: None,
            finished_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_compliant_before(mut self, compliant: bool) -> Self {
        self.compliant_before = Some(compliant);
        self
    }

    #[must_use]
    pub const fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    /// Whether the job ended in a failure that will not be retried.
    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        self.status == OutcomeStatus::Failed
    }

    fn notification(&self) -> Option<NotifyEvent> {
        match self.status {
            OutcomeStatus::Failed => Some(NotifyEvent::RemediationFailed {
                resource_id: self.resource_id.clone(),
                kind: self.kind.to_string(),
                error_kind: self
                    .error_kind
                    .map_or_else(|| "unknown".to_string(), |k| k.to_string()),
                attempts: self.attempts,
                message: self.detail.clone(),
                timestamp: self.finished_at,
            }),
            OutcomeStatus::Removed => Some(NotifyEvent::ResourceRemoved {
                resource_id: self.resource_id.clone(),
                kind: self.kind.to_string(),
                reason: self.detail.clone(),
                timestamp: self.finished_at,
            }),
            _ => None,
        }
    }
}

/// Destination for outcome records.
pub struct OutcomeSink {
    log: Option<Mutex<File>>,
    notifier: Notifier,
}

impl OutcomeSink {
    /// Sink that only logs and notifies.
    #[must_use]
    pub fn new(notifier: Notifier) -> Self {
        Self {
            log: None,
            notifier,
        }
    }

    /// Sink that also appends records to `path`.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be opened for appending.
    pub async fn with_log(path: &Path, notifier: Notifier) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        info!(path = %path.display(), "Writing outcome records");
        Ok(Self {
            log: Some(Mutex::new(file)),
            notifier,
        })
    }

    /// Sink that drops everything but the log line.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Notifier::disabled())
    }

    /// Publish one record.
    pub async fn record(&self, record: &OutcomeRecord) {
        match record.status {
            OutcomeStatus::Failed if record.error_kind == Some(ErrorKind::PermissionDenied) => {
                error!(
                    job_id = %record.job_id,
                    resource_id = %record.resource_id,
                    kind = %record.kind,
                    trigger = %record.trigger,
                    attempts = record.attempts,
                    detail = %record.detail,
                    "Permission denied, resource cannot be reconciled"
                );
            }
            OutcomeStatus::Failed | OutcomeStatus::Removed => {
                warn!(
                    job_id = %record.job_id,
                    resource_id = %record.resource_id,
                    kind = %record.kind,
                    trigger = %record.trigger,
                    status = record.status.as_str(),
                    error_kind = ?record.error_kind,
                    attempts = record.attempts,
                    detail = %record.detail,
                    "Reconciliation outcome"
                );
            }
            _ => {
                info!(
                    job_id = %record.job_id,
                    resource_id = %record.resource_id,
                    kind = %record.kind,
                    trigger = %record.trigger,
                    status = record.status.as_str(),
                    attempts = record.attempts,
                    detail = %record.detail,
                    "Reconciliation outcome"
                );
            }
        }

        if let Some(log) = &self.log {
            if let Err(e) = Self::append(log, record).await {
                error!(error = %e, "Failed to write outcome record");
            }
        }

        if let Some(event) = record.notification() {
            self.notifier.notify(event);
        }
    }

    /// Wait for notifications raised so far to be delivered.
    pub async fn flush(&self) {
        self.notifier.flush().await;
    }

    async fn append(log: &Mutex<File>, record: &OutcomeRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = log.lock().await;
        file.write_all(&line).await?;
        file.flush().await
    }
}

impl std::fmt::Debug for OutcomeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeSink")
            .field("log", &self.log.is_some())
            .field("notifier", &self.notifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use async_trait::async_trait;
    use warden_notify::{ChannelError, NotifyChannel};

    #[derive(Default)]
    struct Recorder(AtomicUsize);

    #[async_trait]
    impl NotifyChannel for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(status: OutcomeStatus) -> OutcomeRecord {
        OutcomeRecord::new(
            Uuid::new_v4(),
            &ResourceRef::new("alb-1", ResourceKind::ApplicationLoadBalancer),
            Trigger::Scan,
            status,
            "detail",
        )
    }

    #[test]
    fn test_record_serializes_snake_case() {
        let record = record(OutcomeStatus::Failed)
            .with_compliant_before(false)
            .with_attempts(5)
            .with_error_kind(ErrorKind::Transient);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["trigger"], "scan");
        assert_eq!(json["action"], "none");
        assert_eq!(json["kind"], "application_load_balancer");
        assert_eq!(json["error_kind"], "transient");
        assert_eq!(json["compliant_before"], false);
    }

    #[test]
    fn test_only_failures_and_removals_notify() {
        assert!(matches!(
            record(OutcomeStatus::Failed).notification(),
            Some(NotifyEvent::RemediationFailed { .. })
        ));
        assert!(matches!(
            record(OutcomeStatus::Removed).notification(),
            Some(NotifyEvent::ResourceRemoved { .. })
        ));
        assert!(record(OutcomeStatus::Compliant).notification().is_none());
        assert!(record(OutcomeStatus::Remediated).notification().is_none());
    }

    #[tokio::test]
    async fn test_records_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let sink = OutcomeSink::with_log(&path, Notifier::disabled())
            .await
            .unwrap();

        sink.record(&record(OutcomeStatus::Compliant)).await;
        sink.record(&record(OutcomeStatus::Remediated).with_action(Action::Remediated))
            .await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<OutcomeRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].status, OutcomeStatus::Compliant);
        assert_eq!(lines[1].action, Action::Remediated);
    }

    #[tokio::test]
    async fn test_flush_delivers_pending_notifications() {
        let recorder = Arc::new(Recorder::default());
        let channel: Arc<dyn NotifyChannel> = recorder.clone();
        let sink = OutcomeSink::new(Notifier::with_channels(vec![channel]));

        sink.record(&record(OutcomeStatus::Failed).with_error_kind(ErrorKind::PermissionDenied))
            .await;
        sink.record(&record(OutcomeStatus::Removed)).await;
        sink.record(&record(OutcomeStatus::Compliant)).await;
        sink.flush().await;

        assert_eq!(recorder.0.load(Ordering::SeqCst), 2);
    }
}
