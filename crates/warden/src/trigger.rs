//! Event-driven reconciliation.
//!
//! Change notifications (CloudTrail records, usually delivered through
//! EventBridge) are turned into immediate single-resource jobs. Both the flat
//! form and the EventBridge envelope are accepted:
//!
//! ```json
//! {"eventName": "DisassociateWebACL", "resourceArn": "arn:...", "timestamp": "..."}
//! {"detail": {"eventName": "DisassociateWebACL",
//!             "requestParameters": {"resourceArn": "arn:..."},
//!             "eventTime": "..."}}
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::outcome::Trigger;
use crate::scheduler::Scheduler;

/// Mutations watched when none are configured.
pub const DEFAULT_WATCHED_EVENTS: [&str; 2] = ["DisassociateWebACL", "AssociateWebACL"];

/// A change notification for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawEvent")]
pub struct ChangeEvent {
    pub event_name: String,
    pub resource_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(event_name: impl Into<String>, resource_arn: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            resource_arn: resource_arn.into(),
            timestamp: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEvent {
    Flat {
        #[serde(rename = "eventName")]
        event_name: String,
        #[serde(rename = "resourceArn")]
        resource_arn: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Envelope {
        detail: EnvelopeDetail,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDetail {
    event_name: String,
    request_parameters: RequestParameters,
    #[serde(default)]
    event_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestParameters {
    resource_arn: String,
}

impl From<RawEvent> for ChangeEvent {
    fn from(raw: RawEvent) -> Self {
        match raw {
            RawEvent::Flat {
                event_name,
                resource_arn,
                timestamp,
            } => Self {
                event_name,
                resource_arn,
                timestamp,
            },
            RawEvent::Envelope { detail } => Self {
                event_name: detail.event_name,
                resource_arn: detail.request_parameters.resource_arn,
                timestamp: detail.event_time,
            },
        }
    }
}

/// Set of event names that trigger a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    watched: HashSet<String>,
}

impl EventFilter {
    #[must_use]
    pub fn new<I, S>(watched: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            watched: watched.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.watched.contains(&event.event_name)
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHED_EVENTS)
    }
}

/// What the trigger did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A job was started for the resource.
    Started,
    /// The event name is not watched.
    Filtered,
    /// The resource is not managed.
    Unmanaged,
}

/// Turns change events into single-resource jobs.
#[derive(Debug)]
pub struct EventTrigger {
    scheduler: Arc<Scheduler>,
    filter: EventFilter,
    jobs: JoinSet<()>,
}

impl EventTrigger {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>, filter: EventFilter) -> Self {
        Self {
            scheduler,
            filter,
            jobs: JoinSet::new(),
        }
    }

    /// Start a job for `event` if it is watched and targets a managed resource.
    ///
    /// Jobs run in the background; duplicates are coalesced by the scheduler.
    pub async fn dispatch(&mut self, event: ChangeEvent) -> Dispatch {
        self.reap();

        if !self.filter.matches(&event) {
            debug!(event_name = %event.event_name, "Ignoring unwatched event");
            return Dispatch::Filtered;
        }
        if !self.scheduler.fleet().contains(&event.resource_arn).await {
            debug!(resource_id = %event.resource_arn, "Ignoring event for unmanaged resource");
            return Dispatch::Unmanaged;
        }

        info!(
            resource_id = %event.resource_arn,
            event_name = %event.event_name,
            event_time = ?event.timestamp,
            "Change event received, reconciling"
        );
        let scheduler = Arc::clone(&self.scheduler);
        self.jobs.spawn(async move {
            scheduler.run_one(&event.resource_arn, Trigger::Event).await;
        });
        Dispatch::Started
    }

    /// Consume events until the channel closes or `shutdown` fires, then wait
    /// for started jobs.
    pub async fn run(mut self, mut events: mpsc::Receiver<ChangeEvent>, shutdown: CancellationToken) {
        info!("Event trigger started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                    }
                    None => break,
                },
            }
        }
        self.drain().await;
        info!("Event trigger stopped");
    }

    /// Wait for all started jobs.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.jobs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Event job aborted");
            }
        }
    }

    fn reap(&mut self) {
        while let Some(joined) = self.jobs.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Event job aborted");
            }
        }
    }
}
