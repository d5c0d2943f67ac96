//! Warden: a self-healing compliance reconciler.
//!
//! Warden keeps a declared set of cloud resources compliant with per-kind
//! policies. Today the only policy family is "this resource must have this
//! WAFv2 Web ACL associated".
//!
//! # Control flow
//!
//! ```text
//! Scheduler ── fleet ids ──▶ Inspector ──▶ PolicySet::evaluate
//!     ▲                                        │ non-compliant
//!     │                                        ▼
//! EventTrigger ◀── POST /events            Executor (retry/backoff)
//!                                              │
//!                                              ▼
//!                                        OutcomeSink
//! ```
//!
//! Periodic scans and change events feed the same [`scheduler::Scheduler`],
//! which guarantees at most one in-flight job per resource.

pub mod app;
pub mod config;
pub mod error;
pub mod executor;
pub mod fleet;
pub mod inspector;
pub mod outcome;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod trigger;

pub use config::{ConfigError, WardenConfig};
pub use error::{ErrorKind, ReconcileError};
pub use executor::{Executor, RemediationResult, RetryPolicy};
pub use fleet::Fleet;
pub use inspector::Inspector;
pub use outcome::{OutcomeRecord, OutcomeSink, OutcomeStatus, Trigger};
pub use policy::{ComplianceVerdict, DesiredState, Policy, PolicySet};
pub use scheduler::{JobOutcome, ScanReport, Scheduler, SchedulerSettings};
pub use trigger::{ChangeEvent, EventFilter, EventTrigger};
