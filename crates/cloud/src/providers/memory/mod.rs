//! In-memory provider.
//!
//! Keeps resource state in process. Used for dry runs (seeded from a YAML
//! fixture) and for exercising the reconciler without a cloud account.
//!
//! ## Fixture format
//!
//! ```yaml
//! resources:
//!   alb-1: {}
//!   alb-2:
//!     web_acl_arn: waf-default
//! ```
//!
//! ## Fault injection
//!
//! [`InMemoryProvider::inject`] queues failures for one resource and
//! operation. Each queued fault is consumed by exactly one call.

mod client;

pub use client::{Fault, InMemoryProvider, Operation};
