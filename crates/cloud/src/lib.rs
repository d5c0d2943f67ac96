//! Provider integrations for Warden.
//!
//! This crate provides the provider-facing half of the reconciler:
//!
//! - **AWS** - WAFv2 Web ACL associations over the signed JSON API
//! - **Memory** - an in-process provider for dry runs and tests
//!
//! ## Resource model
//!
//! Providers expose the current configuration of a resource as an
//! [`ObservedState`], a flat string map. The reconciler never interprets a
//! provider's wire types directly, only the well-known keys of that map
//! (see [`ObservedState::WEB_ACL_ARN`]).
//!
//! ## Throttling
//!
//! Provider APIs are rate-limited. Clients share a [`Throttle`] that spaces
//! requests out on the client side, and they surface server-side throttling as
//! [`ProviderError::Throttled`] so callers can back off.

pub mod providers;
pub mod throttle;

pub use providers::{
    aws, memory, ObservedState, ProviderError, ResourceKind, ResourceProvider, ResourceRef,
};
pub use throttle::Throttle;
