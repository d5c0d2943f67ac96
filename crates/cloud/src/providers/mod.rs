//! Provider abstractions.
//!
//! This module defines the common trait and types for resource providers.

pub mod aws;
pub mod memory;
mod traits;

pub use traits::{ObservedState, ProviderError, ResourceKind, ResourceProvider, ResourceRef};

// Re-export provider clients
pub use aws::Wafv2;
pub use memory::InMemoryProvider;
