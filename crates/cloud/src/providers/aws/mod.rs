//! AWS (Amazon Web Services) provider.
//!
//! Implements the [`ResourceProvider`](crate::ResourceProvider) trait for AWS WAFv2.
//!
//! ## Operations
//!
//! - **GetWebACLForResource** - read the current association
//! - **AssociateWebACL** - attach a Web ACL (idempotent on the AWS side)
//! - **DisassociateWebACL** - detach whatever is attached
//!
//! ## Supported resources
//!
//! Regional scope only: Application Load Balancers, API Gateway REST API
//! stages, AppSync GraphQL APIs and Cognito user pools. CloudFront
//! distributions use a different (global) API and are not handled here.

mod client;
mod models;
pub mod sigv4;

pub use client::Wafv2;
pub use models::*;
pub use sigv4::Credentials;
