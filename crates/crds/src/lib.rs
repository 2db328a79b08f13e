//! IntegrationPlatform CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the platform operator.

pub mod platform;

pub use platform::*;
