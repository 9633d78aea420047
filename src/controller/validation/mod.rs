//! # Validation
//!
//! Validates unit identities and duration strings from declarative input.

mod duration;
mod kubernetes;

pub use duration::{parse_kubernetes_duration, validate_duration_interval};
pub use kubernetes::{validate_kubernetes_name, validate_kubernetes_namespace};
