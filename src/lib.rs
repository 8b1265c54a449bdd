//! Deploy Knative services from an image, a Git repository, a Dockerfile URL
//! or a local Dockerfile.
//!
//! A deploy runs in four steps:
//! 1. pick the [`source::Source`] from the command line,
//! 2. install the build template and ConfigMap the build needs ([`templates`]),
//! 3. assemble the [`knative::Service`] object ([`deploy::build_service`]),
//! 4. create it, or update the existing one in place ([`deploy::reconcile`]).

pub mod config;
pub mod deploy;
pub mod knative;
pub mod pairs;
pub mod source;
pub mod store;
pub mod templates;
