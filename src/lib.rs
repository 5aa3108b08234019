//! Operator for ephemeral, one-shot Forgejo Actions runners.
//!
//! An [`ActDeployment`](crds::ActDeployment) declares a runner fleet for one
//! Forgejo organization. The deployment controller materializes a listener
//! workload for it; the listener polls the Forgejo job queue and emits one
//! [`ActRunner`](crds::ActRunner) per admitted job; the runner controller
//! drives each `ActRunner` through its pod-backed lifecycle.

pub mod controllers;
pub mod crds;
pub mod forgejo;
pub mod listener;
