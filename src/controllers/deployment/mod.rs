//! Reconciliation of `ActDeployment` resources into listener infrastructure.

pub mod controller;
pub mod resources;

pub use controller::reconcile_act_deployment;
