//! Reconciliation of `ActRunner` resources into execution pods.

pub mod controller;
pub mod naming;
pub mod resources;

pub use controller::reconcile_act_runner;
