//! Controller reconciliation logic

mod deployment;

pub use deployment::{error_policy, reconcile, Context};
