//! Permission module
//!
//! Closed permission vocabulary, boundary validation of requested sets, and
//! scoping of requests against the application's configured ceiling.

mod scope;
mod types;

pub use scope::{ConfiguredScoper, PermissionScoper, PermissionsConfig};
pub use types::{AccessLevel, Permission, PermissionSet};

pub(crate) use scope::join_names;
