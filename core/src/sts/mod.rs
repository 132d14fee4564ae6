//! Security Token Service module
//!
//! Exchanges workflow identity tokens for repository-scoped installation tokens.

pub mod exchange;
