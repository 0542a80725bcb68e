//! Access control for channel paths.
//!
//! [`RulesEngine`] decides whether a client may send to (write) or
//! listen/consume from (read) an `endpoint/version/id` path. The transport
//! consults it before a request reaches a channel; [`crate::broker::Broker`]
//! does the same for its own entry points.

pub mod rules;

pub use rules::{parse_path, Access, RulesEngine};
