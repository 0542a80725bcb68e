#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::unnecessary_wraps
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod broker;
pub mod config;
pub mod observability;
pub mod security;
pub(crate) mod util;
pub mod validation;

pub use broker::{
    Broker, BrokerError, Channel, Delivery, DeliveryHandler, ForwardingHandler, QueueEngine,
    SubscriberKind,
};
pub use config::Config;
pub use security::{Access, RulesEngine};
pub use validation::{ValidationError, ValidationErrors, Validator};

/// Operator subcommands of the `switchyard` binary.
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    /// Load and validate the configuration, then summarize channels and rules
    Check,
    /// Evaluate the access rules for one client and path
    Access {
        /// Client id, e.g. `worker-1`
        client: String,
        /// `endpoint/version/id`; missing trailing segments mean `*`
        path: String,
        /// Check send (write) access instead of listen/consume (read)
        #[arg(long)]
        write: bool,
    },
    /// Print the JSON schema of the configuration file
    Schema,
}
