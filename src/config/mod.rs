pub mod schema;

pub use schema::{
    channel_name, validate_queue, ChannelConfig, Config, FieldKind, FieldRule,
    ObservabilityConfig, QueueConfig, RuleConfig,
};
