mod config;
mod quality;
mod sample;
mod value;

pub use config::{AgentConfig, ConfigError, ServerConfig, SubscriptionDef};
pub use quality::quality_label;
pub use sample::Sample;
pub use value::SampleValue;
