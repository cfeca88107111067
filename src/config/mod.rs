mod loader;
mod types;

pub use types::{Config, FramingConfig, ListenerConfig, Settings, TimeoutConfig, Transport};
