//! Configuration Module
//!
//! Configuration loading for the stream proxy.

mod settings;

pub use settings::{
    BusSettings, ConfigError, ProxyConfig, ReconnectSettings, ServerSettings, StreamSettings,
};
