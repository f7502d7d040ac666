//! Configuration model, validation, and the external provider boundary

pub mod provider;
pub mod types;

pub use provider::{ConfigCache, ConfigProvider, FileConfigProvider, WatchCallback};
pub use types::{
    BitEntry, Config, ConnectionSpec, DeviceSpec, ParameterSpec, PollMode, ReadBlock,
    RegisterType, TransportSpec,
};
