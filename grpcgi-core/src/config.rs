mod defaults;
mod load;
mod types;
mod validate;


pub use load::load_config;
pub use types::{Config, LogConfig, RuntimeConfig, TargetConfig, TlsConfig};
