//! Configuration loading and env substitution.
//!
//! Config files: `cqlink.toml`, `cqlink.yaml`, `cqlink.yml` or `cqlink.json`,
//! searched in `./` then the user config directory (`~/.config/cqlink/`).
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, load_config},
    schema::{
        BackendConfig, ConfigError, CqlinkConfig, LogsConfig, PushConfig, ServerConfig,
        TimingConfig,
    },
};
