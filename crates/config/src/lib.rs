//! Configuration loading for switchboard hosts.
//!
//! Config files: `switchboard.toml`, `switchboard.yaml`, or `switchboard.json`
//! Searched in `./` then `~/.config/switchboard/`.
//!
//! Channel blocks are kept as raw JSON values; each channel plugin parses its
//! own block. Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod source;

pub use {
    loader::{
        config_dir, discover_and_load, find_config_file, load_config, load_config_raw, save_config,
    },
    schema::{PairingConfig, StatusConfig, SwitchboardConfig},
    source::{ConfigSource, FileConfig, MemoryConfig},
};
