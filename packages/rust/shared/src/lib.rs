//! Shared types, error model, and configuration for Fieldforge.
//!
//! This crate is the foundation depended on by all other Fieldforge crates.
//! It provides:
//! - [`FieldforgeError`]: the unified error type
//! - Data types ([`Record`], [`Dataset`], [`RowStatistics`], [`StepStatistics`])
//! - Step parameters ([`ParamValue`], [`Callable`], [`ParamGrid`]) and fingerprinting
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod hash;
pub mod params;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, PricingConfig, ProviderConfig, SearchConfig, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from, resolve_api_key,
};
pub use error::{FieldforgeError, Result};
pub use hash::{config_id, content_hash, params_to_json};
pub use params::{
    Callable, FLAT_SEPARATOR, GLOBAL_KEY, GridAxis, GroupedParams, ParamGrid, ParamValue, Params,
    flatten_params,
};
pub use types::{
    Dataset, Record, RowMeta, RowStatistics, StepStatistics, TokenUsage, meta_column,
};
