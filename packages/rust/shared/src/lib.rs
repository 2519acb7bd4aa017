//! Shared types, error model, and configuration for enrichkit.
//!
//! This crate is the foundation depended on by all other enrichkit crates.
//! It provides:
//! - [`EnrichError`] and [`LookupError`]: the unified error types
//! - Domain types ([`StateRecord`], [`StackItem`], [`LookupKind`], [`RecordId`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)
//! - Normalization helpers ([`normalize_url`], [`mask_email`])

pub mod config;
pub mod error;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, DefaultsConfig, PipelineConfig, RateLimit, RateLimitConfig,
    RetryConfig, SourcesConfig, StackConfig, TimeoutsConfig, config_dir, config_file_path,
    database_path, init_config, load_config, load_config_from, lookup_api_key,
};
pub use error::{EnrichError, ErrorClass, LookupError, Result};
pub use text::{collapse_whitespace, mask_email, normalize_email, normalize_url};
pub use types::{
    BatchCounts, FailureReason, LookupKind, Payload, RecordId, RecordInput, RecordStatus, RunId,
    StackItem, StateRecord,
};
