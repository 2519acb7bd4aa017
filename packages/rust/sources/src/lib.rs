//! External data sources for enrichment lookups.
//!
//! This crate provides:
//! - [`SourceAdapter`], the narrow async interface the pipeline calls
//! - [`AdapterRegistry`], a lookup table from [`LookupKind`] to adapter
//! - [`NormalizedInput`], per-kind normalization of record attributes
//! - Reference adapters for the lookup API, subscriber location pages,
//!   profile pages and offline email classification

pub mod adapters;
mod http;
mod input;

pub use adapters::{
    AdapterRegistry, EmailDomainAdapter, LocationPageAdapter, LookupApiAdapter,
    ProfilePageAdapter, RawResponse, SourceAdapter,
};
pub use http::build_client;
pub use input::NormalizedInput;

pub use enrichkit_shared::LookupKind;
