//! # Lab reference ranges
//!
//! Storage and validation of clinical laboratory reference intervals.
//!
//! An analysis owns parameters; each parameter owns reference ranges keyed by
//! sex and an inclusive age span. Incoming ranges are normalized, checked for
//! overlaps, gap-filled to cover the whole lifespan and written in the sex
//! vocabulary the tenant's database constraint accepts.
//!
//! ## Modules
//!
//! - [`algorithms`]: interval normalization, overlap checks and gap filling
//! - [`models`]: parameters, ranges and request payloads
//! - [`services`]: sex tokens, sync coordination and domain errors
//! - [`db`]: schema introspection, repositories and backend selection
//! - [`config`]: engine settings from the environment
//! - [`http`]: axum router and handlers

// RepositoryError carries rich context for debugging
#![allow(clippy::result_large_err)]

pub mod algorithms;
pub mod config;
pub mod db;
pub mod models;
pub mod services;

#[cfg(feature = "http-server")]
pub mod http;
