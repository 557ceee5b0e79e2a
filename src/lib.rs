// src/lib.rs
//! Product catalog normalization and deduplication engine.
//!
//! A run reads a snapshot of the catalog through a [`repository::ProductRepository`],
//! normalizes product names, blocks records by coarse keys, scores intra-block
//! pairs, clusters near-duplicates with union-find, resolves a canonical record
//! per cluster and (unless dry-run) commits merge decisions back to the store.

pub mod blocking;
pub mod candidate_generation;
pub mod clustering;
pub mod diagnostics;
pub mod errors;
pub mod matching;
pub mod merging;
pub mod models;
pub mod normalization;
pub mod pipeline;
pub mod repository;
pub mod resolution;
pub mod utils;

pub use errors::{DedupeError, DedupeResult, StorageError, StorageErrorKind};
pub use pipeline::{normalize_catalog, spawn_normalize_catalog, CancellationFlag, RunOptions};
