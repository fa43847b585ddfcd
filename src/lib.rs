//! # Index Mirror
//!
//! A secondary, queryable search index that mirrors a subset of records
//! held in a relational system of record (activities, active rules and
//! their params).
//!
//! Writes land in the relational tables first; the synchronizer
//! materializes each changed record into a denormalized document and
//! upserts it into the index. Reads build a typed query, translate it
//! into a boolean filter tree, and page through the index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Primary rows │──▶│ Synchronizer │──▶│ Index store │
//! │ (relational) │   │  materialize │   │ (documents) │
//! └──────────────┘   └──────────────┘   └──────┬──────┘
//!                                              │
//!                  ┌──────────────┐   ┌────────▼──────┐
//!                  │ Typed query  │──▶│ Filter tree + │
//!                  │              │   │ result mapper │
//!                  └──────────────┘   └───────────────┘
//! ```
//!
//! The two stores are never updated atomically; the index is eventually
//! consistent and [`sync::Synchronizer::backfill`] is the repair
//! mechanism for drift.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Document model and typed entity views |
//! | [`query`] | Typed queries and the filter-expression tree |
//! | [`store`] | Index store trait, in-memory and SQLite backends |
//! | [`sync`] | Change-event application and chunked backfill |
//! | [`results`] | Raw hits back into typed, paginated results |
//! | [`source`] | Primary-store reads for backfill |
//! | [`error`] | Error taxonomy |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod query;
pub mod results;
pub mod source;
pub mod store;
pub mod sync;
