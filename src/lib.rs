//! # Lakeflow
//!
//! Document ingestion for a data lake.
//!
//! Lakeflow pulls unstructured files (invoices, receipts, ...) from an
//! object store, submits them to a document-analysis service, normalizes
//! the extracted fields into a stable record shape, writes the records back
//! to the store idempotently, and finally drives a remote compute session
//! that loads the records into managed tables.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌────────────┐   ┌─────────────┐
//! │ ObjectStore │──▶│  Analyzer   │──▶│ Normalizer │──▶│ ObjectStore │
//! │ list + get  │   │ submit/poll │   │   (pure)   │   │ artifact +  │
//! └─────────────┘   └─────────────┘   └────────────┘   │  manifest   │
//!                                                      └──────┬──────┘
//!                                                             │
//!                                      ┌──────────────────────┘
//!                                      ▼
//!                              ┌───────────────┐
//!                              │ ComputeSession│
//!                              │  table load   │
//!                              └───────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and setting resolution |
//! | [`auth`] | Bearer tokens per target service |
//! | [`store`] | Object-store trait, DFS client, in-memory store |
//! | [`poll`] | Bounded polling state machine |
//! | [`analyzer`] | Document-analysis long-running operations |
//! | [`normalize`] | Analysis result → normalized document |
//! | [`pipeline`] | Per-category idempotent processing loop |
//! | [`session`] | Compute-session lifecycle |
//! | [`table_load`] | Table load statement and local projection |
//! | [`stages`] | CLI stage entry points |
//! | [`progress`] | Progress reporting on stderr |
//! | [`models`] | Core data types |

pub mod analyzer;
pub mod auth;
pub mod config;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod poll;
pub mod progress;
pub mod session;
pub mod stages;
pub mod store;
pub mod table_load;
