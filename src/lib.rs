//! # Course Context
//!
//! Document ingestion and retrieval for course materials.
//!
//! Course files (PDF, DOCX, PPTX, SRT captions, plain text) are pulled from
//! object storage, split into overlapping chunks, embedded, and written to a
//! vector store together with a relational log. Queries are answered with
//! the chunks of a single course that are most similar to the question.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌─────────┐   ┌──────────────┐
//! │ ObjectStore │──▶│ extract  │──▶│  chunk  │──▶│    upload    │
//! │ S3 / local  │   │ by format│   │         │   │ embed+upsert │
//! └─────────────┘   └──────────┘   └─────────┘   └──────┬───────┘
//!                                                       ▼
//!                         ┌───────────┐          ┌──────────────┐
//!                         │ retrieval │◀─────────│ VectorStore  │
//!                         │  + format │          │ + AuditLog   │
//!                         └───────────┘          └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Shared clients (`AppContext`) |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline errors |
//! | [`object_store`] | S3, local and in-memory object storage |
//! | [`extract`] | Format-specific text extraction |
//! | [`thumbnail`] | First-page PDF thumbnails |
//! | [`chunk`] | Recursive text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`upload`] | Embedding and dual-store upsert |
//! | [`ingest`] | Bulk ingestion worker pool |
//! | [`retrieval`] | Course-scoped similarity search |
//! | [`format`] | Retrieval response shaping |
//! | [`manage`] | Listing and deleting course files |
//! | [`store`] | Vector store and relational log backends |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod format;
pub mod ingest;
pub mod manage;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod retrieval;
pub mod store;
pub mod thumbnail;
pub mod upload;
