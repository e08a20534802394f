//! Shared clients, built once per process.
//!
//! [`AppContext`] owns every long-lived collaborator behind an `Arc` and is
//! passed by reference to the ingestion and retrieval entry points. It is
//! cheap to clone.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::object_store::{create_object_store, ObjectStore};
use crate::store::sqlite::SqliteStore;
use crate::store::{AuditLog, VectorStore};
use crate::{db, migrate};

#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub objects: Arc<dyn ObjectStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub log: Arc<dyn AuditLog>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl AppContext {
    pub fn new(
        config: Config,
        objects: Arc<dyn ObjectStore>,
        vectors: Arc<dyn VectorStore>,
        log: Arc<dyn AuditLog>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            objects,
            vectors,
            log,
            embedder,
        }
    }

    /// Connect to the database (creating tables if needed), the configured
    /// object store and embedding provider.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool)
            .await
            .context("Failed to create database schema")?;
        let store = Arc::new(SqliteStore::new(pool));

        let objects =
            create_object_store(&config.storage).context("Failed to set up object storage")?;
        let embedder =
            create_provider(&config.embedding).context("Failed to set up embedding provider")?;
        if !config.embedding.is_enabled() {
            warn!("embedding provider is disabled; ingestion and search will fail");
        }

        Ok(Self::new(
            config.clone(),
            objects,
            store.clone(),
            store,
            embedder,
        ))
    }
}
