//! Document ingestion pipeline.
//!
//! Turns an uploaded file into a searchable per-document index:
//!
//! ```text
//! fetch bytes ─▶ parse pages ─▶ embed (batched) ─▶ write namespace ─▶ SUCCESS
//!      │              │               │                  │
//!      └──────────────┴───────────────┴──────────────────┴──▶ FAILED
//! ```
//!
//! Every stage error is absorbed into the document's status; callers never
//! see an ingestion failure except by polling. Namespace writes replace the
//! whole namespace in one transaction, so re-running a document is
//! idempotent and a failed run never leaves a partial index behind.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use pagewise_core::embedding::EmbeddingProvider;
use pagewise_core::error::{AccessError, IngestError};
use pagewise_core::models::{Document, IngestionStatus, StatusTransition};
use pagewise_core::store::{IndexEntry, RecordStore, VectorIndex};

use crate::extract::DocumentParser;
use crate::storage::ObjectStore;

const DEFAULT_BATCH_SIZE: usize = 64;

/// The collaborators ingestion needs, wired once at startup.
pub struct IngestionPipeline {
    records: Arc<dyn RecordStore>,
    index: Arc<dyn VectorIndex>,
    storage: Arc<dyn ObjectStore>,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        index: Arc<dyn VectorIndex>,
        storage: Arc<dyn ObjectStore>,
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            records,
            index,
            storage,
            parser,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Run ingestion for a document and write its terminal status.
    ///
    /// Returns the status the document holds afterwards. Nothing is retried.
    pub async fn ingest(&self, doc: &Document) -> IngestionStatus {
        match self.run(doc).await {
            Ok(pages) => self.finish_success(doc, pages).await,
            Err(err) => {
                warn!(
                    document_id = %doc.id,
                    stage = err.stage(),
                    error = %err,
                    "ingestion failed"
                );
                self.finish_failure(doc).await
            }
        }
    }

    /// Register an uploaded file in `PROCESSING`.
    pub async fn register(
        &self,
        user_id: &str,
        key: &str,
        name: &str,
        url: &str,
    ) -> Result<Document> {
        let doc = Document::new_processing(user_id, key, name, url);
        self.records.insert_document(&doc).await?;
        info!(document_id = %doc.id, key, "document registered");
        Ok(doc)
    }

    /// Register an uploaded file and ingest it in the background.
    pub async fn create_document(
        self: &Arc<Self>,
        user_id: &str,
        key: &str,
        name: &str,
        url: &str,
    ) -> Result<Document> {
        let doc = self.register(user_id, key, name, url).await?;
        self.spawn_ingest(doc.clone());
        Ok(doc)
    }

    pub fn spawn_ingest(self: &Arc<Self>, doc: Document) -> tokio::task::JoinHandle<IngestionStatus> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.ingest(&doc).await })
    }

    /// Move a `FAILED` document back to `PROCESSING`.
    ///
    /// Any other status is rejected with [`AccessError::NotReady`]; callers
    /// then run [`ingest`](Self::ingest) or [`spawn_ingest`](Self::spawn_ingest).
    pub async fn reopen_failed(&self, document_id: &str, user_id: &str) -> Result<Document> {
        let mut doc = self
            .records
            .get_document(document_id)
            .await?
            .filter(|d| d.is_owned_by(user_id))
            .ok_or_else(|| AccessError::NotFound(format!("document {}", document_id)))?;

        if doc.status != IngestionStatus::Failed {
            return Err(AccessError::NotReady(format!(
                "document {} is {}, only FAILED documents can be re-ingested",
                doc.id, doc.status
            ))
            .into());
        }

        match self
            .records
            .transition_status(&doc.id, IngestionStatus::Processing)
            .await?
        {
            StatusTransition::Applied {
                from: IngestionStatus::Failed,
            } => {
                info!(document_id = %doc.id, "re-ingestion started");
                doc.status = IngestionStatus::Processing;
                Ok(doc)
            }
            StatusTransition::Missing => {
                Err(AccessError::NotFound(format!("document {}", document_id)).into())
            }
            StatusTransition::Applied { from } | StatusTransition::Rejected { current: from } => {
                Err(AccessError::NotReady(format!(
                    "document {} moved to {} concurrently",
                    doc.id, from
                ))
                .into())
            }
        }
    }

    /// Re-ingest a `FAILED` document in the background.
    pub async fn reingest(self: &Arc<Self>, document_id: &str, user_id: &str) -> Result<Document> {
        let doc = self.reopen_failed(document_id, user_id).await?;
        self.spawn_ingest(doc.clone());
        Ok(doc)
    }

    /// Fetch, parse, embed, and index. Returns the number of pages indexed.
    async fn run(&self, doc: &Document) -> Result<usize, IngestError> {
        let bytes = self
            .storage
            .fetch_bytes(&doc.key)
            .await
            .map_err(|e| IngestError::Fetch {
                key: doc.key.clone(),
                reason: format!("{:#}", e),
            })?;
        debug!(document_id = %doc.id, bytes = bytes.len(), "fetched");

        let parser = Arc::clone(&self.parser);
        let pages = tokio::task::spawn_blocking(move || parser.parse(&bytes))
            .await
            .map_err(|e| IngestError::Parse(e.to_string()))?
            .map_err(|e| IngestError::Parse(e.to_string()))?;
        if pages.is_empty() {
            return Err(IngestError::Parse("no pages extracted".to_string()));
        }
        debug!(document_id = %doc.id, pages = pages.len(), "parsed");

        let vectors = self.embed_pages(&pages).await?;

        let namespace = doc.namespace();
        let entries: Vec<IndexEntry> = pages
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| IndexEntry::new(namespace, i + 1, text, vector))
            .collect();

        self.index
            .write_namespace(namespace, &entries)
            .await
            .map_err(|e| IngestError::Index {
                namespace: namespace.to_string(),
                reason: format!("{:#}", e),
            })?;

        Ok(entries.len())
    }

    /// Embed every page or none of them.
    async fn embed_pages(&self, pages: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let mut vectors = Vec::with_capacity(pages.len());
        for batch in pages.chunks(self.batch_size) {
            let embedded = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| IngestError::Embed(format!("{:#}", e)))?;
            if embedded.len() != batch.len() {
                return Err(IngestError::Embed(format!(
                    "provider returned {} vectors for {} pages",
                    embedded.len(),
                    batch.len()
                )));
            }
            if embedded.iter().any(|v| v.is_empty()) {
                return Err(IngestError::Embed("provider returned an empty vector".to_string()));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    async fn finish_success(&self, doc: &Document, pages: usize) -> IngestionStatus {
        match self
            .records
            .transition_status(&doc.id, IngestionStatus::Success)
            .await
        {
            Ok(StatusTransition::Applied { .. }) => {
                info!(document_id = %doc.id, pages, "ingestion succeeded");
                IngestionStatus::Success
            }
            Ok(StatusTransition::Rejected { current }) => {
                // A concurrent run already failed the document; its index must
                // not outlive that verdict.
                warn!(document_id = %doc.id, %current, "success rejected, purging namespace");
                self.purge(doc).await;
                current
            }
            Ok(StatusTransition::Missing) => {
                warn!(document_id = %doc.id, "document deleted during ingestion");
                self.purge(doc).await;
                IngestionStatus::Pending
            }
            Err(e) => {
                let err = IngestError::Status(format!("{:#}", e));
                warn!(document_id = %doc.id, error = %err, "status write failed");
                self.finish_failure(doc).await
            }
        }
    }

    async fn finish_failure(&self, doc: &Document) -> IngestionStatus {
        match self
            .records
            .transition_status(&doc.id, IngestionStatus::Failed)
            .await
        {
            Ok(StatusTransition::Applied { .. }) => {
                self.purge(doc).await;
                IngestionStatus::Failed
            }
            Ok(StatusTransition::Rejected { current }) => current,
            Ok(StatusTransition::Missing) => {
                self.purge(doc).await;
                IngestionStatus::Pending
            }
            Err(e) => {
                warn!(document_id = %doc.id, error = %format!("{:#}", e), "could not mark document failed");
                doc.status
            }
        }
    }

    async fn purge(&self, doc: &Document) {
        if let Err(e) = self.index.purge_namespace(doc.namespace()).await {
            warn!(document_id = %doc.id, error = %format!("{:#}", e), "namespace purge failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PageParser;
    use anyhow::bail;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pagewise_core::embedding::HashEmbedder;
    use pagewise_core::store::memory::InMemoryStore;

    struct StaticStorage(&'static [u8]);

    #[async_trait]
    impl ObjectStore for StaticStorage {
        async fn fetch_bytes(&self, _key: &str) -> Result<Bytes> {
            Ok(Bytes::from_static(self.0))
        }
    }

    struct MissingStorage;

    #[async_trait]
    impl ObjectStore for MissingStorage {
        async fn fetch_bytes(&self, key: &str) -> Result<Bytes> {
            bail!("no object at {}", key)
        }
    }

    fn pipeline(store: &Arc<InMemoryStore>, storage: Arc<dyn ObjectStore>) -> Arc<IngestionPipeline> {
        Arc::new(
            IngestionPipeline::new(
                store.clone(),
                store.clone(),
                storage,
                Arc::new(PageParser),
                Arc::new(HashEmbedder::new(16)),
            )
            .with_batch_size(2),
        )
    }

    #[tokio::test]
    async fn three_pages_across_two_batches() {
        let store = Arc::new(InMemoryStore::new());
        let p = pipeline(&store, Arc::new(StaticStorage(b"one\x0ctwo\x0cthree")));
        let doc = p.register("u1", "k", "n.txt", "http://x/k").await.unwrap();

        assert_eq!(p.ingest(&doc).await, IngestionStatus::Success);
        assert_eq!(store.namespace_len(&doc.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reopen_requires_failed() {
        let store = Arc::new(InMemoryStore::new());
        let p = pipeline(&store, Arc::new(MissingStorage));
        let doc = p.register("u1", "k", "n.txt", "http://x/k").await.unwrap();

        let err = p.reopen_failed(&doc.id, "u1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AccessError>(),
            Some(AccessError::NotReady(_))
        ));

        assert_eq!(p.ingest(&doc).await, IngestionStatus::Failed);
        let err = p.reopen_failed(&doc.id, "someone-else").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AccessError>(),
            Some(AccessError::NotFound(_))
        ));

        let reopened = p.reopen_failed(&doc.id, "u1").await.unwrap();
        assert_eq!(reopened.status, IngestionStatus::Processing);
    }
}
