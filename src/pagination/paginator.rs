use crate::config::CatalogConfig;
use crate::engine::{SearchEngine, TotalHits};
use crate::error::{Result, StacError};
use crate::index::manager::IndexManager;
use crate::pagination::cursor::{CursorCodec, Fingerprint};
use crate::query::builder::{NormalizedSearch, SearchRequest, SearchRequestBuilder};
use crate::query::queryables::Queryables;
use crate::retry::RetryPolicy;
use crate::types::VersionToken;
use serde_json::Value;
use std::sync::Arc;

/// One returned record with its engine coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PageHit {
    pub index: String,
    pub id: String,
    pub document: Value,
    pub version: Option<VersionToken>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub hits: Vec<PageHit>,
    /// Token for the following page; `None` on the last page.
    pub next: Option<String>,
    pub matched: TotalHits,
}

impl Page {
    pub fn documents(&self) -> impl Iterator<Item = &Value> {
        self.hits.iter().map(|h| &h.document)
    }
}

/// Search-after pagination over a stable total order.
///
/// Every sort carries the `id`/`collection` tie-break, so for unchanging data
/// following `next` tokens from the first page visits each match exactly
/// once. Writes between pages may shift what later pages contain.
pub struct Paginator {
    engine: Arc<dyn SearchEngine>,
    indices: Arc<IndexManager>,
    builder: SearchRequestBuilder,
    codec: CursorCodec,
    retry: RetryPolicy,
}

impl Paginator {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        indices: Arc<IndexManager>,
        config: &CatalogConfig,
    ) -> Self {
        Paginator {
            engine,
            indices,
            builder: SearchRequestBuilder::new(config),
            codec: CursorCodec::new(config.cursor_secret.clone()),
            retry: config.retry,
        }
    }

    pub async fn page(&self, request: &SearchRequest) -> Result<Page> {
        let normalized = self.builder.normalize(request)?;
        let queryables = self.indices.queryables(&normalized.collections).await?;
        self.fetch(&normalized, &queryables, request.token.as_deref())
            .await
    }

    /// One page of collection documents; same token contract as [`Self::page`].
    pub async fn page_collections(&self, request: &SearchRequest) -> Result<Page> {
        let normalized = self.builder.normalize_collections(request)?;
        let queryables = self.indices.collection_queryables().await?;
        self.fetch(&normalized, &queryables, request.token.as_deref())
            .await
    }

    async fn fetch(
        &self,
        normalized: &NormalizedSearch,
        queryables: &Queryables,
        token: Option<&str>,
    ) -> Result<Page> {
        let fingerprint = Fingerprint::of(normalized)?;
        let mut search = self.builder.build_normalized(normalized, queryables)?;

        if let Some(token) = token {
            let (sort_key, token_fingerprint) = self.codec.decode(token)?;
            if token_fingerprint != fingerprint {
                tracing::warn!(
                    "[PAGE] token for request {} replayed against {}",
                    token_fingerprint,
                    fingerprint
                );
                return Err(StacError::CursorMismatch);
            }
            if sort_key.len() != search.query.sort.len() {
                return Err(StacError::InvalidCursor(format!(
                    "token has {} sort values, query sorts on {}",
                    sort_key.len(),
                    search.query.sort.len()
                )));
            }
            search.query.search_after = Some(sort_key);
        }

        let limit = normalized.limit;
        // One extra hit tells us whether another page exists.
        search.query.size = limit + 1;

        let response = self
            .retry
            .run("search", || self.engine.search(&search))
            .await?;

        let mut hits = response.hits;
        let has_more = hits.len() > limit;
        hits.truncate(limit);

        let next = match (has_more, hits.last()) {
            (true, Some(last)) => Some(self.codec.encode(&last.sort, &fingerprint)?),
            _ => None,
        };
        tracing::debug!(
            "[PAGE {}] {} hits of {} matched, more={}",
            search.indices.join(","),
            hits.len(),
            response.total.value,
            has_more
        );

        Ok(Page {
            hits: hits
                .into_iter()
                .map(|h| PageHit {
                    index: h.index,
                    id: h.id,
                    document: h.source,
                    version: h.version,
                })
                .collect(),
            next,
            matched: response.total,
        })
    }

    /// Follow `next` tokens until the last page and return every hit.
    pub async fn collect_all(&self, request: &SearchRequest) -> Result<Vec<PageHit>> {
        let mut request = request.clone();
        request.token = None;
        let mut all = Vec::new();
        loop {
            let page = self.page(&request).await?;
            all.extend(page.hits);
            match page.next {
                Some(token) => request.token = Some(token),
                None => return Ok(all),
            }
        }
    }
}
