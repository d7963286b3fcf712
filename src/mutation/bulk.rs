use super::{item_error, MutationCoordinator};
use crate::engine::{BulkOp, BulkRequest, Refresh};
use crate::error::{ErrorKind, StacError};
use crate::types::{CollectionId, Item, ItemId, VersionToken};
use std::collections::HashMap;

/// Result of one record in a bulk load, reported in input order.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    Success {
        collection: CollectionId,
        id: ItemId,
        version: VersionToken,
    },
    Failure {
        collection: CollectionId,
        id: ItemId,
        kind: ErrorKind,
        message: String,
    },
}

impl BulkOutcome {
    fn failed(collection: &str, id: &str, err: &StacError) -> Self {
        BulkOutcome::Failure {
            collection: collection.to_string(),
            id: id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BulkOutcome::Success { .. })
    }

    pub fn id(&self) -> &str {
        match self {
            BulkOutcome::Success { id, .. } | BulkOutcome::Failure { id, .. } => id,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BulkOutcome::Success { .. } => None,
            BulkOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Split ops into chunks of at most `max_docs` ops and about `max_bytes`.
/// An op larger than `max_bytes` travels alone.
pub(crate) fn chunk_ops<T>(
    ops: Vec<(T, BulkOp)>,
    max_docs: usize,
    max_bytes: usize,
) -> Vec<Vec<(T, BulkOp)>> {
    let mut chunks = Vec::new();
    let mut current: Vec<(T, BulkOp)> = Vec::new();
    let mut current_bytes = 0usize;
    for (tag, op) in ops {
        let size = op.estimated_bytes();
        let full = current.len() >= max_docs || current_bytes + size > max_bytes;
        if !current.is_empty() && full {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push((tag, op));
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl MutationCoordinator {
    /// Insert or overwrite many items, chunked by count and size.
    ///
    /// Never fails as a whole: each record gets its own outcome. Chunks are
    /// retried on transport failure; a chunk that still fails marks all of
    /// its records failed while earlier chunks stay committed.
    pub async fn bulk_upsert(&self, items: Vec<Item>, refresh: Option<Refresh>) -> Vec<BulkOutcome> {
        let refresh = self.refresh.for_bulk(refresh);
        let total = items.len();
        let keys: Vec<(CollectionId, ItemId)> = items
            .iter()
            .map(|i| (i.collection.clone(), i.id.clone()))
            .collect();
        let mut outcomes: Vec<Option<BulkOutcome>> = vec![None; total];
        let mut resolved: HashMap<CollectionId, Result<String, StacError>> = HashMap::new();
        let mut pending: Vec<(usize, BulkOp)> = Vec::with_capacity(total);

        for (pos, item) in items.into_iter().enumerate() {
            let (collection, id) = &keys[pos];
            let item = match item.prepare_for_write() {
                Ok(item) => item,
                Err(e) => {
                    outcomes[pos] = Some(BulkOutcome::failed(collection, id, &e));
                    continue;
                }
            };
            if !resolved.contains_key(collection) {
                let index = self.indices.require_index(collection).await;
                resolved.insert(collection.clone(), index);
            }
            match &resolved[collection] {
                Ok(index) => pending.push((pos, BulkOp::index(index.clone(), id.clone(), item.to_json()))),
                Err(e) => outcomes[pos] = Some(BulkOutcome::failed(collection, id, e)),
            }
        }

        let chunks = chunk_ops(pending, self.chunk_docs, self.chunk_bytes);
        let chunk_count = chunks.len();
        for (n, chunk) in chunks.into_iter().enumerate() {
            let (positions, ops): (Vec<usize>, Vec<BulkOp>) = chunk.into_iter().unzip();
            let request = BulkRequest { ops, refresh };
            let result = self
                .retry
                .run("bulk", || self.engine.bulk(&request))
                .await;
            match result {
                Ok(responses) => {
                    for (i, &pos) in positions.iter().enumerate() {
                        let (collection, id) = &keys[pos];
                        outcomes[pos] = Some(match responses.get(i) {
                            Some(r) if r.is_success() => match r.version {
                                Some(version) => {
                                    if let Some(doc) = &request.ops[i].document {
                                        self.indices.observe_write(collection, doc);
                                    }
                                    BulkOutcome::Success {
                                        collection: collection.clone(),
                                        id: id.clone(),
                                        version,
                                    }
                                }
                                None => BulkOutcome::failed(
                                    collection,
                                    id,
                                    &StacError::Engine("write returned no version".to_string()),
                                ),
                            },
                            Some(r) => BulkOutcome::failed(collection, id, &item_error(collection, id, r)),
                            None => BulkOutcome::failed(
                                collection,
                                id,
                                &StacError::Engine("missing from bulk response".to_string()),
                            ),
                        });
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "[BULK] chunk {}/{} of {} ops failed after retries: {}",
                        n + 1,
                        chunk_count,
                        positions.len(),
                        e
                    );
                    for &pos in &positions {
                        let (collection, id) = &keys[pos];
                        outcomes[pos] = Some(BulkOutcome::failed(collection, id, &e));
                    }
                }
            }
        }

        let outcomes: Vec<BulkOutcome> = outcomes
            .into_iter()
            .zip(keys)
            .map(|(outcome, (collection, id))| {
                outcome.unwrap_or_else(|| BulkOutcome::Failure {
                    collection,
                    id,
                    kind: ErrorKind::Engine,
                    message: "no outcome recorded".to_string(),
                })
            })
            .collect();
        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        tracing::info!(
            "[BULK] {} items in {} chunks: {} ok, {} failed",
            total,
            chunk_count,
            ok,
            total - ok
        );
        outcomes
    }
}
