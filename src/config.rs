use crate::engine::Refresh;
use crate::index::refresh::RefreshPolicy;
use crate::query::dsl::EngineDialect;
use crate::retry::RetryPolicy;
use rand::RngCore;
use std::env;
use std::time::Duration;

/// Catalog-wide settings, loaded from `STAC_*` environment variables.
#[derive(Clone)]
pub struct CatalogConfig {
    /// Physical item indices are `<prefix><sanitized collection id>`.
    pub items_index_prefix: String,
    pub collections_index: String,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// The engine's `index.max_result_window`: the largest `size` a single
    /// search may ask for.
    pub max_result_window: usize,
    pub bulk_chunk_docs: usize,
    pub bulk_chunk_bytes: usize,
    pub retry: RetryPolicy,
    pub refresh: RefreshPolicy,
    /// HMAC key for pagination tokens.
    pub cursor_secret: Vec<u8>,
    pub dialect: EngineDialect,
}

impl std::fmt::Debug for CatalogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogConfig")
            .field("items_index_prefix", &self.items_index_prefix)
            .field("collections_index", &self.collections_index)
            .field("default_page_size", &self.default_page_size)
            .field("max_page_size", &self.max_page_size)
            .field("max_result_window", &self.max_result_window)
            .field("bulk_chunk_docs", &self.bulk_chunk_docs)
            .field("bulk_chunk_bytes", &self.bulk_chunk_bytes)
            .field("retry", &self.retry)
            .field("refresh", &self.refresh)
            .field("cursor_secret", &"<redacted>")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            items_index_prefix: "items_".to_string(),
            collections_index: "collections".to_string(),
            default_page_size: 10,
            max_page_size: 10_000,
            max_result_window: 10_000,
            bulk_chunk_docs: 500,
            bulk_chunk_bytes: 10 * 1024 * 1024,
            retry: RetryPolicy::default(),
            refresh: RefreshPolicy::default(),
            cursor_secret: random_secret(),
            dialect: EngineDialect::default(),
        }
    }
}

fn random_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_refresh(key: &str) -> Option<Refresh> {
    let raw = env::var(key).ok()?;
    let parsed = Refresh::parse(&raw);
    if parsed.is_none() {
        tracing::warn!("Unknown {} '{}', using the default", key, raw);
    }
    parsed
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        let defaults = CatalogConfig::default();

        let cursor_secret = match env::var("STAC_CURSOR_SECRET") {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                tracing::warn!(
                    "STAC_CURSOR_SECRET not set; pagination tokens will not survive a restart \
                     or validate across replicas"
                );
                defaults.cursor_secret.clone()
            }
        };

        let dialect = match env::var("STAC_ENGINE_DIALECT") {
            Ok(s) => EngineDialect::parse(&s).unwrap_or_else(|| {
                tracing::warn!("Unknown STAC_ENGINE_DIALECT '{}', using {:?}", s, defaults.dialect);
                defaults.dialect
            }),
            Err(_) => defaults.dialect,
        };

        let max_page_size = env_parse("STAC_MAX_PAGE_SIZE")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.max_page_size);
        let default_page_size = env_parse("STAC_DEFAULT_PAGE_SIZE")
            .filter(|n: &usize| *n > 0)
            .unwrap_or(defaults.default_page_size)
            .min(max_page_size);

        let config = CatalogConfig {
            items_index_prefix: env::var("STAC_ITEMS_INDEX_PREFIX")
                .unwrap_or(defaults.items_index_prefix),
            collections_index: env::var("STAC_COLLECTIONS_INDEX")
                .unwrap_or(defaults.collections_index),
            default_page_size,
            max_page_size,
            max_result_window: env_parse("STAC_MAX_RESULT_WINDOW")
                .filter(|n: &usize| *n > 1)
                .unwrap_or(defaults.max_result_window),
            bulk_chunk_docs: env_parse("STAC_BULK_CHUNK_DOCS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.bulk_chunk_docs),
            bulk_chunk_bytes: env_parse("STAC_BULK_CHUNK_BYTES")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.bulk_chunk_bytes),
            retry: RetryPolicy {
                max_attempts: env_parse("STAC_RETRY_ATTEMPTS")
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: env_parse("STAC_RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: defaults.retry.max_delay,
            },
            refresh: RefreshPolicy {
                single: env_refresh("STAC_REFRESH_SINGLE").unwrap_or(defaults.refresh.single),
                bulk: env_refresh("STAC_REFRESH_BULK").unwrap_or(defaults.refresh.bulk),
            },
            cursor_secret,
            dialect,
        };
        tracing::info!("Loaded catalog config: {:?}", config);
        config
    }

    /// Largest page a search may return. Pages are fetched with one extra
    /// hit, which must still fit in the result window.
    pub fn page_size_limit(&self) -> usize {
        self.max_page_size
            .min(self.max_result_window.saturating_sub(1))
            .max(1)
    }

    /// Deterministic secret and no retry delays, for tests.
    pub fn for_tests() -> Self {
        CatalogConfig {
            cursor_secret: b"test-secret".to_vec(),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        }
    }
}
