//! Sync Client Module
//!
//! Context object that owns the token store, request pipeline, query cache
//! and mutation executor, and exposes the read and write doors.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{FileSlots, MemorySlots, TokenStore, UserRecord};
use crate::config::Config;
use crate::error::{MutationError, Result};
use crate::http::RequestPipeline;
use crate::models::LoginRequest;
use crate::mutation::{InvalidationPropagator, MutationExecutor, MutationOptions};
use crate::query::{QueryCache, QueryKey, QueryOptions, QueryState};
use crate::tasks::spawn_gc_task;

/// Cache key the signed-in user's record is kept under.
pub const USER_KEY: &str = "user";

// == Sync Client ==
/// Process-wide handle to the synchronization layer.
///
/// Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct SyncClient {
    config: Arc<Config>,
    tokens: Arc<TokenStore>,
    pipeline: Arc<RequestPipeline>,
    cache: QueryCache,
    mutations: MutationExecutor,
    gc_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncClient {
    // == Lifecycle ==
    /// Builds a client, restoring any persisted session from `token_dir`.
    ///
    /// If the token directory cannot be opened the session lives in memory
    /// only for this process.
    pub fn init(config: Config) -> Result<Self> {
        let tokens = match FileSlots::open(&config.token_dir) {
            Ok(slots) => TokenStore::load(slots),
            Err(e) => {
                warn!(
                    "Cannot open token directory {}, keeping session in memory: {}",
                    config.token_dir.display(),
                    e
                );
                TokenStore::load(MemorySlots::new())
            }
        };
        Self::with_tokens(config, tokens)
    }

    /// Builds a client around an existing token store.
    pub fn with_tokens(config: Config, tokens: TokenStore) -> Result<Self> {
        let tokens = Arc::new(tokens);
        let pipeline = Arc::new(RequestPipeline::new(&config, tokens.clone())?);
        let cache = QueryCache::new(config.stale_time(), config.gc_time());
        let propagator = InvalidationPropagator::new(cache.clone());
        let mutations = MutationExecutor::new(cache.clone(), propagator);

        info!(
            "Sync client ready: base_url={}, stale_time={}ms, gc_time={}ms",
            config.api_base_url, config.stale_time_ms, config.gc_time_ms
        );

        Ok(Self {
            config: Arc::new(config),
            tokens,
            pipeline,
            cache,
            mutations,
            gc_handle: Arc::new(Mutex::new(None)),
        })
    }

    /// Starts the background gc task, replacing one already running.
    pub fn spawn_gc(&self) {
        let handle = spawn_gc_task(self.cache.clone(), self.config.gc_interval);
        if let Some(previous) = self.gc_handle.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops background work. Cached data and the session are kept.
    pub fn teardown(&self) {
        if let Some(handle) = self.gc_handle.lock().take() {
            handle.abort();
            info!("Cache gc task stopped");
        }
    }

    // == Accessors ==
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn propagator(&self) -> &InvalidationPropagator {
        self.mutations.propagator()
    }

    // == Read Door ==
    /// Cached read of `key`, fetching through `fetcher` when absent or stale.
    pub fn query<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions) -> QueryState<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.cache.read(key, fetcher, options)
    }

    /// Awaitable form of [`query`](Self::query).
    pub async fn fetch_query<T, F, Fut>(&self, key: &QueryKey, fetcher: F, options: QueryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.cache.fetch(key, fetcher, options).await
    }

    /// Cached read of `key` backed by `GET path`.
    pub fn query_path<T>(&self, key: &QueryKey, path: impl Into<String>, options: QueryOptions) -> QueryState<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.cache.read(key, self.path_fetcher(path.into()), options)
    }

    /// Awaitable form of [`query_path`](Self::query_path).
    pub async fn fetch_path<T>(&self, key: &QueryKey, path: impl Into<String>, options: QueryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.cache
            .fetch(key, self.path_fetcher(path.into()), options)
            .await
    }

    fn path_fetcher<T>(
        &self,
        path: String,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<T>> + Send + Sync + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        use futures::FutureExt;

        let pipeline = self.pipeline.clone();
        let path: Arc<str> = path.into();
        move || {
            let pipeline = pipeline.clone();
            let path = path.clone();
            async move { pipeline.get::<T>(&path).await }.boxed()
        }
    }

    // == Write Door ==
    /// Runs a write through the mutation executor.
    pub async fn mutate<V, R, F, Fut>(
        &self,
        write: F,
        variables: V,
        options: MutationOptions<V, R>,
    ) -> std::result::Result<R, MutationError>
    where
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.mutations.mutate(write, variables, options).await
    }

    /// Marks everything under `prefixes` (and their cascades) stale.
    pub fn invalidate(&self, prefixes: &[QueryKey]) -> usize {
        self.mutations.propagator().propagate(prefixes)
    }

    // == Session ==
    /// Signs in. The returned user, if any, is also cached under [`USER_KEY`].
    pub async fn login(&self, email: &str, password: &str) -> Result<Option<UserRecord>> {
        let user = self
            .pipeline
            .login(&LoginRequest::new(email, password))
            .await?;
        if let Some(user) = &user {
            let record = user.clone();
            self.cache
                .write(&QueryKey::new(USER_KEY), move |_: Option<UserRecord>| record)?;
        }
        Ok(user)
    }

    /// Signs out and drops every cached read, so nothing from this session
    /// leaks into the next one.
    pub async fn logout(&self) -> Result<()> {
        let outcome = self.pipeline.logout().await;
        self.cache.clear();
        outcome
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.tokens.user()
    }

    /// True when both a credential pair and a user record are present.
    pub fn is_authenticated(&self) -> bool {
        self.tokens.get().is_some() && self.tokens.user().is_some()
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("base_url", &self.config.api_base_url)
            .field("cache", &self.cache)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}
