//! The cache facade: a uniform interface over the content-addressed
//! blob store and the two-phase fingerprint store.
//!
//! The facade owns one backend for the lifetime of an engine schedule
//! and hands out session-scoped views. Backend initialization is
//! asynchronous; the first caller to wait pays (and logs) the wait
//! latency, with a periodic watchdog note while initialization drags.
//! Sessions are closed in reverse acquisition order.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use rusqlite::{Connection, params};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    bundle::PipGraphCacheDescriptor,
    fs,
    hash::{ContentHash, Fingerprint},
};

/// Watchdog period while waiting for cache initialization.
const INIT_WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// Which of the requested hashes the cache can currently serve.
#[derive(Clone, Debug, Default)]
pub struct ContentAvailability {
    pub available: Vec<ContentHash>,
    pub missing: Vec<ContentHash>,
}

impl ContentAvailability {
    pub fn is_all_available(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Capability interface over a content-addressed store with an attached
/// fingerprint → descriptor table.
///
/// The blob store itself is an external collaborator; the engine core
/// ships a filesystem-backed implementation and consumes everything
/// through this trait.
pub trait ContentCache: Send + Sync + 'static {
    /// Store a file's bytes, returning their content hash.
    fn store_content(&self, path: &Path) -> impl Future<Output = Result<ContentHash>> + Send;

    /// Report availability of the given hashes.
    fn load_content(
        &self,
        hashes: &[ContentHash],
    ) -> impl Future<Output = Result<ContentAvailability>> + Send;

    /// Realize the blob with the given hash at `path` (hard-link where
    /// the filesystem allows). `false` when the blob is unknown.
    fn materialize(
        &self,
        path: &Path,
        hash: &ContentHash,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Store a descriptor under a fingerprint key.
    fn store_descriptor(
        &self,
        fingerprint: &Fingerprint,
        descriptor: &PipGraphCacheDescriptor,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Look up a descriptor by fingerprint key.
    fn lookup_descriptor(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Option<PipGraphCacheDescriptor>>> + Send;
}

/// Filesystem CAS plus a SQLite descriptor table, the local-only backend.
pub struct LocalContentCache {
    cas_dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for LocalContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContentCache")
            .field("cas_dir", &self.cas_dir)
            .finish()
    }
}

impl LocalContentCache {
    /// Open (or create) a cache rooted at `root`. Blobs live under
    /// `cas/`; the two-phase descriptor state lives in its conventional
    /// directory.
    #[instrument]
    pub async fn open(root: &Path) -> Result<Self> {
        let cas_dir = root.join("cas");
        fs::create_dir_all(&cas_dir).await?;

        let metadata_dir = root.join(crate::config::cache_paths::HISTORIC_METADATA_CACHE);
        fs::create_dir_all(&metadata_dir).await?;
        let db_path = metadata_dir.join("descriptors.sqlite");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open descriptor database at {db_path:?}"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS descriptors (
                fingerprint TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            "#,
        )
        .context("initialize descriptor schema")?;

        trace!(?root, "opened local content cache");
        Ok(Self {
            cas_dir,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.cas_dir.join(hash.to_hex())
    }
}

impl ContentCache for LocalContentCache {
    async fn store_content(&self, path: &Path) -> Result<ContentHash> {
        let hash = fs::must_hash_file(path).await?;
        let blob = self.blob_path(&hash);
        if !fs::exists(&blob).await {
            fs::hard_link_or_copy(path, &blob).await?;
        }
        trace!(%hash, ?path, "stored content");
        Ok(hash)
    }

    async fn load_content(&self, hashes: &[ContentHash]) -> Result<ContentAvailability> {
        let mut availability = ContentAvailability::default();
        for hash in hashes {
            if fs::exists(&self.blob_path(hash)).await {
                availability.available.push(*hash);
            } else {
                availability.missing.push(*hash);
            }
        }
        Ok(availability)
    }

    async fn materialize(&self, path: &Path, hash: &ContentHash) -> Result<bool> {
        let blob = self.blob_path(hash);
        if !fs::exists(&blob).await {
            return Ok(false);
        }
        fs::hard_link_or_copy(&blob, path).await?;
        Ok(true)
    }

    async fn store_descriptor(
        &self,
        fingerprint: &Fingerprint,
        descriptor: &PipGraphCacheDescriptor,
    ) -> Result<()> {
        let data = serde_json::to_string(descriptor).context("serialize descriptor")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO descriptors (fingerprint, data) VALUES (?1, ?2)",
            params![fingerprint.to_hex(), data],
        )
        .context("insert descriptor")?;
        Ok(())
    }

    async fn lookup_descriptor(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PipGraphCacheDescriptor>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT data FROM descriptors WHERE fingerprint = ?1")
            .context("prepare descriptor query")?;
        let mut rows = stmt
            .query(params![fingerprint.to_hex()])
            .context("query descriptor")?;
        let Some(row) = rows.next().context("read descriptor row")? else {
            return Ok(None);
        };
        let data: String = row.get(0).context("read descriptor data")?;
        serde_json::from_str(&data)
            .context("deserialize descriptor")
            .map(Some)
    }
}

struct FacadeState<C: ContentCache> {
    backend: tokio::sync::OnceCell<Arc<C>>,
    init: StdMutex<Option<JoinHandle<Result<C>>>>,
    init_started: Instant,
    first_wait_logged: AtomicBool,
    sessions: StdMutex<Vec<(u64, String)>>,
    next_session: AtomicU64,
}

/// Owns the cache backend for the lifetime of an engine schedule.
pub struct CacheFacade<C: ContentCache> {
    state: Arc<FacadeState<C>>,
}

impl<C: ContentCache> Clone for CacheFacade<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: ContentCache> CacheFacade<C> {
    /// Begin initializing the backend. Returns immediately; the first
    /// call that needs the backend waits for (and times) the
    /// initialization.
    pub fn start(init: impl Future<Output = Result<C>> + Send + 'static) -> Self {
        let handle = tokio::spawn(init);
        Self {
            state: Arc::new(FacadeState {
                backend: tokio::sync::OnceCell::new(),
                init: StdMutex::new(Some(handle)),
                init_started: Instant::now(),
                first_wait_logged: AtomicBool::new(false),
                sessions: StdMutex::new(Vec::new()),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Wrap an already-initialized backend (tests, trivial embeddings).
    pub fn ready(backend: C) -> Self {
        let cell = tokio::sync::OnceCell::new();
        cell.set(Arc::new(backend)).ok().expect("fresh cell");
        Self {
            state: Arc::new(FacadeState {
                backend: cell,
                init: StdMutex::new(None),
                init_started: Instant::now(),
                first_wait_logged: AtomicBool::new(true),
                sessions: StdMutex::new(Vec::new()),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    async fn backend(&self) -> Result<Arc<C>> {
        let state = &self.state;
        let backend = state
            .backend
            .get_or_try_init(|| async {
                let mut handle = state
                    .init
                    .lock()
                    .expect("init lock")
                    .take()
                    .ok_or_eyre("cache initialization already consumed")?;

                let wait_started = Instant::now();
                let mut watchdog = tokio::time::interval(INIT_WATCHDOG_PERIOD);
                watchdog.tick().await; // first tick completes immediately

                let backend = loop {
                    tokio::select! {
                        result = &mut handle => {
                            break result.context("join cache initialization")??;
                        }
                        _ = watchdog.tick() => {
                            info!(
                                elapsed = ?state.init_started.elapsed(),
                                "cache is still initializing"
                            );
                        }
                    }
                };

                if !state.first_wait_logged.swap(true, Ordering::SeqCst) {
                    debug!(
                        waited = ?wait_started.elapsed(),
                        since_start = ?state.init_started.elapsed(),
                        "first wait for cache initialization"
                    );
                }
                Ok::<_, color_eyre::Report>(Arc::new(backend))
            })
            .await?;
        Ok(Arc::clone(backend))
    }

    /// Create a session-scoped view for one consumer.
    #[instrument(skip(self))]
    pub async fn create_for_context(&self, name: &str) -> Result<CacheSession<C>> {
        let backend = self.backend().await?;
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
        self.state
            .sessions
            .lock()
            .expect("session lock")
            .push((id, name.to_owned()));
        trace!(id, name, "opened cache session");
        Ok(CacheSession {
            id,
            name: name.to_owned(),
            backend,
            state: Arc::clone(&self.state),
        })
    }

    /// Close all remaining sessions in reverse acquisition order.
    /// Returns the closed session names, newest first.
    pub fn close_sessions(&self) -> Vec<String> {
        let mut sessions = self.state.sessions.lock().expect("session lock");
        let mut closed: Vec<String> = Vec::with_capacity(sessions.len());
        while let Some((id, name)) = sessions.pop() {
            trace!(id, %name, "closed cache session");
            closed.push(name);
        }
        closed
    }
}

/// A session-scoped view of the cache.
pub struct CacheSession<C: ContentCache> {
    id: u64,
    name: String,
    backend: Arc<C>,
    state: Arc<FacadeState<C>>,
}

impl<C: ContentCache> std::fmt::Debug for CacheSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<C: ContentCache> CacheSession<C> {
    pub async fn try_store_content(&self, path: &Path) -> Result<ContentHash> {
        self.backend.store_content(path).await
    }

    pub async fn try_load_content(&self, hashes: &[ContentHash]) -> Result<ContentAvailability> {
        self.backend.load_content(hashes).await
    }

    pub async fn try_materialize(&self, path: &Path, hash: &ContentHash) -> Result<bool> {
        self.backend.materialize(path, hash).await
    }

    pub async fn try_store_descriptor(
        &self,
        fingerprint: &Fingerprint,
        descriptor: &PipGraphCacheDescriptor,
    ) -> Result<()> {
        self.backend.store_descriptor(fingerprint, descriptor).await
    }

    pub async fn try_lookup_descriptor(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PipGraphCacheDescriptor>> {
        self.backend.lookup_descriptor(fingerprint).await
    }

    /// Store the descriptor under both the input-based fingerprint and
    /// the graph-content fingerprint, so either key retrieves it.
    #[instrument(skip(self, descriptor))]
    pub async fn try_store_two_phase(
        &self,
        input_fingerprint: &Fingerprint,
        content_fingerprint: &Fingerprint,
        descriptor: &PipGraphCacheDescriptor,
    ) -> Result<()> {
        self.backend
            .store_descriptor(input_fingerprint, descriptor)
            .await?;
        self.backend
            .store_descriptor(content_fingerprint, descriptor)
            .await
    }

    /// Look up a descriptor by either of its two-phase keys.
    pub async fn try_lookup_two_phase(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PipGraphCacheDescriptor>> {
        self.backend.lookup_descriptor(fingerprint).await
    }

    /// Close this session, removing it from the facade's registry.
    pub fn close(self) {
        let mut sessions = self.state.sessions.lock().expect("session lock");
        if let Some(pos) = sessions.iter().position(|(id, _)| *id == self.id) {
            let (id, name) = sessions.remove(pos);
            trace!(id, %name, "closed cache session");
        } else {
            warn!(id = self.id, "cache session was already closed");
        }
    }
}

/// Convenience: open a local cache facade rooted under a directory.
pub fn open_local_facade(root: &Path) -> CacheFacade<LocalContentCache> {
    let root = root.to_owned();
    CacheFacade::start(async move { LocalContentCache::open(&root).await })
}
