//! Folder watching and ingestion: observe directories, de-duplicate by
//! content hash, and upload through the document pipeline.
//!
//! Each watched folder is scanned once at startup (same de-duplication as
//! live events) before its observer is armed. Events are debounced and
//! processed serially per folder. A file whose MD5 already exists in the
//! store is skipped; ingestion failures retry with linear backoff except
//! for skipped documents, which are terminal.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatchedFolderConfig;
use crate::error::{HarnessError, Result};
use crate::extract;
use crate::ingest::Ingestor;
use crate::models::meta_keys;

const DEBOUNCE: Duration = Duration::from_millis(700);

pub struct FileWatcher {
    ingestor: Arc<Ingestor>,
    folders: Vec<WatchedFolderConfig>,
    base_dir: PathBuf,
}

/// Keeps observers and event pumps alive; dropping it releases them.
pub struct WatcherHandle {
    _watchers: Vec<RecommendedWatcher>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl FileWatcher {
    pub fn new(ingestor: Arc<Ingestor>, folders: Vec<WatchedFolderConfig>, base_dir: PathBuf) -> Self {
        Self {
            ingestor,
            folders,
            base_dir,
        }
    }

    /// Scan existing files, then arm live observers.
    pub async fn start(&self) -> Result<WatcherHandle> {
        let mut watchers = Vec::new();
        let mut tasks = Vec::new();

        for folder in &self.folders {
            let root = resolve_watch_path(&self.base_dir, &folder.path)?;
            std::fs::create_dir_all(&root)?;

            self.scan_existing(&root, folder).await;

            let (tx, rx) = mpsc::channel::<Event>(256);
            let mut watcher =
                notify::recommended_watcher(move |result: notify::Result<Event>| {
                    if let Ok(event) = result {
                        let _ = tx.blocking_send(event);
                    }
                })
                .map_err(|e| HarnessError::provider(format!("watcher init: {e}")))?;

            let mode = if folder.subdirectories {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(&root, mode)
                .map_err(|e| HarnessError::provider(format!("watch {}: {e}", root.display())))?;

            info!(folder = %root.display(), recursive = folder.subdirectories, "watcher armed");
            watchers.push(watcher);
            tasks.push(tokio::spawn(pump_events(
                rx,
                self.ingestor.clone(),
                folder.clone(),
            )));
        }

        Ok(WatcherHandle {
            _watchers: watchers,
            tasks,
        })
    }

    /// De-duplicating pass over files already present in the folder.
    pub async fn scan_existing(&self, root: &Path, folder: &WatchedFolderConfig) {
        let max_depth = if folder.subdirectories { usize::MAX } else { 1 };
        let files: Vec<PathBuf> = WalkDir::new(root)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();

        for path in files {
            process_file(&self.ingestor, &path, folder).await;
        }
    }
}

async fn pump_events(mut rx: mpsc::Receiver<Event>, ingestor: Arc<Ingestor>, folder: WatchedFolderConfig) {
    let mut last_handled: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

    while let Some(event) = rx.recv().await {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in event.paths {
            if let Some(at) = last_handled.get(&path) {
                if at.elapsed() < DEBOUNCE * 2 {
                    continue;
                }
            }
            // Let the writer finish before hashing.
            tokio::time::sleep(DEBOUNCE).await;
            if !path.is_file() {
                continue;
            }
            process_file(&ingestor, &path, &folder).await;
            last_handled.insert(path, tokio::time::Instant::now());
        }
    }
}

/// Filter, hash, de-duplicate, and upload one file with retries.
async fn process_file(ingestor: &Ingestor, path: &Path, folder: &WatchedFolderConfig) {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = extract::extension_of(&filename);

    if !extract::is_supported(&ext) {
        return;
    }
    if !folder.allowed_extensions.is_empty()
        && !folder
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    {
        return;
    }

    let hash = match hash_file(path).await {
        Ok(hash) => hash,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "hashing failed");
            return;
        }
    };

    match ingestor.store().find_by_file_hash(&hash).await {
        Ok(Some(existing)) => {
            info!(
                file = %path.display(),
                duplicate_of = %existing.id,
                "skip duplicate"
            );
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(file = %path.display(), error = %e, "duplicate lookup failed");
            return;
        }
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "read failed");
            return;
        }
    };

    let mut metadata = HashMap::new();
    metadata.insert(meta_keys::FILE_HASH.to_string(), hash);
    metadata.insert(
        meta_keys::FILE_PATH.to_string(),
        path.to_string_lossy().into_owned(),
    );

    let attempts = folder.max_retry_attempts.max(1);
    for attempt in 1..=attempts {
        match ingestor
            .ingest_bytes(&filename, &bytes, "file-watcher", None, metadata.clone())
            .await
        {
            Ok(document) => {
                debug!(file = %path.display(), document = %document.id, "watched file ingested");
                return;
            }
            Err(HarnessError::DocumentSkipped(reason)) => {
                info!(file = %path.display(), reason = %reason, "file not indexable, giving up");
                return;
            }
            Err(e) if attempt < attempts => {
                warn!(file = %path.display(), attempt, error = %e, "ingest failed, retrying");
                tokio::time::sleep(Duration::from_millis(
                    folder.retry_delay_ms * attempt as u64,
                ))
                .await;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "ingest failed permanently");
                return;
            }
        }
    }
}

/// MD5 over streamed 4 KiB blocks, rendered as lowercase hex.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Resolve and confine a configured watch path.
///
/// Relative paths live under `base_dir`. Absolute paths must stay inside
/// the user's home directory. `..` components are rejected outright.
pub fn resolve_watch_path(base_dir: &Path, configured: &Path) -> Result<PathBuf> {
    if configured
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(HarnessError::validation(format!(
            "watched path must not contain '..': {}",
            configured.display()
        )));
    }

    if configured.is_absolute() {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| HarnessError::validation("cannot confine absolute path: no home directory"))?;
        if !configured.starts_with(&home) {
            return Err(HarnessError::validation(format!(
                "absolute watched path must be inside {}",
                home.display()
            )));
        }
        return Ok(configured.to_path_buf());
    }

    Ok(base_dir.join(configured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiConfig, AiProviderConfig, ChunkingConfig, RetryPolicyKind};
    use crate::providers::AiGateway;
    use crate::store::{self, DocumentStore};
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ingestor(base_url: &str) -> Arc<Ingestor> {
        let pool = store::connect_in_memory().await.unwrap();
        store::run_migrations(&pool).await.unwrap();
        Arc::new(Ingestor::new(
            DocumentStore::new(pool),
            Arc::new(
                AiGateway::new(&AiConfig {
                    primary: AiProviderConfig {
                        provider: "openai".into(),
                        model: "m".into(),
                        embedding_model: "e".into(),
                        base_url: Some(base_url.to_string()),
                        api_key_env: None,
                        system_message: None,
                        timeout_secs: 5,
                        embedding_min_interval_ms: 0,
                        embedding_batch_size: 8,
                    },
                    max_retry_attempts: 1,
                    retry_delay_ms: 1,
                    retry_policy: RetryPolicyKind::Fixed,
                    enable_fallback_providers: false,
                    fallback: vec![],
                })
                .unwrap(),
            ),
            ChunkingConfig::default(),
        ))
    }

    fn folder_config(path: &Path) -> WatchedFolderConfig {
        WatchedFolderConfig {
            path: path.to_path_buf(),
            subdirectories: false,
            allowed_extensions: vec![],
            max_retry_attempts: 2,
            retry_delay_ms: 1,
        }
    }

    async fn failing_embed_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(url_path("/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_startup_scan_deduplicates_identical_files() {
        let server = failing_embed_server().await;
        let ingestor = ingestor(&server.uri()).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "identical content for hashing").unwrap();
        std::fs::write(dir.path().join("b.txt"), "identical content for hashing").unwrap();

        let folder = folder_config(dir.path());
        let watcher = FileWatcher::new(ingestor.clone(), vec![folder.clone()], dir.path().into());
        watcher.scan_existing(dir.path(), &folder).await;

        // Two files, one hash, exactly one document.
        assert_eq!(ingestor.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_respects_allowed_extensions() {
        let server = failing_embed_server().await;
        let ingestor = ingestor(&server.uri()).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.md"), "# markdown body").unwrap();
        std::fs::write(dir.path().join("drop.txt"), "text body").unwrap();

        let mut folder = folder_config(dir.path());
        folder.allowed_extensions = vec!["md".into()];
        let watcher = FileWatcher::new(ingestor.clone(), vec![folder.clone()], dir.path().into());
        watcher.scan_existing(dir.path(), &folder).await;

        let docs = ingestor.store().list(0, 10, false).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].filename, "keep.md");
    }

    #[tokio::test]
    async fn test_scan_skips_unsupported_files_without_retry() {
        let server = failing_embed_server().await;
        let ingestor = ingestor(&server.uri()).await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8; 16]).unwrap();

        let folder = folder_config(dir.path());
        let watcher = FileWatcher::new(ingestor.clone(), vec![folder.clone()], dir.path().into());
        watcher.scan_existing(dir.path(), &folder).await;
        assert_eq!(ingestor.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_file_lowercase_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash me.txt");
        std::fs::write(&path, b"hello").unwrap();
        let hash = hash_file(&path).await.unwrap();
        // Well-known MD5 of "hello".
        assert_eq!(hash, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_path_traversal_rejected() {
        let base = PathBuf::from("/srv/rag");
        let err = resolve_watch_path(&base, Path::new("../etc")).unwrap_err();
        assert!(matches!(err, HarnessError::Validation(_)));

        let ok = resolve_watch_path(&base, Path::new("data/incoming")).unwrap();
        assert_eq!(ok, PathBuf::from("/srv/rag/data/incoming"));
    }

    #[test]
    fn test_absolute_path_confined_to_home() {
        let base = PathBuf::from("/srv/rag");
        // Absolute paths outside the home directory are rejected.
        let err = resolve_watch_path(&base, Path::new("/etc/passwd-folder"));
        assert!(err.is_err());
    }
}
