// The storage engine entry point. Orchestrates codecs, the atomic writer,
// the index, collections, git checkpoints, and the watch/reconcile workers.

use crate::collection::{self, Collections};
use crate::document::{self, Document, Format, DOC_EXTENSIONS};
use crate::error::{Result, VaultError};
use crate::git::{Git, GitLock};
use crate::index::{Index, IndexEntry};
use crate::serializer::Registry;
use crate::transaction::Transaction;
use crate::value::{normalize_map_strict, Map};
use crate::watcher::{
    self, hash_bytes, ChangeEvent, ChangeKind, Debouncer, EventNormalizer, RestartPolicy,
    Supervisor, SuppressionMap, WatchHandle,
};
use crate::atomic;
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const INDEX_FILE: &str = "index.json";
const LOCK_MARKER: &str = "vault.lock";

/// Store configuration. The defaults match a plain writable git-backed
/// vault.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Name of the hidden directory holding the index and lock marker.
    pub system_dir: String,
    /// Nest JSON/YAML metadata under this key instead of the top level.
    pub metadata_key: Option<String>,
    /// Column addressing rows within collection files.
    pub id_column: String,
    /// Numeric-fidelity mode: all numeric metadata leaves become
    /// arbitrary-precision decimal strings, uniformly across formats.
    pub strict_numbers: bool,
    /// Skip every version-control step; writes stay atomic but
    /// uncheckpointed.
    pub gitless: bool,
    /// Reject all mutations; reconcile updates the cache in memory only.
    pub read_only: bool,
    /// Coalescing window for watch events.
    pub debounce: Duration,
    /// How long a self-write hash stays eligible for event suppression.
    pub suppression_ttl: Duration,
    /// Restart bounds for supervised watch workers.
    pub restart_policy: RestartPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            system_dir: ".vaultdb".to_string(),
            metadata_key: None,
            id_column: "id".to_string(),
            strict_numbers: false,
            gitless: false,
            read_only: false,
            debounce: watcher::DEFAULT_DEBOUNCE,
            suppression_ttl: watcher::DEFAULT_SUPPRESSION_TTL,
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Serialization point for checkpoints. Gitless stores fall back to a
/// store-local mutex so concurrent commits still order totally.
pub(crate) enum CommitGuard<'a> {
    Git(#[allow(dead_code)] GitLock<'a>),
    Local(#[allow(dead_code)] MutexGuard<'a, ()>),
}

/// The main entry point. Opens a vault root, manages the persistent index,
/// and turns document operations into atomic filesystem mutations plus git
/// checkpoints.
pub struct Store {
    root: PathBuf,
    options: StoreOptions,
    registry: Registry,
    collections: Collections,
    index: Index,
    git: Option<Git>,
    local_lock: Mutex<()>,
    suppression: SuppressionMap,
    watchers: AtomicUsize,
}

impl Store {
    /// Open a store at the given root with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        Store::open_with(path, StoreOptions::default())
    }

    /// Open a store, creating the root, system directory, and git
    /// repository as needed (unless read-only or gitless).
    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Store> {
        let root = path.as_ref().to_path_buf();
        let system_dir = root.join(&options.system_dir);

        if !options.read_only {
            std::fs::create_dir_all(&system_dir)?;
            let marker = system_dir.join(LOCK_MARKER);
            if !marker.exists() {
                std::fs::write(&marker, b"")?;
            }
        }

        let git = if options.gitless {
            None
        } else {
            let git = Git::new(&root);
            if !options.read_only {
                git.init()?;
                git.ensure_ignore(&options.system_dir)?;
            }
            Some(git)
        };

        let index = Index::load(&system_dir.join(INDEX_FILE));
        let registry = Registry::new(options.strict_numbers, options.metadata_key.clone());
        let collections = Collections::new(options.id_column.clone(), options.strict_numbers);
        let suppression = SuppressionMap::new(options.suppression_ttl);

        Ok(Store {
            root,
            options,
            registry,
            collections,
            index,
            git,
            local_lock: Mutex::new(()),
            suppression,
            watchers: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Whether at least one supervised watch worker is currently alive.
    pub fn is_watching(&self) -> bool {
        self.watchers.load(Ordering::SeqCst) > 0
    }

    // ── Single-document operations ─────────────────────────────────

    /// Save a document, checkpointing as `"update <id>"`.
    pub fn save(&self, doc: &Document) -> Result<()> {
        self.save_with_reason(doc, None)
    }

    pub fn save_with_reason(&self, doc: &Document, reason: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        Store::validate_id(&doc.id)?;
        let message = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("update {}", doc.id));

        if let Some(cref) = collection::target(&self.root, &doc.id) {
            let updates = BTreeMap::from([(cref.row_key.clone(), doc.clone())]);
            let bytes = self.collections.render(&cref, &updates, &BTreeSet::new())?;
            {
                let _guard = self.commit_guard()?;
                self.write_file(&cref.rel_path, &bytes)?;
                self.vcs_add_commit(&[cref.rel_path.clone()], &[], &message)?;
            }
            self.index_collection_file(&cref.rel_path, &bytes);
        } else {
            let (rel, format) = document::location(&doc.id, &doc.metadata);
            let bytes = self.registry.serialize(format, doc)?;
            {
                let _guard = self.commit_guard()?;
                self.write_file(&rel, &bytes)?;
                self.vcs_add_commit(&[rel.clone()], &[], &message)?;
            }
            self.index_plain(&rel, doc)?;
        }
        self.persist_index()
    }

    /// Fetch one document, constructed fresh from on-disk bytes. Falls back
    /// from the ID-derived path through smart extension probing to
    /// collection-row lookup.
    pub fn get(&self, id: &str) -> Result<Document> {
        Store::validate_id(id)?;
        if let Some((rel, format)) = self.locate_existing(id) {
            let bytes = std::fs::read(self.root.join(&rel))?;
            return self.registry.parse(format, id, &bytes);
        }
        if let Some(cref) = collection::find(&self.root, id) {
            return self.collections.get_row(&cref);
        }
        Err(VaultError::NotFound(id.to_string()))
    }

    /// List every document under the root. Direct-file entries are served
    /// from the index when fresh and carry no content; collection rows are
    /// flattened in addition to the direct entry for their file. Prunes
    /// index entries whose paths vanished.
    pub fn list(&self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        let mut visited = HashSet::new();

        for (abs, rel) in self.walk()? {
            let mtime = match mtime_of(&abs) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("skipping {rel}: {e}");
                    continue;
                }
            };
            visited.insert(rel.clone());

            match self.index.get(&rel, mtime) {
                Some(entry) => docs.push(Document {
                    id: entry.id,
                    content: String::new(),
                    metadata: entry.metadata,
                }),
                None => {
                    let format = Format::from_path(&abs).unwrap_or(Format::Markdown);
                    let derived = document::id_from_path(&rel);
                    match std::fs::read(&abs)
                        .map_err(VaultError::from)
                        .and_then(|bytes| self.registry.parse(format, &derived, &bytes))
                    {
                        Ok(mut doc) => {
                            let id = self.index.peek(&rel).map(|e| e.id).unwrap_or(doc.id);
                            doc.id = id.clone();
                            self.index.set(
                                &rel,
                                IndexEntry {
                                    id,
                                    metadata: doc.metadata.clone(),
                                    last_modified: mtime,
                                },
                            );
                            doc.content = String::new();
                            docs.push(doc);
                        }
                        Err(e) => {
                            log::warn!("failed to read document {rel}: {e}");
                            continue;
                        }
                    }
                }
            }

            match self.collections.list_rows(&abs, &rel) {
                Ok(rows) => docs.extend(rows),
                Err(e) => log::warn!("failed to flatten {rel}: {e}"),
            }
        }

        self.index.prune(&visited);
        if !self.options.read_only {
            self.persist_index()?;
        }
        Ok(docs)
    }

    /// Delete a document or collection row, checkpointing as
    /// `"delete <id>"`.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.delete_with_reason(id, None)
    }

    pub fn delete_with_reason(&self, id: &str, reason: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        Store::validate_id(id)?;
        let message = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("delete {id}"));

        if let Some((rel, _)) = self.locate_existing(id) {
            {
                let _guard = self.commit_guard()?;
                std::fs::remove_file(self.root.join(&rel))?;
                self.vcs_add_commit(&[], &[rel.clone()], &message)?;
            }
            self.index.remove(&rel);
            return self.persist_index();
        }

        if let Some(cref) = collection::find(&self.root, id) {
            let deletes = BTreeSet::from([cref.row_key.clone()]);
            let bytes = self.collections.render(&cref, &BTreeMap::new(), &deletes)?;
            {
                let _guard = self.commit_guard()?;
                self.write_file(&cref.rel_path, &bytes)?;
                self.vcs_add_commit(&[cref.rel_path.clone()], &[], &message)?;
            }
            self.index_collection_file(&cref.rel_path, &bytes);
            return self.persist_index();
        }

        Err(VaultError::NotFound(id.to_string()))
    }

    /// Begin a transaction. Staged state is owned by the caller and
    /// invisible to everyone else until commit.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Pull-then-push against the configured remote.
    pub fn sync(&self) -> Result<()> {
        self.ensure_writable()?;
        match &self.git {
            Some(git) => {
                let _guard = git.lock()?;
                git.sync()
            }
            None => {
                log::debug!("sync skipped in gitless mode");
                Ok(())
            }
        }
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Walk the tree once and diff it against the index: unknown paths are
    /// Creates, mtime mismatches are Modifies, and index entries whose path
    /// vanished are Deletes reported under their stored IDs. Per-file
    /// failures are logged and skipped; a stale cache beats a hard failure.
    pub fn reconcile(&self) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        let mut visited = HashSet::new();

        for (abs, rel) in self.walk()? {
            let mtime = match mtime_of(&abs) {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("reconcile: skipping {rel}: {e}");
                    continue;
                }
            };
            visited.insert(rel.clone());

            if self.index.get(&rel, mtime).is_some() {
                continue; // fresh
            }

            let format = Format::from_path(&abs).unwrap_or(Format::Markdown);
            let derived = document::id_from_path(&rel);
            let parsed = match std::fs::read(&abs)
                .map_err(VaultError::from)
                .and_then(|bytes| self.registry.parse(format, &derived, &bytes))
            {
                Ok(doc) => doc,
                Err(e) => {
                    log::warn!("reconcile: failed to parse {rel}: {e}");
                    continue;
                }
            };

            match self.index.peek(&rel) {
                Some(existing) => {
                    self.index.set(
                        &rel,
                        IndexEntry {
                            id: existing.id.clone(),
                            metadata: parsed.metadata,
                            last_modified: mtime,
                        },
                    );
                    events.push(ChangeEvent {
                        id: existing.id,
                        path: abs,
                        kind: ChangeKind::Modified,
                    });
                }
                None => {
                    self.index.set(
                        &rel,
                        IndexEntry {
                            id: derived.clone(),
                            metadata: parsed.metadata,
                            last_modified: mtime,
                        },
                    );
                    events.push(ChangeEvent {
                        id: derived,
                        path: abs,
                        kind: ChangeKind::Created,
                    });
                }
            }
        }

        for (rel, entry) in self.index.prune(&visited) {
            events.push(ChangeEvent {
                id: entry.id,
                path: self.root.join(rel),
                kind: ChangeKind::Deleted,
            });
        }

        if !self.options.read_only {
            if let Err(e) = self.index.save() {
                log::warn!("reconcile: failed to persist index: {e}");
            }
        }
        Ok(events)
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Start a supervised watch worker delivering debounced change events
    /// for documents matching `pattern` (a glob over relative paths; empty
    /// matches everything). The returned handle is the cancellation signal.
    pub fn watch(self: Arc<Self>, pattern: &str) -> Result<WatchHandle> {
        let pattern = if pattern.is_empty() { "**/*" } else { pattern };
        let compiled = glob::Pattern::new(pattern)
            .map_err(|e| VaultError::Validation(format!("bad watch pattern: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        self.watchers.fetch_add(1, Ordering::SeqCst);
        let store = self;

        let thread = std::thread::spawn(move || {
            let mut supervisor = Supervisor::new(store.options.restart_policy.clone());
            loop {
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                supervisor.started();
                let session_start = Instant::now();
                let result = store.run_watch_session(&compiled, &event_tx, &worker_stop);
                match result {
                    Ok(()) => break, // stop requested or receiver gone
                    Err(e) => {
                        log::warn!("watch worker failed: {e}");
                        match supervisor.failed(session_start.elapsed()) {
                            Some(delay) => {
                                sleep_unless_stopped(delay, &worker_stop);
                                supervisor.restarting();
                            }
                            None => {
                                log::warn!("watch worker exhausted its restart budget; stopping");
                                break;
                            }
                        }
                    }
                }
            }
            store.watchers.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(WatchHandle::new(event_rx, stop, thread))
    }

    /// One watch session: subscribe, filter, suppress self-writes, pause
    /// while git holds its index lock, and hand survivors to the debouncer.
    /// Returns Ok when asked to stop, Err on a watcher fault (which the
    /// supervisor turns into a restart).
    fn run_watch_session(
        &self,
        pattern: &glob::Pattern,
        out: &mpsc::Sender<ChangeEvent>,
        stop: &AtomicBool,
    ) -> Result<()> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let mut fs_watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| VaultError::Watch(e.to_string()))?;
        fs_watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| VaultError::Watch(e.to_string()))?;

        let debouncer = Debouncer::spawn(self.options.debounce, out.clone());
        let git_lock_path = self.git.as_ref().map(|g| g.lock_file_path());
        let mut git_locked = false;
        let mut normalizer = EventNormalizer::new(watcher::RENAME_PAIR_WINDOW);

        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match notify_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(event)) => {
                    for (path, kind) in normalizer.normalize(&event) {
                        if git_lock_path.as_deref() == Some(path.as_path()) {
                            match kind {
                                // git is mutating its index: hold all
                                // normal emission until the lock clears.
                                ChangeKind::Created | ChangeKind::Modified => git_locked = true,
                                ChangeKind::Deleted => {
                                    git_locked = false;
                                    match self.reconcile() {
                                        Ok(recovered) => {
                                            // Recovered events obey the same
                                            // pattern and debounce rules as
                                            // live ones.
                                            for ev in recovered {
                                                let Some(rel) = rel_string(&self.root, &ev.path)
                                                else {
                                                    continue;
                                                };
                                                if pattern.matches(&rel) {
                                                    debouncer.submit(ev);
                                                }
                                            }
                                        }
                                        Err(e) => {
                                            log::warn!("post-unlock reconcile failed: {e}")
                                        }
                                    }
                                }
                            }
                            continue;
                        }
                        if git_locked {
                            continue;
                        }
                        if !document::is_document_file(&path) {
                            continue;
                        }
                        let Some(rel) = rel_string(&self.root, &path) else {
                            continue;
                        };
                        if self.is_system_path(&rel) {
                            continue;
                        }
                        if !pattern.matches(&rel) {
                            continue;
                        }
                        if matches!(kind, ChangeKind::Created | ChangeKind::Modified)
                            && self.suppression.should_suppress(&path)
                        {
                            continue;
                        }
                        let id = match kind {
                            ChangeKind::Deleted => self
                                .index
                                .peek(&rel)
                                .map(|e| e.id)
                                .unwrap_or_else(|| document::id_from_path(&rel)),
                            _ => document::id_from_path(&rel),
                        };
                        debouncer.submit(ChangeEvent { id, path, kind });
                    }
                }
                Ok(Err(e)) => {
                    log::warn!("file watcher error: {e}");
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(VaultError::Watch("notify channel closed".to_string()));
                }
            }
        }
    }

    // ── Internals shared with Transaction ──────────────────────────

    pub(crate) fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(VaultError::Validation(
                "document ID must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(VaultError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn collections(&self) -> &Collections {
        &self.collections
    }

    /// Register the self-write hash and write through the atomic writer.
    pub(crate) fn write_file(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let abs = self.root.join(rel);
        self.suppression.record(&abs, hash_bytes(bytes));
        atomic::write(&abs, bytes, 0o644)
    }

    /// Stage and checkpoint. Assumes the commit guard is already held.
    pub(crate) fn vcs_add_commit(
        &self,
        added: &[String],
        removed: &[String],
        message: &str,
    ) -> Result<()> {
        if let Some(git) = &self.git {
            git.add(added)?;
            git.remove(removed)?;
            git.commit(message)?;
        }
        Ok(())
    }

    pub(crate) fn commit_guard(&self) -> Result<CommitGuard<'_>> {
        match &self.git {
            Some(git) => Ok(CommitGuard::Git(git.lock()?)),
            None => self
                .local_lock
                .lock()
                .map(CommitGuard::Local)
                .map_err(|_| VaultError::Lock("commit lock poisoned".to_string())),
        }
    }

    /// Index a plain document file that was just written.
    pub(crate) fn index_plain(&self, rel: &str, doc: &Document) -> Result<()> {
        let mtime = mtime_of(&self.root.join(rel))?;
        let mut metadata = doc.metadata.clone();
        if self.registry.strict() {
            normalize_map_strict(&mut metadata);
        }
        self.index.set(
            rel,
            IndexEntry {
                id: doc.id.clone(),
                metadata,
                last_modified: mtime,
            },
        );
        Ok(())
    }

    /// Index a collection file under its direct-file identity. Cache
    /// staleness here is tolerable; the next list/reconcile pass repairs it.
    pub(crate) fn index_collection_file(&self, rel: &str, bytes: &[u8]) {
        let mtime = match mtime_of(&self.root.join(rel)) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("failed to stat {rel}: {e}");
                return;
            }
        };
        let derived = document::id_from_path(rel);
        let format = Format::from_path(Path::new(rel)).unwrap_or(Format::Markdown);
        let metadata = self
            .registry
            .parse(format, &derived, bytes)
            .map(|doc| doc.metadata)
            .unwrap_or_default();
        self.index.set(
            rel,
            IndexEntry {
                id: derived,
                metadata,
                last_modified: mtime,
            },
        );
    }

    pub(crate) fn index_remove(&self, rel: &str) {
        self.index.remove(rel);
    }

    pub(crate) fn persist_index(&self) -> Result<()> {
        self.index.save()
    }

    /// Find the existing file backing an ID: the derived path first, then
    /// smart extension probing for extension-less IDs.
    pub(crate) fn locate_existing(&self, id: &str) -> Option<(String, Format)> {
        let (rel, format) = document::location(id, &Map::new());
        if self.root.join(&rel).is_file() {
            return Some((rel, format));
        }
        if Format::from_path(Path::new(id)).is_none() {
            for ext in DOC_EXTENSIONS.iter().skip(1) {
                let Some(format) = Format::from_extension(ext) else {
                    continue;
                };
                let candidate = format!("{id}.{ext}");
                if self.root.join(&candidate).is_file() {
                    return Some((candidate, format));
                }
            }
        }
        None
    }

    // ── Walking ────────────────────────────────────────────────────

    fn walk(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        for ext in DOC_EXTENSIONS {
            let pattern = format!("{}/**/*.{}", self.root.display(), ext);
            let matches = glob::glob(&pattern)
                .map_err(|e| VaultError::Other(format!("glob error: {e}")))?;
            for abs in matches.flatten() {
                if !abs.is_file() {
                    continue;
                }
                let Some(rel) = rel_string(&self.root, &abs) else {
                    continue;
                };
                if self.is_system_path(&rel) {
                    continue;
                }
                files.push((abs, rel));
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn is_system_path(&self, rel: &str) -> bool {
        let system = &self.options.system_dir;
        rel == system.as_str()
            || rel.starts_with(&format!("{system}/"))
            || rel == ".git"
            || rel.starts_with(".git/")
    }
}

fn mtime_of(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

fn rel_string(root: &Path, abs: &Path) -> Option<String> {
    abs.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stop.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(step.min(remaining));
    }
}
