// Watch-side building blocks: event vocabulary, per-document debouncing,
// self-write suppression, and the supervisor state machine that keeps a
// watch worker alive. The worker loop itself lives in the store.

use notify::event::{ModifyKind, RenameMode};
use notify::EventKind;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default coalescing window for rapid repeated changes to one document.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// How long a recorded self-write hash stays eligible for suppression.
pub const DEFAULT_SUPPRESSION_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A change to one document, observed on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Map a raw notify event onto the store's vocabulary. A rename-to is the
/// path appearing (this is how an atomic temp-file rename lands on the
/// target); every other rename direction is a deletion.
pub fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Deleted),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// How long a lone rename half stays on record for pairing against the
/// merged `Name(Both)` delivery of the same rename.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// Turns raw notify events into per-path change kinds, collapsing the
/// duplicated rename delivery some backends produce.
///
/// inotify reports one rename as lone `Name(From)` / `Name(To)` events plus
/// a merged `Name(Both)` carrying the same path pair. Without pairing, the
/// target of an atomic temp-file rename surfaces twice: the first delivery
/// consumes the suppression entry and the second leaks downstream as a
/// spurious event for the engine's own write.
pub struct EventNormalizer {
    window: Duration,
    recent: HashMap<PathBuf, Instant>,
}

impl EventNormalizer {
    pub fn new(window: Duration) -> EventNormalizer {
        EventNormalizer {
            window,
            recent: HashMap::new(),
        }
    }

    /// Map one event to `(path, kind)` pairs. Lone rename halves are noted;
    /// a merged pair drops any path whose lone half already went out.
    pub fn normalize(&mut self, event: &notify::Event) -> Vec<(PathBuf, ChangeKind)> {
        if self.recent.len() > 64 {
            let window = self.window;
            self.recent.retain(|_, at| at.elapsed() <= window);
        }
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let mut out = Vec::new();
                if !self.recently_noted(&event.paths[0]) {
                    out.push((event.paths[0].clone(), ChangeKind::Deleted));
                }
                if !self.recently_noted(&event.paths[1]) {
                    out.push((event.paths[1].clone(), ChangeKind::Created));
                }
                out
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::To)) => {
                let now = Instant::now();
                for path in &event.paths {
                    self.recent.insert(path.clone(), now);
                }
                flat_paths(event)
            }
            _ => flat_paths(event),
        }
    }

    fn recently_noted(&mut self, path: &Path) -> bool {
        match self.recent.get(path) {
            Some(at) if at.elapsed() <= self.window => true,
            Some(_) => {
                self.recent.remove(path);
                false
            }
            None => false,
        }
    }
}

fn flat_paths(event: &notify::Event) -> Vec<(PathBuf, ChangeKind)> {
    match map_event_kind(&event.kind) {
        Some(kind) => event.paths.iter().map(|p| (p.clone(), kind)).collect(),
        None => Vec::new(),
    }
}

// ── Debouncer ──────────────────────────────────────────────────────

/// Coalesces events per document ID within a fixed window. Only the final
/// event per ID is emitted once its window elapses, except that a Modify
/// landing on a pending Create stays a Create.
pub struct Debouncer {
    tx: mpsc::Sender<ChangeEvent>,
    _thread: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn(window: Duration, out: mpsc::Sender<ChangeEvent>) -> Debouncer {
        let (tx, rx) = mpsc::channel::<ChangeEvent>();
        let thread = std::thread::spawn(move || run_debounce(rx, out, window));
        Debouncer { tx, _thread: thread }
    }

    pub fn submit(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }
}

fn run_debounce(
    rx: mpsc::Receiver<ChangeEvent>,
    out: mpsc::Sender<ChangeEvent>,
    window: Duration,
) {
    // Pending event per document ID, with the deadline fixed by the first
    // event of its window.
    let mut pending: HashMap<String, (ChangeEvent, Instant)> = HashMap::new();

    loop {
        let now = Instant::now();
        let timeout = pending
            .values()
            .map(|(_, deadline)| deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(window);

        match rx.recv_timeout(timeout) {
            Ok(event) => {
                let deadline = Instant::now() + window;
                pending
                    .entry(event.id.clone())
                    .and_modify(|(held, _)| {
                        let kind = match (held.kind, event.kind) {
                            (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
                            (_, incoming) => incoming,
                        };
                        held.kind = kind;
                        held.path = event.path.clone();
                    })
                    .or_insert((event, deadline));
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let due: Vec<String> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in due {
                    if let Some((event, _)) = pending.remove(&id) {
                        if out.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                for (event, _) in pending.into_values() {
                    let _ = out.send(event);
                }
                return;
            }
        }
    }
}

// ── Self-write suppression ─────────────────────────────────────────

/// Records the content hash of writes this store instance is about to make,
/// so the watcher can drop the echo events they generate.
///
/// Heuristic, not a guarantee: an external writer producing byte-identical
/// content within the TTL is indistinguishable from a self-echo and will be
/// dropped too.
pub struct SuppressionMap {
    ttl: Duration,
    inner: Mutex<HashMap<PathBuf, (String, Instant)>>,
}

impl SuppressionMap {
    pub fn new(ttl: Duration) -> SuppressionMap {
        SuppressionMap {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hash for an upcoming write. Entries past their TTL are
    /// dropped here, so a store that writes without a watcher attached never
    /// accumulates more than one expired generation.
    pub fn record(&self, path: &Path, content_hash: String) {
        let mut inner = self.inner.lock().expect("suppression lock poisoned");
        let ttl = self.ttl;
        inner.retain(|_, (_, at)| at.elapsed() <= ttl);
        inner.insert(path.to_path_buf(), (content_hash, Instant::now()));
    }

    /// Whether an incoming write/create event for `path` is a self-echo.
    /// Suppresses only when the current on-disk hash still equals the
    /// recorded one, and consumes the entry on a match.
    pub fn should_suppress(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock().expect("suppression lock poisoned");
        let Some((recorded, at)) = inner.get(path) else {
            return false;
        };
        if at.elapsed() > self.ttl {
            inner.remove(path);
            return false;
        }
        let matches = hash_file(path).as_deref() == Some(recorded.as_str());
        if matches {
            inner.remove(path);
        }
        matches
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn hash_file(path: &Path) -> Option<String> {
    std::fs::read(path).ok().map(|bytes| hash_bytes(&bytes))
}

// ── Supervisor ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Backoff,
    Stopped,
}

/// Restart bounds for a supervised watch worker.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub max_elapsed: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A session that ran at least this long counts as healthy and resets
    /// the backoff delay.
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            max_restarts: 10,
            max_elapsed: Duration::from_secs(300),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            healthy_after: Duration::from_secs(60),
        }
    }
}

/// The 4-state restart machine: Starting -> Running -> (on failure)
/// Backoff -> Starting, until the restart count or total elapsed budget is
/// exhausted, then Stopped.
pub struct Supervisor {
    policy: RestartPolicy,
    state: SupervisorState,
    restarts: u32,
    delay: Duration,
    total: Duration,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Supervisor {
        let delay = policy.base_delay;
        Supervisor {
            policy,
            state: SupervisorState::Starting,
            restarts: 0,
            delay,
            total: Duration::ZERO,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn started(&mut self) {
        self.state = SupervisorState::Running;
    }

    /// Record a session failure after `ran_for` of runtime. Returns the
    /// backoff delay to sleep before restarting, or None once the budget is
    /// exhausted and the supervisor transitions to Stopped.
    pub fn failed(&mut self, ran_for: Duration) -> Option<Duration> {
        self.total += ran_for;
        if self.restarts >= self.policy.max_restarts || self.total >= self.policy.max_elapsed {
            self.state = SupervisorState::Stopped;
            return None;
        }
        self.restarts += 1;
        if ran_for >= self.policy.healthy_after {
            self.delay = self.policy.base_delay;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.policy.max_delay);
        self.total += delay;
        self.state = SupervisorState::Backoff;
        Some(delay)
    }

    pub fn restarting(&mut self) {
        self.state = SupervisorState::Starting;
    }

    pub fn stop(&mut self) {
        self.state = SupervisorState::Stopped;
    }
}

// ── Watch handle ───────────────────────────────────────────────────

/// Owns a supervised watch worker. Dropping the handle signals the worker
/// to stop; `stop()` additionally joins it.
pub struct WatchHandle {
    pub events: mpsc::Receiver<ChangeEvent>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub(crate) fn new(
        events: mpsc::Receiver<ChangeEvent>,
        stop: Arc<AtomicBool>,
        thread: JoinHandle<()>,
    ) -> WatchHandle {
        WatchHandle {
            events,
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(id: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            id: id.to_string(),
            path: PathBuf::from(format!("{id}.md")),
            kind,
        }
    }

    #[test]
    fn test_debounce_coalesces_rapid_writes() {
        let (out_tx, out_rx) = mpsc::channel();
        let debouncer = Debouncer::spawn(Duration::from_millis(50), out_tx);

        // Three writes to the same document within 30ms.
        debouncer.submit(event("a", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(10));
        debouncer.submit(event("a", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(10));
        debouncer.submit(event("a", ChangeKind::Modified));

        let first = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, ChangeKind::Modified);
        assert!(out_rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_debounce_create_then_modify_stays_create() {
        let (out_tx, out_rx) = mpsc::channel();
        let debouncer = Debouncer::spawn(Duration::from_millis(50), out_tx);

        debouncer.submit(event("a", ChangeKind::Created));
        debouncer.submit(event("a", ChangeKind::Modified));

        let merged = out_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(merged.kind, ChangeKind::Created);
    }

    #[test]
    fn test_debounce_keeps_distinct_ids_separate() {
        let (out_tx, out_rx) = mpsc::channel();
        let debouncer = Debouncer::spawn(Duration::from_millis(20), out_tx);

        debouncer.submit(event("a", ChangeKind::Created));
        debouncer.submit(event("b", ChangeKind::Deleted));

        let mut got = vec![
            out_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            out_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ];
        got.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(got[0].id, "a");
        assert_eq!(got[1].id, "b");
    }

    #[test]
    fn test_suppression_consumes_matching_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.md");
        std::fs::write(&path, b"written by us").unwrap();

        let map = SuppressionMap::new(Duration::from_secs(5));
        map.record(&path, hash_bytes(b"written by us"));

        assert!(map.should_suppress(&path));
        // Entry consumed: a second identical event is no longer suppressed.
        assert!(!map.should_suppress(&path));
    }

    #[test]
    fn test_suppression_ignores_external_change() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("doc.md");
        std::fs::write(&path, b"external content").unwrap();

        let map = SuppressionMap::new(Duration::from_secs(5));
        map.record(&path, hash_bytes(b"what we wrote"));
        assert!(!map.should_suppress(&path));
    }

    #[test]
    fn test_supervisor_backoff_growth_and_stop() {
        let policy = RestartPolicy {
            max_restarts: 3,
            max_elapsed: Duration::from_secs(3600),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            healthy_after: Duration::from_secs(60),
        };
        let mut sup = Supervisor::new(policy);
        assert_eq!(sup.state(), SupervisorState::Starting);
        sup.started();
        assert_eq!(sup.state(), SupervisorState::Running);

        let crash = Duration::from_millis(10);
        assert_eq!(sup.failed(crash), Some(Duration::from_millis(100)));
        assert_eq!(sup.state(), SupervisorState::Backoff);
        sup.restarting();
        sup.started();
        assert_eq!(sup.failed(crash), Some(Duration::from_millis(200)));
        // Capped at max_delay.
        assert_eq!(sup.failed(crash), Some(Duration::from_millis(250)));
        // Restart budget exhausted.
        assert_eq!(sup.failed(crash), None);
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_supervisor_healthy_run_resets_delay() {
        let mut sup = Supervisor::new(RestartPolicy {
            max_restarts: 10,
            max_elapsed: Duration::from_secs(100_000),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            healthy_after: Duration::from_secs(60),
        });
        sup.started();
        assert_eq!(sup.failed(Duration::from_millis(5)), Some(Duration::from_millis(100)));
        assert_eq!(sup.failed(Duration::from_millis(5)), Some(Duration::from_millis(200)));
        // A long healthy session resets the backoff to the base delay.
        assert_eq!(sup.failed(Duration::from_secs(120)), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_supervisor_total_elapsed_budget() {
        let mut sup = Supervisor::new(RestartPolicy {
            max_restarts: 100,
            max_elapsed: Duration::from_secs(10),
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            healthy_after: Duration::from_secs(60),
        });
        sup.started();
        assert!(sup.failed(Duration::from_secs(4)).is_some());
        assert!(sup.failed(Duration::from_secs(4)).is_some());
        // Budget of 10s total exceeded.
        assert_eq!(sup.failed(Duration::from_secs(4)), None);
    }

    #[test]
    fn test_rename_direction_mapping() {
        let gone = EventKind::Modify(ModifyKind::Name(RenameMode::Any));
        assert_eq!(map_event_kind(&gone), Some(ChangeKind::Deleted));
        let from = EventKind::Modify(ModifyKind::Name(RenameMode::From));
        assert_eq!(map_event_kind(&from), Some(ChangeKind::Deleted));
        // The destination of a rename is the path appearing.
        let to = EventKind::Modify(ModifyKind::Name(RenameMode::To));
        assert_eq!(map_event_kind(&to), Some(ChangeKind::Created));
    }

    #[test]
    fn test_paired_rename_splits_per_path() {
        let mut norm = EventNormalizer::new(RENAME_PAIR_WINDOW);
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("old.md"), PathBuf::from("new.md")],
            attrs: Default::default(),
        };
        let mapped = norm.normalize(&event);
        assert_eq!(
            mapped,
            vec![
                (PathBuf::from("old.md"), ChangeKind::Deleted),
                (PathBuf::from("new.md"), ChangeKind::Created),
            ]
        );
    }

    #[test]
    fn test_merged_rename_skips_paths_already_delivered_alone() {
        // inotify delivers the lone halves and then a merged pair for the
        // same rename; the merged delivery must not repeat either path.
        let mut norm = EventNormalizer::new(RENAME_PAIR_WINDOW);

        let lone_to = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            paths: vec![PathBuf::from("doc.md")],
            attrs: Default::default(),
        };
        assert_eq!(
            norm.normalize(&lone_to),
            vec![(PathBuf::from("doc.md"), ChangeKind::Created)]
        );

        let merged = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from(".tmp123"), PathBuf::from("doc.md")],
            attrs: Default::default(),
        };
        // Only the source half survives; the destination already went out.
        assert_eq!(
            norm.normalize(&merged),
            vec![(PathBuf::from(".tmp123"), ChangeKind::Deleted)]
        );
    }

    #[test]
    fn test_merged_rename_fully_consumed_after_both_halves() {
        let mut norm = EventNormalizer::new(RENAME_PAIR_WINDOW);
        for (mode, path) in [
            (RenameMode::From, ".tmp123"),
            (RenameMode::To, "doc.md"),
        ] {
            let lone = notify::Event {
                kind: EventKind::Modify(ModifyKind::Name(mode)),
                paths: vec![PathBuf::from(path)],
                attrs: Default::default(),
            };
            assert_eq!(norm.normalize(&lone).len(), 1);
        }
        let merged = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from(".tmp123"), PathBuf::from("doc.md")],
            attrs: Default::default(),
        };
        assert!(norm.normalize(&merged).is_empty());
    }

    #[test]
    fn test_record_purges_expired_entries() {
        let map = SuppressionMap::new(Duration::from_millis(10));
        map.record(Path::new("a.md"), "h1".to_string());
        std::thread::sleep(Duration::from_millis(30));
        map.record(Path::new("b.md"), "h2".to_string());

        let inner = map.inner.lock().unwrap();
        assert_eq!(inner.len(), 1);
        assert!(inner.contains_key(Path::new("b.md")));
    }
}
