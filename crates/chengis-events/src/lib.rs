//! Durable, replayable event bus for the build execution engine.
//!
//! Every event is first appended to the [`chengis_store::Store`] durable
//! log, then broadcast to live subscribers — a subscriber that attaches
//! after the fact can always reconstruct history from the store, so replay
//! fidelity never depends on a subscriber having been connected at publish
//! time.
//!
//! Backpressure is classified per event kind
//! (`chengis_types::EventKind::is_critical`): critical events (build/stage/
//! step lifecycle transitions) must durably persist — the publish call
//! blocks up to a configured timeout and returns an error if the store
//! doesn't acknowledge in time. Non-critical events (log lines, progress
//! ticks, heartbeats) are persisted best-effort: a slow or saturated store
//! is allowed to drop them rather than stall the executor.
//!
//! There is one global topic (every event, across all builds — used by
//! dashboards and the retention scheduler) and one topic per build (used by
//! a client watching a single build's live log).

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chengis_store::Store;
use chengis_types::{BuildEvent, BuildId};
use tokio::sync::broadcast;

/// Default on-disk event log file name, one per build directory.
pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(build_dir: &Path) -> PathBuf {
    build_dir.join(EVENTS_FILE)
}

/// Append-only JSONL mirror of a build's events, independent of whatever
/// `Store` implementation is in use — lets an operator `tail -f` or ship
/// events off-box without going through the store's query API.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<BuildEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: BuildEvent) {
        self.events.push(event);
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            let event: BuildEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn all_events(&self) -> &[BuildEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Capacity of each per-build and the global broadcast channel's ring
/// buffer. A subscriber that falls this many events behind starts missing
/// non-critical events (acceptable per the backpressure classification
/// above); critical events are always recoverable from the store.
const CHANNEL_CAPACITY: usize = 1024;

struct Topics {
    global: broadcast::Sender<BuildEvent>,
    per_build: HashMap<BuildId, broadcast::Sender<BuildEvent>>,
}

/// The event bus. Cheap to clone (an `Arc` around the broadcast senders
/// would also work; this crate keeps a single long-lived instance instead,
/// matching how the rest of the workspace threads a `&EventBus` through the
/// executor rather than cloning handles around).
pub struct EventBus {
    critical_timeout: Duration,
    topics: Mutex<Topics>,
}

impl EventBus {
    pub fn new(critical_timeout: Duration) -> Self {
        let (global_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            critical_timeout,
            topics: Mutex::new(Topics { global: global_tx, per_build: HashMap::new() }),
        }
    }

    /// Subscribe to every event across every build.
    pub fn subscribe_global(&self) -> broadcast::Receiver<BuildEvent> {
        self.topics.lock().expect("topics lock poisoned").global.subscribe()
    }

    /// Subscribe to one build's events, creating that topic if this is the
    /// first subscriber.
    pub fn subscribe_build(&self, build_id: &BuildId) -> broadcast::Receiver<BuildEvent> {
        let mut topics = self.topics.lock().expect("topics lock poisoned");
        topics
            .per_build
            .entry(build_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop the per-build topic once a build is terminal and fully drained,
    /// so long-lived servers don't accumulate one sender per historical
    /// build forever.
    pub fn close_build_topic(&self, build_id: &BuildId) {
        self.topics.lock().expect("topics lock poisoned").per_build.remove(build_id);
    }

    fn broadcast(&self, event: &BuildEvent) {
        let topics = self.topics.lock().expect("topics lock poisoned");
        // `send` only errors when there are zero receivers, which is a
        // normal and harmless condition (nobody is watching this build).
        let _ = topics.global.send(event.clone());
        if let Some(tx) = topics.per_build.get(&event.build_id) {
            let _ = tx.send(event.clone());
        }
    }

    /// Publish an event: persist to `store` then broadcast to subscribers.
    ///
    /// Critical events (`event.event_type.is_critical()`) are persisted
    /// synchronously and must complete within `critical_timeout`; on
    /// timeout or store error this returns `Err` and the event is *not*
    /// considered delivered. Non-critical events are persisted best-effort:
    /// a store error is swallowed (logged by the caller if it wants) and
    /// the event still reaches live subscribers.
    pub fn publish(&self, store: &dyn Store, event: BuildEvent) -> Result<()> {
        if event.event_type.is_critical() {
            self.persist_with_timeout(store, &event)?;
        } else {
            let _ = store.append_event(&event);
        }
        self.broadcast(&event);
        Ok(())
    }

    fn persist_with_timeout(&self, store: &dyn Store, event: &BuildEvent) -> Result<()> {
        // `Store` is a synchronous trait (see its module docs); persistence
        // for a single JSON row is expected to be fast. Bound it with the
        // same poll-a-deadline shape the process sub-executor uses for
        // external commands, rather than trusting the backend to never
        // stall.
        let (tx, rx) = std::sync::mpsc::channel();
        let deadline = std::time::Instant::now() + self.critical_timeout;
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let result = store.append_event(event).map_err(|e| e.to_string());
                let _ = tx.send(result);
            });

            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(msg)) => bail!("failed to persist critical event: {msg}"),
                Err(_) => bail!(
                    "timed out persisting critical event {:?} after {:?}",
                    event.event_type,
                    self.critical_timeout
                ),
            }
        })
    }
}
