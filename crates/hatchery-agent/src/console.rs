//! Console streaming by polling the runtime's log tail.
//!
//! Follow-mode log connections drop silently with some log drivers, so each
//! running instance gets a poller that re-reads a bounded tail on an interval
//! and forwards only lines it has not seen before.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::runtime::{ContainerRuntime, LogRecord, RuntimeError};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConsoleLine {
    pub seq: u64,
    /// When the line was handed to subscribers.
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<ConsoleLine>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, text: String) -> ConsoleLine {
        let line = ConsoleLine {
            seq: self.next_seq,
            at: Utc::now(),
            text,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        line
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        // cursor 0 means "the most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<ConsoleLine> = self.lines.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        let out: Vec<ConsoleLine> = self
            .lines
            .iter()
            .filter(|l| l.seq > cursor)
            .take(limit)
            .cloned()
            .collect();
        let last = out.last().map(|l| l.seq).unwrap_or(cursor);
        (out, last)
    }
}

fn control_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]|[\x00-\x08\x0b-\x1f\x7f]")
            .expect("valid regex")
    })
}

/// Removes ANSI escape sequences and other control characters, keeping newlines.
pub fn strip_control(s: &str) -> String {
    control_re().replace_all(s, "").into_owned()
}

/// Position of the last forwarded record: its timestamp and how many records
/// carrying that exact timestamp were already forwarded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Cursor {
    at: Option<DateTime<FixedOffset>>,
    same: usize,
}

/// Drops records at or before `cursor` and advances it. Records without a
/// timestamp inherit the previous record's.
fn fresh_records(cursor: &mut Cursor, records: &[LogRecord]) -> Vec<String> {
    let mut out = Vec::new();
    let mut prev: Option<DateTime<FixedOffset>> = None;
    let mut seen_at_cursor = 0usize;
    let mut newest: Option<DateTime<FixedOffset>> = None;
    let mut newest_count = 0usize;

    for rec in records {
        let ts = rec
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .or(prev);
        prev = ts;

        let fresh = match (ts, cursor.at) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(t), Some(c)) if t > c => true,
            (Some(t), Some(c)) if t == c => {
                seen_at_cursor += 1;
                seen_at_cursor > cursor.same
            }
            _ => false,
        };
        if fresh {
            out.push(rec.text.clone());
        }

        if let Some(t) = ts {
            match newest {
                Some(n) if n == t => newest_count += 1,
                Some(n) if n > t => {}
                _ => {
                    newest = Some(t);
                    newest_count = 1;
                }
            }
        }
    }

    if let Some(n) = newest {
        if cursor.at == Some(n) {
            cursor.same = cursor.same.max(newest_count);
        } else if cursor.at.is_none_or(|c| n > c) {
            cursor.at = Some(n);
            cursor.same = newest_count;
        }
    }
    out
}

/// Splits raw log text into clean, non-empty lines.
fn clean_lines(texts: Vec<String>) -> Vec<String> {
    texts
        .iter()
        .flat_map(|t| {
            strip_control(t)
                .split('\n')
                .map(|l| l.trim_end().to_string())
                .filter(|l| !l.trim().is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

struct Channel {
    tx: broadcast::Sender<ConsoleLine>,
    history: Mutex<LogBuffer>,
    /// Outlives pollers, so a reattach after stop/start skips the old tail.
    cursor: Mutex<Cursor>,
}

impl Channel {
    async fn emit(&self, text: String) {
        let mut history = self.history.lock().await;
        let line = history.push_line(text);
        // No subscribers is fine.
        let _ = self.tx.send(line);
    }

    /// Reads the container's log tail once and forwards the unseen lines.
    async fn pull(&self, runtime: &dyn ContainerRuntime, container: &str, tail: usize) -> Result<(), RuntimeError> {
        let mut cursor = self.cursor.lock().await;
        let records = runtime.tail_logs(container, Some(tail)).await?;
        for line in clean_lines(fresh_records(&mut cursor, &records)) {
            self.emit(line).await;
        }
        Ok(())
    }
}

struct Poller {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Late subscribers get `backlog` first, then everything after it on `live`.
pub struct ConsoleSubscription {
    pub backlog: Vec<ConsoleLine>,
    pub live: broadcast::Receiver<ConsoleLine>,
}

pub struct ConsoleSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<AgentConfig>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    pollers: Arc<Mutex<HashMap<String, Poller>>>,
    generation: std::sync::atomic::AtomicU64,
}

impl ConsoleSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<AgentConfig>) -> Self {
        Self {
            runtime,
            config,
            channels: Mutex::new(HashMap::new()),
            pollers: Arc::new(Mutex::new(HashMap::new())),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn channel(&self, instance_id: &str) -> Arc<Channel> {
        let mut map = self.channels.lock().await;
        map.entry(instance_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
                Arc::new(Channel {
                    tx,
                    history: Mutex::new(LogBuffer::new(self.config.console_history_lines)),
                    cursor: Mutex::new(Cursor::default()),
                })
            })
            .clone()
    }

    /// Starts polling `instance_id`'s container. Returns `false` when a poller
    /// was already running.
    pub async fn attach(&self, instance_id: &str) -> bool {
        let channel = self.channel(instance_id).await;
        let mut pollers = self.pollers.lock().await;
        if let Some(p) = pollers.get(instance_id)
            && !p.handle.is_finished()
        {
            return false;
        }

        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        let cancel = CancellationToken::new();
        let task = PollTask {
            instance_id: instance_id.to_string(),
            container: self.config.container_name(instance_id),
            runtime: self.runtime.clone(),
            channel,
            interval: self.config.console_poll_interval,
            tail: self.config.console_tail_lines,
            cancel: cancel.clone(),
            pollers: self.pollers.clone(),
            generation,
        };
        let handle = tokio::spawn(task.run());
        pollers.insert(
            instance_id.to_string(),
            Poller {
                generation,
                cancel,
                handle,
            },
        );
        tracing::debug!(instance_id, "console attached");
        true
    }

    /// Stops the poller and waits for it to finish, so no poll happens after
    /// this returns. Returns `false` when nothing was attached.
    pub async fn detach(&self, instance_id: &str) -> bool {
        let poller = self.pollers.lock().await.remove(instance_id);
        let Some(poller) = poller else {
            return false;
        };
        poller.cancel.cancel();
        if let Err(e) = poller.handle.await
            && e.is_panic()
        {
            tracing::warn!(instance_id, "console poller panicked");
        }
        tracing::debug!(instance_id, "console detached");
        true
    }

    pub async fn is_attached(&self, instance_id: &str) -> bool {
        self.pollers
            .lock()
            .await
            .get(instance_id)
            .is_some_and(|p| !p.handle.is_finished())
    }

    pub async fn attached_count(&self) -> usize {
        self.pollers
            .lock()
            .await
            .values()
            .filter(|p| !p.handle.is_finished())
            .count()
    }

    /// Loads whatever the container has logged into history, once. A fresh
    /// process calls this before `subscribe` so the backlog is not empty.
    pub async fn prime(&self, instance_id: &str) {
        let channel = self.channel(instance_id).await;
        let container = self.config.container_name(instance_id);
        match channel
            .pull(self.runtime.as_ref(), &container, self.config.console_tail_lines)
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => tracing::warn!(instance_id, error = %e, "console prime failed"),
        }
    }

    pub async fn subscribe(&self, instance_id: &str) -> ConsoleSubscription {
        let channel = self.channel(instance_id).await;
        // Hold the history lock so no line lands between backlog and receiver.
        let history = channel.history.lock().await;
        let live = channel.tx.subscribe();
        let (backlog, _) = history.tail_after(0, self.config.console_history_lines);
        ConsoleSubscription { backlog, live }
    }

    /// Lines after `cursor` (sequence number; 0 for the latest `limit` lines).
    pub async fn history(&self, instance_id: &str, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        let channel = self.channel(instance_id).await;
        let history = channel.history.lock().await;
        history.tail_after(cursor, limit)
    }

    /// Publishes orchestrator-generated lines (command echoes, notices).
    pub async fn emit(&self, instance_id: &str, text: &str) {
        let channel = self.channel(instance_id).await;
        for line in clean_lines(vec![text.to_string()]) {
            channel.emit(line).await;
        }
    }

    /// Drops the instance's history once it no longer exists.
    pub async fn forget(&self, instance_id: &str) {
        self.detach(instance_id).await;
        self.channels.lock().await.remove(instance_id);
    }
}

struct PollTask {
    instance_id: String,
    container: String,
    runtime: Arc<dyn ContainerRuntime>,
    channel: Arc<Channel>,
    interval: std::time::Duration,
    tail: usize,
    cancel: CancellationToken,
    pollers: Arc<Mutex<HashMap<String, Poller>>>,
    generation: u64,
}

impl PollTask {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let alive = self.poll_once().await;
            if !alive {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!(instance_id = %self.instance_id, "container stopped; console detached");
        self.channel.emit("[hatchery] server process exited".to_string()).await;
        let mut pollers = self.pollers.lock().await;
        if pollers
            .get(&self.instance_id)
            .is_some_and(|p| p.generation == self.generation)
        {
            pollers.remove(&self.instance_id);
        }
    }

    /// Forwards new lines; returns whether the container is still running.
    async fn poll_once(&self) -> bool {
        match self
            .channel
            .pull(self.runtime.as_ref(), &self.container, self.tail)
            .await
        {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => return false,
            Err(e) => {
                tracing::warn!(instance_id = %self.instance_id, error = %e, "console poll failed");
            }
        }
        match self.runtime.inspect_container(&self.container).await {
            Ok(Some(status)) => status.running,
            Ok(None) => false,
            // Transient; keep polling.
            Err(_) => true,
        }
    }
}
