//! In-memory log capture with daily log files.
//!
//! [`LogCaptureLayer`] is a `tracing_subscriber::Layer` that copies every
//! tracing event into a bounded ring buffer, broadcasts it to live
//! subscribers and, when a directory is configured, appends it to
//! `<dir>/<YYYY-MM-DD>.log`. It also counts INFO entries as successes and
//! ERROR entries as failures for the status endpoint.

use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    chrono::{Local, NaiveDate, TimeZone},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::broadcast,
    tracing::field::{Field, Visit},
    tracing_subscriber::{Layer, layer::Context},
};

// ── LogEntry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl LogEntry {
    fn local_time(&self) -> chrono::DateTime<Local> {
        Local
            .timestamp_millis_opt(self.ts as i64)
            .single()
            .unwrap_or_else(Local::now)
    }

    /// One line of a daily log file.
    fn to_line(&self) -> String {
        let mut line = format!(
            "{} {:>5} {}: {}",
            self.local_time().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            self.level,
            self.target,
            self.message
        );
        for (key, value) in &self.fields {
            match value {
                Value::String(s) => line.push_str(&format!(" {key}={s}")),
                other => line.push_str(&format!(" {key}={other}")),
            }
        }
        line
    }
}

// ── LogBuffer ───────────────────────────────────────────────────────────────

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_BROADCAST_CAPACITY: usize = 512;

struct DailyFile {
    date: NaiveDate,
    file: File,
}

#[derive(Clone)]
pub struct LogBuffer {
    buf: Arc<RwLock<VecDeque<LogEntry>>>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
    dir: Arc<RwLock<Option<PathBuf>>>,
    writer: Arc<Mutex<Option<DailyFile>>>,
    success: Arc<AtomicU64>,
    fails: Arc<AtomicU64>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            buf: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
            tx,
            dir: Arc::new(RwLock::new(None)),
            writer: Arc::new(Mutex::new(None)),
            success: Arc::new(AtomicU64::new(0)),
            fails: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start appending entries to daily files under `dir`.
    pub fn enable_persistence(&self, dir: PathBuf) -> std::io::Result<()> {
        std::fs::create_dir_all(&dir)?;
        if let Ok(mut d) = self.dir.write() {
            *d = Some(dir);
        }
        Ok(())
    }

    pub fn push(&self, entry: LogEntry) {
        match entry.level.as_str() {
            "INFO" | "info" => {
                self.success.fetch_add(1, Ordering::Relaxed);
            },
            "ERROR" | "error" => {
                self.fails.fetch_add(1, Ordering::Relaxed);
            },
            _ => {},
        }

        // Best-effort broadcast, receivers may be behind.
        let _ = self.tx.send(entry.clone());

        self.persist(&entry);

        if let Ok(mut buf) = self.buf.write() {
            if buf.len() >= self.capacity {
                buf.pop_front();
            }
            buf.push_back(entry);
        }
    }

    fn persist(&self, entry: &LogEntry) {
        let Some(dir) = self.dir.read().ok().and_then(|d| d.clone()) else {
            return;
        };
        let date = entry.local_time().date_naive();
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if writer.as_ref().is_none_or(|w| w.date != date) {
            *writer = OpenOptions::new()
                .create(true)
                .append(true)
                .open(day_path(&dir, date))
                .ok()
                .map(|file| DailyFile { date, file });
        }
        if let Some(daily) = writer.as_mut() {
            let _ = writeln!(daily.file, "{}", entry.to_line());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// Return the last `limit` matching entries from the ring buffer.
    pub fn list(&self, filter: &LogFilter, limit: usize) -> Vec<LogEntry> {
        let buf = match self.buf.read() {
            Ok(b) => b,
            Err(_) => return vec![],
        };
        let mut entries: Vec<LogEntry> = buf
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect();
        entries.reverse();
        entries
    }

    /// Contents of the log file for `date`, if one was written.
    pub fn read_day(&self, date: NaiveDate) -> Option<String> {
        let dir = self.dir.read().ok().and_then(|d| d.clone())?;
        std::fs::read_to_string(day_path(&dir, date)).ok()
    }

    /// `(success, fails)`: INFO and ERROR entries seen since start.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.success.load(Ordering::Relaxed),
            self.fails.load(Ordering::Relaxed),
        )
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn day_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.log", date.format("%Y-%m-%d")))
}

// ── LogFilter ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LogFilter {
    pub level: Option<String>,
    pub search: Option<String>,
}

impl LogFilter {
    fn level_ord(l: &str) -> u8 {
        match l {
            "TRACE" | "trace" => 0,
            "DEBUG" | "debug" => 1,
            "INFO" | "info" => 2,
            "WARN" | "warn" => 3,
            "ERROR" | "error" => 4,
            _ => 2,
        }
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(ref lvl) = self.level
            && Self::level_ord(&entry.level) < Self::level_ord(lvl)
        {
            return false;
        }
        if let Some(ref q) = self.search
            && !q.is_empty()
        {
            let q_lower = q.to_lowercase();
            if !entry.message.to_lowercase().contains(&q_lower)
                && !entry.target.to_lowercase().contains(&q_lower)
            {
                return false;
            }
        }
        true
    }
}

// ── Visitor (extracts fields from tracing events) ───────────────────────────

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: serde_json::Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().into(), Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.into();
        } else {
            self.fields
                .insert(field.name().into(), Value::String(value.into()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().into(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().into(), Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().into(), Value::Bool(value));
    }
}

// ── LogCaptureLayer ─────────────────────────────────────────────────────────

pub struct LogCaptureLayer {
    buffer: LogBuffer,
}

impl LogCaptureLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.buffer.push(LogEntry {
            ts: chrono::Utc::now().timestamp_millis() as u64,
            level: meta.level().to_string(),
            target: meta.target().into(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
