//! SH-015: Append-only JSONL journal of workflow runs.

use crate::core::types::{JournalSettings, TimestampedEvent, WorkflowEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Seconds since the Unix epoch split into UTC calendar fields.
struct UtcParts {
    year: i64,
    month: usize,
    day: i64,
    hours: u64,
    minutes: u64,
    seconds: u64,
}

fn utc_now() -> UtcParts {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    utc_from_epoch(secs)
}

fn utc_from_epoch(secs: u64) -> UtcParts {
    let days = secs / 86400;
    let time_secs = secs % 86400;

    let mut year = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let leap = is_leap(year);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            month = i + 1;
            break;
        }
        remaining -= md as i64;
    }

    UtcParts {
        year,
        month,
        day: remaining + 1,
        hours: time_secs / 3600,
        minutes: (time_secs % 3600) / 60,
        seconds: time_secs % 60,
    }
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// ISO 8601 UTC timestamp, e.g. `2026-10-19T14:03:07Z`.
pub fn now_iso8601() -> String {
    format_iso8601(&utc_now())
}

fn format_iso8601(t: &UtcParts) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        t.year, t.month, t.day, t.hours, t.minutes, t.seconds
    )
}

/// Compact UTC stamp safe for file names, e.g. `20261019T140307Z`.
pub fn now_compact() -> String {
    format_compact(&utc_now())
}

fn format_compact(t: &UtcParts) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year, t.month, t.day, t.hours, t.minutes, t.seconds
    )
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Journal file inside the journal directory.
pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join("events.jsonl")
}

/// Append an event to the journal.
pub fn append_event(dir: &Path, event: WorkflowEvent) -> Result<(), String> {
    let path = journal_path(dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create journal dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open journal {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read the last `n` events. Unparseable lines are skipped.
pub fn tail_events(dir: &Path, n: usize) -> Result<Vec<TimestampedEvent>, String> {
    let path = journal_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read journal {}: {}", path.display(), e))?;
    let events: Vec<TimestampedEvent> = content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let skip = events.len().saturating_sub(n);
    Ok(events.into_iter().skip(skip).collect())
}

/// Journal handle for one workflow run. Write failures are ignored:
/// the journal must never fail a workflow.
#[derive(Debug, Clone)]
pub struct Journal {
    dir: Option<PathBuf>,
    run_id: String,
}

impl Journal {
    pub fn new(settings: &JournalSettings) -> Self {
        Self {
            dir: settings.enabled.then(|| settings.dir.clone()),
            run_id: generate_run_id(),
        }
    }

    /// A journal that records nothing.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            run_id: generate_run_id(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&self, event: WorkflowEvent) {
        if let Some(ref dir) = self.dir {
            let _ = append_event(dir, event);
        }
    }

    /// Record start and completion around `f`.
    pub fn workflow<T, E>(
        &self,
        workflow: &str,
        environment: &str,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let start = std::time::Instant::now();
        self.record(WorkflowEvent::WorkflowStarted {
            workflow: workflow.to_string(),
            environment: environment.to_string(),
            run_id: self.run_id.clone(),
            stackhand_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        let result = f();
        self.record(WorkflowEvent::WorkflowCompleted {
            workflow: workflow.to_string(),
            run_id: self.run_id.clone(),
            ok: result.is_ok(),
            total_seconds: start.elapsed().as_secs_f64(),
        });
        result
    }
}
