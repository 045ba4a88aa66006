//! SH-008: State hygiene: backup, validate, clean, info.
//!
//! A state file smaller than `hygiene.min_state_bytes` or not parseable as
//! JSON is treated as corrupted. Nothing is ever deleted without a backup.

use super::error::StackError;
use super::types::{Settings, WorkflowEvent};
use crate::console;
use crate::engine::{BackendConfig, ConvergenceEngine, Variables};
use crate::journal::eventlog::now_compact;
use crate::journal::{hasher, Journal};
use indexmap::IndexMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValidity {
    Valid { resources: usize },
    Missing,
    Corrupted { bytes: u64, reason: String },
    /// Well-formed on disk, but a refresh against the provider failed
    Stale { reason: String },
}

impl StateValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

impl fmt::Display for StateValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid { resources } => write!(f, "valid ({} resources)", resources),
            Self::Missing => write!(f, "missing"),
            Self::Corrupted { bytes, reason } => write!(f, "corrupted ({} bytes): {}", bytes, reason),
            Self::Stale { reason } => write!(f, "stale: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub bytes: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Removed { backup: BackupRecord },
    Kept { validity: StateValidity },
    Missing,
}

#[derive(Debug, Clone)]
pub struct StateInfo {
    pub path: PathBuf,
    pub bytes: u64,
    pub hash: String,
    pub serial: Option<u64>,
    pub lineage: Option<String>,
    pub terraform_version: Option<String>,
    pub resources: usize,
    pub by_type: IndexMap<String, usize>,
    pub backups: Vec<(PathBuf, u64)>,
}

/// Managed resource instances of a parsed state, grouped by type.
fn managed_instances(state: &serde_json::Value) -> IndexMap<String, usize> {
    let mut by_type: IndexMap<String, usize> = IndexMap::new();
    let resources = state.get("resources").and_then(|r| r.as_array());
    for r in resources.into_iter().flatten() {
        if r.get("mode").and_then(|m| m.as_str()) == Some("data") {
            continue;
        }
        let Some(rtype) = r.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let n = r
            .get("instances")
            .and_then(|i| i.as_array())
            .map_or(1, Vec::len);
        *by_type.entry(rtype.to_string()).or_default() += n;
    }
    by_type
}

fn read_state(path: &Path) -> Result<(u64, String), StackError> {
    let content = std::fs::read_to_string(path).map_err(|e| StackError::io(path, e))?;
    Ok((content.len() as u64, content))
}

/// Offline checks only: presence, size, JSON shape.
pub fn inspect(state_file: &Path, min_bytes: u64) -> StateValidity {
    if !state_file.exists() {
        return StateValidity::Missing;
    }
    let (bytes, content) = match read_state(state_file) {
        Ok(v) => v,
        Err(e) => {
            return StateValidity::Corrupted {
                bytes: 0,
                reason: e.to_string(),
            }
        }
    };
    if bytes < min_bytes {
        return StateValidity::Corrupted {
            bytes,
            reason: format!("smaller than {} bytes", min_bytes),
        };
    }
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(state) if state.is_object() => StateValidity::Valid {
            resources: managed_instances(&state).values().sum(),
        },
        Ok(_) => StateValidity::Corrupted {
            bytes,
            reason: "not a JSON object".into(),
        },
        Err(e) => StateValidity::Corrupted {
            bytes,
            reason: format!("invalid JSON: {}", e),
        },
    }
}

/// Offline checks, then (when an engine is given) `init` + `refresh`.
pub fn validate_state(
    settings: &Settings,
    engine: Option<&dyn ConvergenceEngine>,
    vars: &Variables,
) -> StateValidity {
    let offline = inspect(&settings.state_file, settings.hygiene.min_state_bytes);
    let Some(engine) = engine else {
        return offline;
    };
    if !offline.is_valid() {
        return offline;
    }
    let refreshed = engine
        .init(&BackendConfig::from_settings(settings))
        .and_then(|_| engine.refresh(vars));
    match refreshed {
        Ok(()) => offline,
        Err(e) => StateValidity::Stale {
            reason: e.to_string(),
        },
    }
}

/// `terraform.tfstate.<stamp>.backup`, or `.<stamp>-<n>.backup` on collision.
pub fn backup_file_name(state_name: &str, stamp: &str, n: u32) -> String {
    if n == 0 {
        format!("{}.{}.backup", state_name, stamp)
    } else {
        format!("{}.{}-{}.backup", state_name, stamp, n)
    }
}

/// `(stamp, n)` of a backup file name produced by `backup_file_name`.
pub fn backup_order(state_name: &str, file_name: &str) -> Option<(String, u32)> {
    let middle = file_name
        .strip_prefix(state_name)?
        .strip_prefix('.')?
        .strip_suffix(".backup")?;
    match middle.split_once('-') {
        Some((stamp, n)) => Some((stamp.to_string(), n.parse().ok()?)),
        None => Some((middle.to_string(), 0)),
    }
}

/// Copy the state file into the backup directory and journal its hash.
pub fn backup_state(settings: &Settings, journal: &Journal) -> Result<BackupRecord, StackError> {
    let src = settings.state_file.as_path();
    if !src.exists() {
        return Err(StackError::State(format!(
            "no state file at {}",
            src.display()
        )));
    }
    let dir = settings.hygiene.backup_dir.as_path();
    std::fs::create_dir_all(dir).map_err(|e| StackError::io(dir, e))?;

    let state_name = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "terraform.tfstate".to_string());
    let stamp = now_compact();
    let mut n = 0;
    let dest = loop {
        let candidate = dir.join(backup_file_name(&state_name, &stamp, n));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };

    let bytes = std::fs::copy(src, &dest).map_err(|e| StackError::io(&dest, e))?;
    let hash = hasher::hash_file(&dest).map_err(StackError::State)?;
    journal.record(WorkflowEvent::StateBackedUp {
        path: dest.display().to_string(),
        bytes,
        hash: hash.clone(),
    });
    console::ok(&format!(
        "backed up state to {} ({} bytes, {})",
        dest.display(),
        bytes,
        hasher::short(&hash)
    ));
    Ok(BackupRecord {
        path: dest,
        bytes,
        hash,
    })
}

/// Remove a corrupted state file after backing it up. A healthy file is
/// kept unless `force`.
pub fn clean_state(
    settings: &Settings,
    force: bool,
    journal: &Journal,
) -> Result<CleanOutcome, StackError> {
    let validity = inspect(&settings.state_file, settings.hygiene.min_state_bytes);
    match validity {
        StateValidity::Missing => return Ok(CleanOutcome::Missing),
        StateValidity::Corrupted { .. } => {}
        _ if force => {}
        _ => return Ok(CleanOutcome::Kept { validity }),
    }
    let backup = backup_state(settings, journal)?;
    std::fs::remove_file(&settings.state_file)
        .map_err(|e| StackError::io(&settings.state_file, e))?;
    console::ok(&format!("removed {}", settings.state_file.display()));
    Ok(CleanOutcome::Removed { backup })
}

/// Existing backups for the configured state file, oldest first.
pub fn list_backups(settings: &Settings) -> Result<Vec<(PathBuf, u64)>, StackError> {
    let state_name = settings
        .state_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "terraform.tfstate".to_string());
    let pattern = format!(
        "{}/{}.*.backup",
        glob::Pattern::escape(&settings.hygiene.backup_dir.to_string_lossy()),
        glob::Pattern::escape(&state_name)
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| StackError::State(format!("bad backup pattern: {}", e)))?;
    let mut backups: Vec<((String, u32), PathBuf, u64)> = paths
        .filter_map(Result::ok)
        .filter_map(|p| {
            let order = backup_order(&state_name, &p.file_name()?.to_string_lossy())?;
            let len = std::fs::metadata(&p).ok()?.len();
            Some((order, p, len))
        })
        .collect();
    backups.sort();
    Ok(backups.into_iter().map(|(_, p, len)| (p, len)).collect())
}

pub fn state_info(settings: &Settings) -> Result<StateInfo, StackError> {
    let path = settings.state_file.as_path();
    if !path.exists() {
        return Err(StackError::State(format!(
            "no state file at {}",
            path.display()
        )));
    }
    let (bytes, content) = read_state(path)?;
    let state: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| StackError::State(format!("{}: invalid JSON: {}", path.display(), e)))?;
    let by_type = managed_instances(&state);
    Ok(StateInfo {
        path: path.to_path_buf(),
        bytes,
        hash: hasher::hash_string(&content),
        serial: state.get("serial").and_then(|v| v.as_u64()),
        lineage: state
            .get("lineage")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        terraform_version: state
            .get("terraform_version")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        resources: by_type.values().sum(),
        by_type,
        backups: list_backups(settings)?,
    })
}
