//! SH-005: Backend metadata file (`KEY=value`, shell-sourceable).
//!
//! Written by `bootstrap` once the bucket is ready, read by `status` and by
//! anything that wants to `source` it.

use super::error::StackError;
use super::types::Settings;
use crate::journal::eventlog::now_iso8601;
use indexmap::IndexMap;
use std::path::Path;

/// Backend coordinates recorded after a successful bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMetadata {
    pub bucket: String,
    pub region: String,
    pub profile: Option<String>,
    pub environment: String,
    pub state_key: String,
    pub created_at: String,
}

impl BackendMetadata {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            profile: settings.profile.clone(),
            environment: settings.environment.clone(),
            state_key: settings.state_key.clone(),
            created_at: now_iso8601(),
        }
    }

    /// Render as a shell-sourceable env file.
    pub fn to_env_file(&self) -> String {
        let mut out = String::from("# Generated by stackhand. Safe to `source`.\n");
        let mut line = |k: &str, v: &str| {
            out.push_str(k);
            out.push('=');
            out.push_str(&shell_quote(v));
            out.push('\n');
        };
        line("BUCKET_NAME", &self.bucket);
        line("AWS_REGION", &self.region);
        // Absent rather than empty so a caller's exported AWS_PROFILE survives `source`
        if let Some(ref profile) = self.profile {
            line("AWS_PROFILE", profile);
        }
        line("ENVIRONMENT", &self.environment);
        line("STATE_KEY", &self.state_key);
        line("CREATED_AT", &self.created_at);
        out
    }
}

/// Quote `v` for POSIX shells only when needed.
fn shell_quote(v: &str) -> String {
    let plain = !v.is_empty()
        && v
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:@+,".contains(c));
    if plain {
        v.to_string()
    } else {
        format!("'{}'", v.replace('\'', r"'\''"))
    }
}

fn unquote(v: &str) -> String {
    let v = v.trim();
    if v.len() >= 2 {
        if v.starts_with('\'') && v.ends_with('\'') {
            return v[1..v.len() - 1].replace(r"'\''", "'");
        }
        if v.starts_with('"') && v.ends_with('"') {
            return v[1..v.len() - 1].replace("\\\"", "\"");
        }
    }
    v.to_string()
}

/// Parse `KEY=value` lines. Blank lines and `#` comments are ignored, an
/// `export ` prefix is accepted, and surrounding quotes are stripped.
pub fn parse_env_file(content: &str) -> IndexMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let l = l.strip_prefix("export ").unwrap_or(l);
            let (k, v) = l.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), unquote(v)))
        })
        .collect()
}

pub fn parse_metadata(content: &str) -> Result<BackendMetadata, StackError> {
    let vars = parse_env_file(content);
    let get = |k: &str| -> Result<String, StackError> {
        vars.get(k)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| StackError::Config(format!("metadata file is missing {}", k)))
    };
    Ok(BackendMetadata {
        bucket: get("BUCKET_NAME")?,
        region: get("AWS_REGION")?,
        profile: vars.get("AWS_PROFILE").filter(|v| !v.is_empty()).cloned(),
        environment: vars.get("ENVIRONMENT").cloned().unwrap_or_default(),
        state_key: vars.get("STATE_KEY").cloned().unwrap_or_default(),
        created_at: vars.get("CREATED_AT").cloned().unwrap_or_default(),
    })
}

/// Read the metadata file. A missing file is `Ok(None)`.
pub fn read_metadata(path: &Path) -> Result<Option<BackendMetadata>, StackError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| StackError::io(path, e))?;
    parse_metadata(&content).map(Some)
}

/// Write the metadata file atomically (temp file, then rename).
pub fn write_metadata(path: &Path, meta: &BackendMetadata) -> Result<(), StackError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StackError::io(parent, e))?;
    }
    let tmp = path.with_extension("env.tmp");
    std::fs::write(&tmp, meta.to_env_file()).map_err(|e| StackError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StackError::io(path, e))?;
    Ok(())
}

/// Remove the metadata file. Returns whether a file was removed.
pub fn remove_metadata(path: &Path) -> Result<bool, StackError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StackError::io(path, e)),
    }
}
