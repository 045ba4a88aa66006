//! SH-020: Convergence engine seam.
//!
//! Diffing and executing the resource graph is Terraform's job. Workflows
//! only see this trait: every call either succeeds (exit zero) or returns
//! a `StackError::Convergence`. Tests substitute `testing::FakeEngine`.

pub mod terraform;

use crate::core::error::StackError;
use crate::core::types::Settings;
use indexmap::IndexMap;

/// Remote-state backend parameters passed to `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub bucket: String,
    pub key: String,
    pub region: String,
    pub profile: Option<String>,
    pub lock_table: Option<String>,
}

impl BackendConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bucket: settings.bucket.clone(),
            key: settings.state_key.clone(),
            region: settings.region.clone(),
            profile: settings.profile.clone(),
            lock_table: settings.lock_table.clone(),
        }
    }

    /// `key=value` pairs for `-backend-config`.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("bucket".to_string(), self.bucket.clone()),
            ("key".to_string(), self.key.clone()),
            ("region".to_string(), self.region.clone()),
        ];
        if let Some(ref p) = self.profile {
            pairs.push(("profile".to_string(), p.clone()));
        }
        if let Some(ref t) = self.lock_table {
            pairs.push(("dynamodb_table".to_string(), t.clone()));
        }
        pairs
    }
}

/// Input variables (`-var name=value`).
pub type Variables = IndexMap<String, String>;

/// The external convergence engine.
pub trait ConvergenceEngine {
    /// Precondition check: binary present, working directory present.
    fn check_available(&self) -> Result<(), StackError>;
    fn init(&self, backend: &BackendConfig) -> Result<(), StackError>;
    fn validate(&self) -> Result<(), StackError>;
    fn plan(&self, vars: &Variables) -> Result<(), StackError>;
    /// Apply the plan produced by the last `plan`.
    fn apply(&self) -> Result<(), StackError>;
    fn destroy(&self, vars: &Variables) -> Result<(), StackError>;
    fn output(&self) -> Result<IndexMap<String, serde_json::Value>, StackError>;
    fn refresh(&self, vars: &Variables) -> Result<(), StackError>;
    fn state_list(&self) -> Result<Vec<String>, StackError>;
}
