//! SH-021: Terraform CLI engine.
//!
//! Runs the `terraform` binary in the stack's Terraform directory with
//! `-input=false -no-color`. `plan` saves to `stackhand.tfplan`, which
//! `apply` consumes, so apply never re-plans behind the user's back.

use super::{BackendConfig, ConvergenceEngine, Variables};
use crate::core::error::StackError;
use crate::transport::{self, CommandSpec, ExecOutput};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

pub const PLAN_FILE: &str = "stackhand.tfplan";

pub struct TerraformCli {
    binary: String,
    workdir: PathBuf,
}

impl TerraformCli {
    pub fn new(workdir: &Path) -> Self {
        Self {
            binary: "terraform".to_string(),
            workdir: workdir.to_path_buf(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .arg(subcommand)
            .cwd(&self.workdir)
            .env("TF_IN_AUTOMATION", "1")
    }

    fn exec(&self, subcommand: &str, spec: CommandSpec) -> Result<ExecOutput, StackError> {
        let out = transport::run(&spec)
            .map_err(|e| StackError::Precondition(format!("cannot run {}: {}", self.binary, e)))?;
        if out.success() {
            Ok(out)
        } else {
            Err(StackError::Convergence {
                command: subcommand.to_string(),
                code: out.exit_code,
                stderr: out.error_summary(),
            })
        }
    }
}

/// `-var name=value` arguments in declaration order.
pub fn var_args(vars: &Variables) -> Vec<String> {
    vars.iter()
        .flat_map(|(k, v)| ["-var".to_string(), format!("{}={}", k, v)])
        .collect()
}

/// Arguments for `terraform init`.
pub fn init_args(backend: &BackendConfig) -> Vec<String> {
    let mut args = vec![
        "-input=false".to_string(),
        "-no-color".to_string(),
        "-reconfigure".to_string(),
    ];
    for (k, v) in backend.pairs() {
        args.push(format!("-backend-config={}={}", k, v));
    }
    args
}

/// Parse `terraform output -json` into name → value.
pub fn parse_outputs(json: &str) -> Result<IndexMap<String, serde_json::Value>, StackError> {
    if json.trim().is_empty() {
        return Ok(IndexMap::new());
    }
    let raw: IndexMap<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| StackError::State(format!("invalid terraform output JSON: {}", e)))?;
    Ok(raw
        .into_iter()
        .map(|(name, entry)| {
            let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
            (name, value)
        })
        .collect())
}

/// Parse `terraform state list`: one address per non-empty line.
pub fn parse_state_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl ConvergenceEngine for TerraformCli {
    fn check_available(&self) -> Result<(), StackError> {
        if !transport::tool_available(&self.binary) {
            return Err(StackError::Precondition(format!(
                "{} not found on PATH",
                self.binary
            )));
        }
        if !self.workdir.is_dir() {
            return Err(StackError::Precondition(format!(
                "terraform directory {} does not exist",
                self.workdir.display()
            )));
        }
        Ok(())
    }

    fn init(&self, backend: &BackendConfig) -> Result<(), StackError> {
        let spec = self.command("init").args(init_args(backend)).streaming();
        self.exec("init", spec).map(|_| ())
    }

    fn validate(&self) -> Result<(), StackError> {
        let spec = self.command("validate").arg("-no-color");
        self.exec("validate", spec).map(|_| ())
    }

    fn plan(&self, vars: &Variables) -> Result<(), StackError> {
        let spec = self
            .command("plan")
            .args(["-input=false", "-no-color"])
            .arg(format!("-out={}", PLAN_FILE))
            .args(var_args(vars))
            .streaming();
        self.exec("plan", spec).map(|_| ())
    }

    fn apply(&self) -> Result<(), StackError> {
        let spec = self
            .command("apply")
            .args(["-input=false", "-no-color", "-auto-approve", PLAN_FILE])
            .streaming();
        let result = self.exec("apply", spec).map(|_| ());
        let _ = std::fs::remove_file(self.workdir.join(PLAN_FILE));
        result
    }

    fn destroy(&self, vars: &Variables) -> Result<(), StackError> {
        let spec = self
            .command("destroy")
            .args(["-input=false", "-no-color", "-auto-approve"])
            .args(var_args(vars))
            .streaming();
        self.exec("destroy", spec).map(|_| ())
    }

    fn output(&self) -> Result<IndexMap<String, serde_json::Value>, StackError> {
        let spec = self.command("output").args(["-no-color", "-json"]);
        let out = self.exec("output", spec)?;
        parse_outputs(&out.stdout)
    }

    fn refresh(&self, vars: &Variables) -> Result<(), StackError> {
        let spec = self
            .command("refresh")
            .args(["-input=false", "-no-color"])
            .args(var_args(vars));
        self.exec("refresh", spec).map(|_| ())
    }

    fn state_list(&self) -> Result<Vec<String>, StackError> {
        let spec = self.command("state").arg("list");
        let out = self.exec("state list", spec)?;
        Ok(parse_state_list(&out.stdout))
    }
}
