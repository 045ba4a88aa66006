//! SH-010: Local process execution for external CLIs and hook scripts.
//!
//! Every cloud or engine call is a blocking subprocess. Nothing here knows
//! about Terraform or AWS; `engine` and `provider` build the argument lists.

pub mod local;

use std::path::{Path, PathBuf};

/// Output from running a command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// One line for error messages: the first `Error:` line of stderr with
    /// its first detail line, else the last non-empty stderr line, else the
    /// last stdout line.
    pub fn error_summary(&self) -> String {
        let lines = |s: &str| -> Vec<String> {
            s.lines()
                .map(|l| l.trim_start_matches(['│', '╷', '╵']).trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        };
        let stderr = lines(&self.stderr);
        if let Some(i) = stderr.iter().position(|l| l.starts_with("Error:")) {
            return match stderr.get(i + 1) {
                Some(detail) if !detail.starts_with("Error:") && !detail.starts_with("on ") => {
                    format!("{} ({})", stderr[i], detail)
                }
                _ => stderr[i].clone(),
            };
        }
        stderr
            .last()
            .cloned()
            .or_else(|| lines(&self.stdout).last().cloned())
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// A program invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Pass stdout through to the terminal instead of capturing it
    pub stream_stdout: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream_stdout = true;
        self
    }

    /// Shell-ish rendering for logs.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            if a.contains(' ') {
                s.push('\'');
                s.push_str(a);
                s.push('\'');
            } else {
                s.push_str(a);
            }
        }
        s
    }
}

/// Run a program and wait for it.
pub fn run(spec: &CommandSpec) -> Result<ExecOutput, String> {
    local::run_program(spec)
}

/// Whether `tool` resolves to an executable on PATH.
pub fn tool_available(tool: &str) -> bool {
    if tool.contains('/') {
        return is_executable(Path::new(tool));
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(tool)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
