//! SH-011: Local execution via `std::process::Command`.

use super::{CommandSpec, ExecOutput};
use std::io::Write;
use std::process::{Command, Stdio};

/// Run a program with arguments.
pub fn run_program(spec: &CommandSpec) -> Result<ExecOutput, String> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stderr(Stdio::piped());
    if spec.stream_stdout {
        cmd.stdout(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::piped());
    }
    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("failed to spawn {}: {}", spec.program, e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Execute a shell script locally via `bash`, with extra environment.
/// Uses bash (not sh/dash) so hooks may rely on `set -o pipefail`.
pub fn exec_script(script: &str, env: &[(String, String)]) -> Result<ExecOutput, String> {
    let mut child = Command::new("bash")
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    if let Some(ref mut stdin) = child.stdin {
        stdin
            .write_all(script.as_bytes())
            .map_err(|e| format!("stdin write error: {}", e))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh011_run_program_args() {
        let out = run_program(&CommandSpec::new("printf").args(["%s-%s", "a", "b"])).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "a-b");
    }

    #[test]
    fn test_sh011_run_program_exit_code() {
        let out = run_program(&CommandSpec::new("bash").args(["-c", "echo bad >&2; exit 42"]))
            .unwrap();
        assert_eq!(out.exit_code, 42);
        assert!(out.stderr.contains("bad"));
    }

    #[test]
    fn test_sh011_run_program_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("bash")
            .args(["-c", "pwd; echo \"$STACKHAND_TEST\""])
            .cwd(dir.path())
            .env("STACKHAND_TEST", "hello");
        let out = run_program(&spec).unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(lines[0]).canonicalize().unwrap(), canonical);
        assert_eq!(lines[1], "hello");
    }

    #[test]
    fn test_sh011_run_program_missing_binary() {
        let err = run_program(&CommandSpec::new("no-such-binary-7c1d")).unwrap_err();
        assert!(err.contains("failed to spawn"));
    }

    #[test]
    fn test_sh011_exec_script_env() {
        let env = vec![("TF_OUTPUT_ALB_DNS".to_string(), "alb.example.com".to_string())];
        let out = exec_script("echo \"$TF_OUTPUT_ALB_DNS\"", &env).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "alb.example.com");
    }

    #[test]
    fn test_sh011_exec_script_pipefail() {
        let out = exec_script("set -euo pipefail\nfalse | true", &[]).unwrap();
        assert!(!out.success(), "pipefail should catch false in pipeline");
    }

    #[test]
    fn test_sh011_exec_script_signal_killed() {
        let out = exec_script("kill -9 $$", &[]).unwrap();
        assert_eq!(out.exit_code, -1);
    }
}
