//! SH-011: Provisioning workflow.
//!
//! preflight → bootstrap → init → validate → plan → apply → output → hooks.
//! Fail-fast: the first unrecoverable step aborts and partial infrastructure
//! is left for `destroy` to handle.

use super::bootstrap::{bootstrap, BootstrapOptions, BootstrapReport};
use super::error::StackError;
use super::keys::EphemeralKey;
use super::retry::{run_step, RetryPolicy, Sleeper};
use super::types::Settings;
use crate::console;
use crate::engine::{BackendConfig, ConvergenceEngine, Variables};
use crate::journal::Journal;
use crate::provider::CloudProvider;
use crate::transport::local::exec_script;
use indexmap::IndexMap;

const WORKFLOW: &str = "up";

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Stop after `plan`
    pub dry_run: bool,
    /// Assume the backend bucket already exists
    pub skip_bootstrap: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
    pub identity: String,
    pub bootstrap: Option<BootstrapReport>,
    pub applied: bool,
    pub outputs: IndexMap<String, serde_json::Value>,
    pub hooks_run: usize,
}

/// Tools, credentials, Terraform directory. Returns the caller identity.
pub fn preflight(
    settings: &Settings,
    engine: &dyn ConvergenceEngine,
    provider: &dyn CloudProvider,
) -> Result<String, StackError> {
    engine.check_available()?;
    provider.check_available()?;
    if settings.ssh_key.enabled && !crate::transport::tool_available("ssh-keygen") {
        return Err(StackError::Precondition(
            "ssh_key.enabled requires ssh-keygen on PATH".into(),
        ));
    }
    let identity = provider.caller_identity()?;
    console::ok(&format!("preflight passed ({})", identity));
    Ok(identity)
}

/// Terraform variables: the configured variables, then the ephemeral public
/// key. With `builtin_variables`, `region`, `environment` and `project` come
/// first. Terraform rejects a `-var` the root module does not declare.
pub fn engine_variables(settings: &Settings, key: Option<&EphemeralKey>) -> Variables {
    let mut vars = Variables::new();
    if settings.builtin_variables {
        vars.insert("region".into(), settings.region.clone());
        vars.insert("environment".into(), settings.environment.clone());
        vars.insert("project".into(), settings.project.clone());
    }
    for (k, v) in &settings.variables {
        vars.insert(k.clone(), v.clone());
    }
    if let Some(key) = key {
        vars.insert(settings.ssh_key.variable.clone(), key.public_key().to_string());
    }
    vars
}

/// Environment for post-apply hooks: `TF_OUTPUT_<NAME>` per output.
/// Strings are passed raw, everything else as JSON.
pub fn hook_env(
    outputs: &IndexMap<String, serde_json::Value>,
    key: Option<&EphemeralKey>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = outputs
        .iter()
        .map(|(name, value)| {
            let var = format!("TF_OUTPUT_{}", name.to_uppercase().replace('-', "_"));
            let val = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (var, val)
        })
        .collect();
    if let Some(key) = key {
        env.push((
            "STACKHAND_SSH_KEY".into(),
            key.private_key_path().display().to_string(),
        ));
    }
    env
}

/// Run hooks in order; the first failure aborts.
pub fn run_hooks(hooks: &[String], env: &[(String, String)]) -> Result<usize, StackError> {
    for (i, script) in hooks.iter().enumerate() {
        let index = i + 1;
        console::info(&format!("running post-apply hook {}/{}", index, hooks.len()));
        let out = exec_script(script, env)
            .map_err(|e| StackError::Precondition(format!("hook {}: {}", index, e)))?;
        for line in out.stdout.lines() {
            console::info(&format!("  {}", line));
        }
        if !out.success() {
            return Err(StackError::Hook {
                index,
                code: out.exit_code,
                stderr: out.error_summary(),
            });
        }
    }
    Ok(hooks.len())
}

fn engine_step(
    journal: &Journal,
    sleeper: &dyn Sleeper,
    step: &str,
    op: impl FnMut() -> Result<(), StackError>,
) -> Result<(), StackError> {
    console::info(&format!("terraform {}", step));
    run_step(journal, WORKFLOW, step, RetryPolicy::once(), sleeper, op)?;
    console::ok(&format!("terraform {}", step));
    Ok(())
}

/// init + validate + plan. Shared by `up` and `plan`.
pub fn plan_only(
    settings: &Settings,
    engine: &dyn ConvergenceEngine,
    sleeper: &dyn Sleeper,
    journal: &Journal,
    vars: &Variables,
) -> Result<(), StackError> {
    let backend = BackendConfig::from_settings(settings);
    engine_step(journal, sleeper, "init", || engine.init(&backend))?;
    engine_step(journal, sleeper, "validate", || engine.validate())?;
    engine_step(journal, sleeper, "plan", || engine.plan(vars))?;
    Ok(())
}

/// Run the full provisioning workflow.
pub fn provision(
    settings: &Settings,
    engine: &dyn ConvergenceEngine,
    provider: &dyn CloudProvider,
    sleeper: &dyn Sleeper,
    journal: &Journal,
    options: ProvisionOptions,
) -> Result<ProvisionReport, StackError> {
    let mut report = ProvisionReport {
        identity: preflight(settings, engine, provider)?,
        ..Default::default()
    };

    if !options.skip_bootstrap {
        let opts = BootstrapOptions {
            dry_run: options.dry_run,
        };
        report.bootstrap = Some(bootstrap(settings, provider, sleeper, journal, opts)?);
    }

    // Lives until the end of this function; dropping it deletes the key
    let key = if settings.ssh_key.enabled {
        Some(EphemeralKey::generate(&format!(
            "stackhand-{}-{}",
            settings.project, settings.environment
        ))?)
    } else {
        None
    };
    let vars = engine_variables(settings, key.as_ref());

    if options.dry_run && report.bootstrap.as_ref().is_some_and(|b| !b.reused) {
        // Backend does not exist yet, so there is nothing to init against
        console::warn("dry run: state bucket not created, skipping terraform plan");
        return Ok(report);
    }
    plan_only(settings, engine, sleeper, journal, &vars)?;
    if options.dry_run {
        console::ok("dry run complete; nothing applied");
        return Ok(report);
    }

    engine_step(journal, sleeper, "apply", || engine.apply())?;
    report.applied = true;

    report.outputs = run_step(journal, WORKFLOW, "output", RetryPolicy::once(), sleeper, || {
        engine.output()
    })?;
    for (name, value) in &report.outputs {
        console::info(&format!("output {} = {}", name, value));
    }

    if !settings.hooks.post_apply.is_empty() {
        let env = hook_env(&report.outputs, key.as_ref());
        report.hooks_run = run_step(
            journal,
            WORKFLOW,
            "post-apply-hooks",
            RetryPolicy::once(),
            sleeper,
            || run_hooks(&settings.hooks.post_apply, &env),
        )?;
    }

    console::ok(&format!(
        "{} ({}) is up",
        settings.project, settings.environment
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{parse_config, resolve_settings, CliOverrides};
    use crate::engine::terraform::TerraformCli;
    use crate::testing::{FakeEngine, FakeProvider, RecordingSleeper};
    use serde_json::json;
    use std::path::Path;

    fn settings(dir: &Path, extra: &str) -> Settings {
        let yaml = format!(
            "version: \"1.0\"\nproject: demo\ndefault_environment: dev\nenvironments:\n  dev: {{}}\njournal:\n  enabled: false\nvariables:\n  instance_type: t3.micro\n{}",
            extra
        );
        let config = parse_config(&yaml).unwrap();
        resolve_settings(&config, &CliOverrides::default(), dir).unwrap()
    }

    fn up(
        s: &Settings,
        engine: &FakeEngine,
        provider: &FakeProvider,
        options: ProvisionOptions,
    ) -> Result<ProvisionReport, StackError> {
        provision(
            s,
            engine,
            provider,
            &RecordingSleeper::default(),
            &Journal::disabled(),
            options,
        )
    }

    #[test]
    fn test_sh011_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new().with_output("alb_dns_name", json!("demo.elb.amazonaws.com"));
        let provider = FakeProvider::new();

        let report = up(&s, &engine, &provider, Default::default()).unwrap();

        assert!(report.applied);
        assert_eq!(
            engine.calls(),
            vec!["init", "validate", "plan", "apply", "output"]
        );
        assert_eq!(report.outputs["alb_dns_name"], "demo.elb.amazonaws.com");
        assert!(provider.bucket("demo-dev-tfstate").is_some());
        assert_eq!(engine.last_backend().unwrap().bucket, "demo-dev-tfstate");
        let vars = engine.last_vars();
        assert_eq!(vars.keys().collect::<Vec<_>>(), vec!["instance_type"]);
        assert_eq!(vars["instance_type"], "t3.micro");
    }

    #[test]
    fn test_sh011_existing_bucket_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new();
        let provider = FakeProvider::new().with_bucket("demo-dev-tfstate");

        let report = up(&s, &engine, &provider, Default::default()).unwrap();

        assert!(report.bootstrap.unwrap().reused);
        assert!(!provider.calls().iter().any(|c| c.starts_with("create_bucket")));
        assert!(report.applied);
    }

    #[test]
    fn test_sh011_missing_credentials_abort_early() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new();
        let provider = FakeProvider::new().without_credentials();

        let err = up(&s, &engine, &provider, Default::default()).unwrap_err();

        assert!(matches!(err, StackError::Precondition(_)));
        assert!(engine.calls().is_empty());
        assert_eq!(provider.calls(), vec!["caller_identity"]);
    }

    #[test]
    fn test_sh011_missing_engine_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let err = up(
            &s,
            &FakeEngine::new().unavailable(),
            &FakeProvider::new(),
            Default::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("terraform not found"));
    }

    #[test]
    fn test_sh011_apply_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new().always_failing("apply");

        let err = up(&s, &engine, &FakeProvider::new(), Default::default()).unwrap_err();

        assert!(matches!(err, StackError::Convergence { ref command, .. } if command == "apply"));
        assert_eq!(engine.count("apply"), 1);
        assert_eq!(engine.count("output"), 0);
    }

    #[test]
    fn test_sh011_dry_run_stops_after_plan() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new();
        let provider = FakeProvider::new().with_bucket("demo-dev-tfstate");

        let report = up(
            &s,
            &engine,
            &provider,
            ProvisionOptions {
                dry_run: true,
                skip_bootstrap: false,
            },
        )
        .unwrap();

        assert!(!report.applied);
        assert_eq!(engine.calls(), vec!["init", "validate", "plan"]);
        assert!(!s.metadata_file.exists());
    }

    #[test]
    fn test_sh011_dry_run_without_backend_skips_engine() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let engine = FakeEngine::new();
        let provider = FakeProvider::new();

        up(
            &s,
            &engine,
            &provider,
            ProvisionOptions {
                dry_run: true,
                skip_bootstrap: false,
            },
        )
        .unwrap();

        assert!(engine.calls().is_empty());
        assert!(provider.bucket("demo-dev-tfstate").is_none());
    }

    #[test]
    fn test_sh011_skip_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let provider = FakeProvider::new();
        let report = up(
            &s,
            &FakeEngine::new(),
            &provider,
            ProvisionOptions {
                dry_run: false,
                skip_bootstrap: true,
            },
        )
        .unwrap();
        assert!(report.bootstrap.is_none());
        assert_eq!(provider.calls(), vec!["caller_identity"]);
    }

    #[test]
    fn test_sh011_hooks_see_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("hook.out");
        let extra = format!(
            "hooks:\n  post_apply:\n    - 'printf \"%s %s\" \"$TF_OUTPUT_ALB_DNS_NAME\" \"$TF_OUTPUT_INSTANCE_IDS\" > {}'\n",
            marker.display()
        );
        let s = settings(dir.path(), &extra);
        let engine = FakeEngine::new()
            .with_output("alb_dns_name", json!("demo.elb"))
            .with_output("instance_ids", json!(["i-1", "i-2"]));

        let report = up(&s, &engine, &FakeProvider::new(), Default::default()).unwrap();

        assert_eq!(report.hooks_run, 1);
        assert_eq!(
            std::fs::read_to_string(&marker).unwrap(),
            "demo.elb [\"i-1\",\"i-2\"]"
        );
    }

    #[test]
    fn test_sh011_failing_hook_aborts() {
        let hooks = vec!["exit 0".to_string(), "echo nope >&2; exit 7".to_string(), "exit 0".to_string()];
        match run_hooks(&hooks, &[]) {
            Err(StackError::Hook { index, code, stderr }) => {
                assert_eq!(index, 2);
                assert_eq!(code, 7);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sh011_hook_env_names() {
        let outputs = IndexMap::from([
            ("vault-addr".to_string(), json!("https://vault:8200")),
            ("count".to_string(), json!(3)),
        ]);
        let env = hook_env(&outputs, None);
        assert_eq!(
            env,
            vec![
                ("TF_OUTPUT_VAULT_ADDR".to_string(), "https://vault:8200".to_string()),
                ("TF_OUTPUT_COUNT".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_sh011_engine_variables_only_configured() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "");
        let vars = engine_variables(&s, None);
        let keys: Vec<_> = vars.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["instance_type"]);
        assert!(!vars.contains_key("ssh_public_key"));
    }

    #[test]
    fn test_sh011_engine_variables_builtin_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path(), "builtin_variables: true\n");
        let vars = engine_variables(&s, None);
        let keys: Vec<_> = vars.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["region", "environment", "project", "instance_type"]);
        assert_eq!(vars["environment"], "dev");
    }

    /// A root module that declares `region` and `instance_type` but not
    /// `environment` or `project` plans cleanly with the default variable set.
    #[test]
    fn test_sh011_plan_against_minimal_module() {
        if !crate::transport::tool_available("terraform") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tf_dir = dir.path().join("terraform");
        std::fs::create_dir_all(&tf_dir).unwrap();
        std::fs::write(
            tf_dir.join("main.tf"),
            "variable \"region\" {\n  default = \"us-east-1\"\n}\nvariable \"instance_type\" {}\n",
        )
        .unwrap();
        let s = settings(dir.path(), "");
        let engine = TerraformCli::new(&s.terraform_dir);
        let init = crate::transport::run(
            &crate::transport::CommandSpec::new("terraform")
                .args(["init", "-input=false", "-no-color"])
                .cwd(&s.terraform_dir),
        )
        .unwrap();
        if !init.success() {
            return;
        }

        engine.plan(&engine_variables(&s, None)).unwrap();

        let with_builtins = Settings {
            builtin_variables: true,
            ..s.clone()
        };
        let err = engine.plan(&engine_variables(&with_builtins, None)).unwrap_err();
        assert!(err.to_string().contains("Error:"), "{}", err);
    }

    #[test]
    fn test_sh011_ephemeral_key_passed_and_removed() {
        if !crate::transport::tool_available("ssh-keygen") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("key-path");
        let extra = format!(
            "ssh_key:\n  enabled: true\nhooks:\n  post_apply:\n    - 'test -f \"$STACKHAND_SSH_KEY\" && printf %s \"$STACKHAND_SSH_KEY\" > {}'\n",
            marker.display()
        );
        let s = settings(dir.path(), &extra);
        let engine = FakeEngine::new();

        up(&s, &engine, &FakeProvider::new(), Default::default()).unwrap();

        assert!(engine.last_vars()["ssh_public_key"].starts_with("ssh-ed25519 "));
        let key_path = std::fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(&key_path).exists());
    }
}
