//! SH-003: YAML parsing, validation, and environment resolution.
//!
//! Parses stackhand.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Project is a lowercase slug (it becomes a tag value and a bucket prefix)
//! - Every configured bucket name follows S3 naming rules
//! - Retry attempts are at least 1
//!
//! Resolution merges built-in defaults, `defaults`, the selected
//! environment, and CLI flags (in that order) into one `Settings`.

use super::types::*;
use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static BUCKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("bucket regex is valid")
});

static PROJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("project regex is valid"));

static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+$").expect("ipv4 regex is valid"));

const DEFAULT_REGION: &str = "us-east-1";

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Values given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub environment: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub bucket: Option<String>,
}

/// Parse a stackhand.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StackConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a stackhand.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StackConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Check an S3 bucket name. Returns a reason when invalid.
pub fn bucket_name_problem(name: &str) -> Option<String> {
    if !BUCKET_RE.is_match(name) {
        return Some(format!(
            "bucket '{}' must be 3-63 chars of [a-z0-9.-], starting and ending with a letter or digit",
            name
        ));
    }
    if name.contains("..") {
        return Some(format!("bucket '{}' must not contain '..'", name));
    }
    if IPV4_RE.is_match(name) {
        return Some(format!("bucket '{}' must not look like an IP address", name));
    }
    None
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StackConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError {
            message: format!("version must be \"1.0\", got \"{}\"", config.version),
        });
    }

    if config.project.is_empty() {
        errors.push(ValidationError {
            message: "project must not be empty".to_string(),
        });
    } else if !PROJECT_RE.is_match(&config.project) {
        errors.push(ValidationError {
            message: format!(
                "project '{}' must be lowercase letters, digits and '-'",
                config.project
            ),
        });
    }

    if config.tag_key.trim().is_empty() {
        errors.push(ValidationError {
            message: "tag_key must not be empty".to_string(),
        });
    }

    if let Some(value) = config.tags.get(&config.tag_key) {
        if *value != config.project {
            errors.push(ValidationError {
                message: format!(
                    "tags.{} = '{}' conflicts with the cleanup tag {}={}",
                    config.tag_key, value, config.tag_key, config.project
                ),
            });
        }
    }

    if config.retry.attempts == 0 {
        errors.push(ValidationError {
            message: "retry.attempts must be at least 1".to_string(),
        });
    }

    if let Some(ref env) = config.default_environment {
        if !config.environments.is_empty() && !config.environments.contains_key(env) {
            errors.push(ValidationError {
                message: format!("default_environment '{}' is not a configured environment", env),
            });
        }
    }

    if let Some(ref bucket) = config.defaults.bucket {
        if let Some(problem) = bucket_name_problem(bucket) {
            errors.push(ValidationError {
                message: format!("defaults: {}", problem),
            });
        }
    }

    for (name, env) in &config.environments {
        if name.is_empty() {
            errors.push(ValidationError {
                message: "environment names must not be empty".to_string(),
            });
        }
        if let Some(ref bucket) = env.bucket {
            if let Some(problem) = bucket_name_problem(bucket) {
                errors.push(ValidationError {
                    message: format!("environment '{}': {}", name, problem),
                });
            }
        }
    }

    for (i, hook) in config.hooks.post_apply.iter().enumerate() {
        if hook.trim().is_empty() {
            errors.push(ValidationError {
                message: format!("hooks.post_apply[{}] is empty", i),
            });
        }
    }

    errors
}

/// Pick the environment name: CLI flag, then `default_environment`, then the
/// first configured environment, then "default".
pub fn select_environment(config: &StackConfig, requested: Option<&str>) -> Result<String, String> {
    let env = requested
        .map(str::to_string)
        .or_else(|| config.default_environment.clone())
        .or_else(|| config.environments.keys().next().cloned())
        .unwrap_or_else(|| "default".to_string());

    if !config.environments.is_empty() && !config.environments.contains_key(&env) {
        let known: Vec<&str> = config.environments.keys().map(String::as_str).collect();
        return Err(format!(
            "unknown environment '{}' (known: {})",
            env,
            known.join(", ")
        ));
    }
    Ok(env)
}

/// Merge config layers and CLI flags into resolved settings.
/// Relative paths are anchored at `base_dir` (the config file's directory).
pub fn resolve_settings(
    config: &StackConfig,
    cli: &CliOverrides,
    base_dir: &Path,
) -> Result<Settings, String> {
    let environment = select_environment(config, cli.environment.as_deref())?;

    let env_layer = config
        .environments
        .get(&environment)
        .cloned()
        .unwrap_or_default();
    let cli_layer = EnvironmentOverrides {
        region: cli.region.clone(),
        profile: cli.profile.clone(),
        bucket: cli.bucket.clone(),
        ..Default::default()
    };
    let merged = config.defaults.merged_with(&env_layer).merged_with(&cli_layer);

    let bucket = merged
        .bucket
        .unwrap_or_else(|| format!("{}-{}-tfstate", config.project, environment));
    if let Some(problem) = bucket_name_problem(&bucket) {
        return Err(problem);
    }

    let state_key = merged
        .state_key
        .unwrap_or_else(|| format!("{}/{}/terraform.tfstate", config.project, environment));

    let mut variables = config.variables.clone();
    for (k, v) in merged.variables {
        variables.insert(k, v);
    }

    let mut tags = IndexMap::new();
    tags.insert(config.tag_key.clone(), config.project.clone());
    tags.insert("Environment".to_string(), environment.clone());
    tags.insert("ManagedBy".to_string(), "stackhand".to_string());
    for (k, v) in &config.tags {
        if *k != config.tag_key {
            tags.insert(k.clone(), v.clone());
        }
    }

    let mut hygiene = config.hygiene.clone();
    hygiene.backup_dir = anchor(base_dir, &hygiene.backup_dir);
    let mut journal = config.journal.clone();
    journal.dir = anchor(base_dir, &journal.dir);

    Ok(Settings {
        project: config.project.clone(),
        environment,
        region: merged.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        profile: merged.profile,
        bucket,
        state_key,
        lock_table: merged.lock_table,
        terraform_dir: anchor(base_dir, &config.terraform_dir),
        state_file: anchor(base_dir, &config.state_file),
        metadata_file: anchor(base_dir, &config.metadata_file),
        cleanup_tag: Tag {
            key: config.tag_key.clone(),
            value: config.project.clone(),
        },
        tags,
        retry: config.retry.clone(),
        teardown: config.teardown.clone(),
        hygiene,
        journal,
        ssh_key: config.ssh_key.clone(),
        hooks: config.hooks.clone(),
        variables,
        builtin_variables: config.builtin_variables,
    })
}

fn anchor(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI_ENV: &str = r#"
version: "1.0"
project: devsecops-demo
default_environment: dev
defaults:
  region: us-east-1
  profile: demo
  variables:
    instance_type: t3.micro
environments:
  dev: {}
  prod:
    region: us-west-2
    bucket: devsecops-demo-prod-state
    lock_table: tf-locks
    variables:
      instance_type: t3.large
tags:
  Owner: platform
variables:
  domain: example.com
"#;

    #[test]
    fn test_sh003_parse_valid() {
        let config = parse_config(MULTI_ENV).unwrap();
        let errors = validate_config(&config);
        assert!(
            errors.is_empty(),
            "unexpected errors: {:?}",
            errors.iter().map(|e| &e.message).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_sh003_bad_version_and_project() {
        let config = parse_config("version: \"2.0\"\nproject: My_Project\n").unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("version")));
        assert!(errors.iter().any(|e| e.message.contains("lowercase")));
    }

    #[test]
    fn test_sh003_zero_retry_attempts() {
        let config =
            parse_config("version: \"1.0\"\nproject: p\nretry:\n  attempts: 0\n").unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("retry.attempts")));
    }

    #[test]
    fn test_sh003_bad_bucket_in_environment() {
        let yaml = r#"
version: "1.0"
project: p
environments:
  dev:
    bucket: Bad_Bucket
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert!(errors
            .iter()
            .any(|e| e.message.contains("environment 'dev'") && e.message.contains("Bad_Bucket")));
    }

    #[test]
    fn test_sh003_unknown_default_environment() {
        let yaml = r#"
version: "1.0"
project: p
default_environment: staging
environments:
  dev: {}
"#;
        let errors = validate_config(&parse_config(yaml).unwrap());
        assert!(errors.iter().any(|e| e.message.contains("staging")));
    }

    #[test]
    fn test_sh003_bucket_name_rules() {
        assert!(bucket_name_problem("devsecops-demo-tfstate").is_none());
        assert!(bucket_name_problem("my.bucket.name").is_none());
        assert!(bucket_name_problem("ab").is_some());
        assert!(bucket_name_problem("-leading").is_some());
        assert!(bucket_name_problem("UPPER").is_some());
        assert!(bucket_name_problem("a..b").is_some());
        assert!(bucket_name_problem("192.168.1.10").is_some());
        assert!(bucket_name_problem(&"a".repeat(64)).is_some());
    }

    #[test]
    fn test_sh003_resolve_default_environment() {
        let config = parse_config(MULTI_ENV).unwrap();
        let s = resolve_settings(&config, &CliOverrides::default(), Path::new("/work")).unwrap();
        assert_eq!(s.environment, "dev");
        assert_eq!(s.region, "us-east-1");
        assert_eq!(s.profile.as_deref(), Some("demo"));
        assert_eq!(s.bucket, "devsecops-demo-dev-tfstate");
        assert_eq!(s.state_key, "devsecops-demo/dev/terraform.tfstate");
        assert_eq!(s.variables["instance_type"], "t3.micro");
        assert_eq!(s.variables["domain"], "example.com");
        assert_eq!(s.terraform_dir, PathBuf::from("/work/terraform"));
        assert_eq!(s.metadata_file, PathBuf::from("/work/.stackhand/backend.env"));
        assert_eq!(s.hygiene.backup_dir, PathBuf::from("/work/.stackhand/backups"));
    }

    #[test]
    fn test_sh003_resolve_environment_override() {
        let config = parse_config(MULTI_ENV).unwrap();
        let cli = CliOverrides {
            environment: Some("prod".into()),
            ..Default::default()
        };
        let s = resolve_settings(&config, &cli, Path::new("/work")).unwrap();
        assert_eq!(s.region, "us-west-2");
        assert_eq!(s.profile.as_deref(), Some("demo"));
        assert_eq!(s.bucket, "devsecops-demo-prod-state");
        assert_eq!(s.lock_table.as_deref(), Some("tf-locks"));
        assert_eq!(s.variables["instance_type"], "t3.large");
    }

    #[test]
    fn test_sh003_cli_flags_win() {
        let config = parse_config(MULTI_ENV).unwrap();
        let cli = CliOverrides {
            environment: Some("prod".into()),
            region: Some("eu-central-1".into()),
            profile: Some("ci".into()),
            bucket: Some("override-bucket".into()),
        };
        let s = resolve_settings(&config, &cli, Path::new("/work")).unwrap();
        assert_eq!(s.region, "eu-central-1");
        assert_eq!(s.profile.as_deref(), Some("ci"));
        assert_eq!(s.bucket, "override-bucket");
    }

    #[test]
    fn test_sh003_cli_bucket_validated() {
        let config = parse_config(MULTI_ENV).unwrap();
        let cli = CliOverrides {
            bucket: Some("No".into()),
            ..Default::default()
        };
        assert!(resolve_settings(&config, &cli, Path::new("/work")).is_err());
    }

    #[test]
    fn test_sh003_unknown_environment() {
        let config = parse_config(MULTI_ENV).unwrap();
        let cli = CliOverrides {
            environment: Some("qa".into()),
            ..Default::default()
        };
        let err = resolve_settings(&config, &cli, Path::new("/work")).unwrap_err();
        assert!(err.contains("unknown environment 'qa'"));
        assert!(err.contains("dev, prod"));
    }

    #[test]
    fn test_sh003_no_environments_uses_default() {
        let config = parse_config("version: \"1.0\"\nproject: solo\n").unwrap();
        let s = resolve_settings(&config, &CliOverrides::default(), Path::new(".")).unwrap();
        assert_eq!(s.environment, "default");
        assert_eq!(s.bucket, "solo-default-tfstate");
        assert_eq!(s.region, "us-east-1");
        assert!(s.profile.is_none());
    }

    #[test]
    fn test_sh003_tags_merged() {
        let config = parse_config(MULTI_ENV).unwrap();
        let s = resolve_settings(&config, &CliOverrides::default(), Path::new("/work")).unwrap();
        assert_eq!(s.cleanup_tag.key, "Project");
        assert_eq!(s.cleanup_tag.value, "devsecops-demo");
        assert_eq!(s.tags["Project"], "devsecops-demo");
        assert_eq!(s.tags["Environment"], "dev");
        assert_eq!(s.tags["ManagedBy"], "stackhand");
        assert_eq!(s.tags["Owner"], "platform");
    }

    #[test]
    fn test_sh003_user_tags_cannot_replace_cleanup_tag() {
        let config =
            parse_config("version: \"1.0\"\nproject: demo\ntags:\n  Project: other\n  Owner: ops\n")
                .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("cleanup tag")));

        let s = resolve_settings(&config, &CliOverrides::default(), Path::new("/work")).unwrap();
        assert_eq!(s.tags["Project"], "demo");
        assert_eq!(s.tags["Owner"], "ops");

        let same = parse_config("version: \"1.0\"\nproject: demo\ntags:\n  Project: demo\n").unwrap();
        assert!(validate_config(&same).is_empty());
    }

    #[test]
    fn test_sh003_absolute_paths_kept() {
        let yaml = "version: \"1.0\"\nproject: p\nstate_file: /var/tf/terraform.tfstate\n";
        let config = parse_config(yaml).unwrap();
        let s = resolve_settings(&config, &CliOverrides::default(), Path::new("/work")).unwrap();
        assert_eq!(s.state_file, PathBuf::from("/var/tf/terraform.tfstate"));
    }

    #[test]
    fn test_sh003_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackhand.yaml");
        std::fs::write(&path, "version: \"1.0\"\nproject: file-test\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.project, "file-test");
    }

    #[test]
    fn test_sh003_parse_invalid_yaml() {
        assert!(parse_config("not: [valid: yaml: {{").is_err());
    }
}
