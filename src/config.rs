use anyhow::{ensure, Context, Result};
use dirs::{config_dir, home_dir};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::lister::RetryPolicy;

pub const GIT_USER_VAR: &str = "GIT_USER";
pub const REPO_DIR_VAR: &str = "REPO_DIR";
pub const API_KEY_VAR: &str = "GITHUB_API_KEY";
pub const ORG_VAR: &str = "GITHUB_ORG";

/// GitHub caps `per_page` at 100 for organization listings.
pub const MAX_PAGE_SIZE: u8 = 100;

/// Upper bound for any configured timeout, one year in seconds
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Raw credential values as given on the command line
#[derive(Debug, Clone, Default)]
pub struct CredentialArgs {
    pub user: Option<String>,
    pub repo_dir: Option<String>,
    pub token: Option<String>,
    pub org: Option<String>,
}

/// Account, token, local root and organization for one run.
///
/// Resolved once before the pipeline starts and shared read-only afterwards.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub token: String,
    pub repo_dir: PathBuf,
    pub org: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .field("repo_dir", &self.repo_dir)
            .field("org", &self.org)
            .finish()
    }
}

impl Credentials {
    /// Resolve credentials from flags, then the process environment, then `~/.gitconfig`
    pub fn resolve(args: CredentialArgs) -> Result<Self> {
        Self::resolve_with(args, |var| std::env::var(var).ok(), read_user_gitconfig)
    }

    /// Resolve credentials with explicit environment and gitconfig sources.
    ///
    /// A flag wins over its environment variable. Only the user and the token
    /// fall back to `user =` / `token =` lines of the gitconfig contents, which
    /// are read at most once and only when needed.
    pub fn resolve_with<E, G>(args: CredentialArgs, env: E, gitconfig: G) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
        G: FnOnce() -> Option<String>,
    {
        let pick = |flag: Option<String>, var: &str| {
            non_empty(flag).or_else(|| non_empty(env(var)))
        };

        let user = pick(args.user, GIT_USER_VAR);
        let token = pick(args.token, API_KEY_VAR);

        let gitconfig = if user.is_none() || token.is_none() {
            gitconfig()
        } else {
            None
        };
        let from_gitconfig = |key: &str| {
            gitconfig
                .as_deref()
                .and_then(|contents| find_gitconfig_value(contents, key))
        };

        let user = user
            .or_else(|| from_gitconfig("user"))
            .context("must specify github username (-u, GIT_USER or `user =` in ~/.gitconfig)")?;
        let repo_dir = pick(args.repo_dir, REPO_DIR_VAR)
            .context("must specify local directory to store git repos (-r or REPO_DIR)")?;
        let token = token
            .or_else(|| from_gitconfig("token"))
            .context("must specify a valid github api key (-a, GITHUB_API_KEY or `token =` in ~/.gitconfig)")?;
        let org = pick(args.org, ORG_VAR)
            .context("must specify github organization to query (-o or GITHUB_ORG)")?;

        if !token.starts_with("ghp_")
            && !token.starts_with("gho_")
            && !token.starts_with("ghs_")
            && !token.starts_with("github_pat_")
        {
            warn!("API key doesn't look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)");
        }

        Ok(Self {
            user,
            token,
            repo_dir: expand_repo_dir(&repo_dir)?,
            org,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Expand `~` and environment variables, then normalise the path
pub fn expand_repo_dir(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .with_context(|| format!("Failed to expand repository directory: {}", raw))?;
    Ok(path_clean::clean(expanded.as_ref()))
}

fn read_user_gitconfig() -> Option<String> {
    let path = home_dir()?.join(".gitconfig");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Some(contents),
        Err(e) => {
            debug!("Could not read {}: {}", path.display(), e);
            None
        }
    }
}

lazy_static! {
    // `key = value` lines, with surrounding blanks trimmed
    static ref GITCONFIG_LINE: Regex = Regex::new(
        r"(?m)^[ \t]*([A-Za-z0-9_.-]+)[ \t]*=[ \t]*(.*?)[ \t\r]*$"
    ).expect("GITCONFIG_LINE regex is valid");
}

/// Value of the first `key = value` line in gitconfig-style contents
pub fn find_gitconfig_value(contents: &str, key: &str) -> Option<String> {
    GITCONFIG_LINE
        .captures_iter(contents)
        .find(|caps| &caps[1] == key)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
        .filter(|v| !v.is_empty())
}

/// Tuning knobs for a sync run, loaded from an optional YAML file
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    /// Deadlines in seconds
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Remote listing behaviour
    #[serde(default)]
    pub listing: ListingConfig,

    /// How git gets invoked
    #[serde(default)]
    pub git: GitSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    /// Budget for the whole run
    #[serde(default = "default_run_timeout")]
    pub run: u64,

    /// Budget for a single pull or clone
    #[serde(default = "default_repository_timeout")]
    pub repository: u64,

    /// Budget for fetching one page of the organization listing
    #[serde(default = "default_list_page_timeout")]
    pub list_page: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListingConfig {
    #[serde(default = "default_per_page")]
    pub per_page: u8,

    /// Pages buffered between the lister and the reconciler
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Extra attempts for a page after a non rate-limit error
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitSettings {
    /// Executable used for pulls and clones
    #[serde(default = "default_git_program")]
    pub program: String,

    /// Arguments placed before `-C <dir>`, e.g. `["-c", "protocol.version=2"]`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_run_timeout() -> u64 {
    300
}
fn default_repository_timeout() -> u64 {
    240
}
fn default_list_page_timeout() -> u64 {
    30
}
fn default_per_page() -> u8 {
    MAX_PAGE_SIZE
}
fn default_channel_capacity() -> usize {
    10_000
}
fn default_max_retries() -> usize {
    3
}
fn default_min_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_git_program() -> String {
    "git".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            run: default_run_timeout(),
            repository: default_repository_timeout(),
            list_page: default_list_page_timeout(),
        }
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            channel_capacity: default_channel_capacity(),
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            program: default_git_program(),
            extra_args: Vec::new(),
        }
    }
}

/// Deadlines and buffer sizes the pipeline runs with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    pub run_timeout: Duration,
    pub repository_timeout: Duration,
    pub list_page_timeout: Duration,
    pub per_page: u8,
    pub channel_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for RunLimits {
    fn default() -> Self {
        Settings::default().limits()
    }
}

impl Settings {
    /// Load settings from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_config_path()?;

        if path.exists() {
            Self::load(&path)
        } else {
            debug!("No settings file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load settings from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        settings
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        Ok(settings)
    }

    /// Get the default settings file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("orgsync").join("config.yml"))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.timeouts.run > 0, "timeouts.run must be greater than zero");
        ensure!(
            self.timeouts.repository > 0,
            "timeouts.repository must be greater than zero"
        );
        ensure!(
            self.timeouts.list_page > 0,
            "timeouts.list_page must be greater than zero"
        );
        for (name, secs) in [
            ("timeouts.run", self.timeouts.run),
            ("timeouts.repository", self.timeouts.repository),
            ("timeouts.list_page", self.timeouts.list_page),
        ] {
            ensure!(
                secs <= MAX_TIMEOUT_SECS,
                "{} must be at most {} seconds",
                name,
                MAX_TIMEOUT_SECS
            );
        }
        ensure!(
            (1..=MAX_PAGE_SIZE).contains(&self.listing.per_page),
            "listing.per_page must be between 1 and {}",
            MAX_PAGE_SIZE
        );
        ensure!(
            self.listing.channel_capacity > 0,
            "listing.channel_capacity must be greater than zero"
        );
        ensure!(!self.git.program.is_empty(), "git.program must not be empty");

        if self.timeouts.repository > self.timeouts.run {
            warn!(
                "timeouts.repository ({}s) exceeds timeouts.run ({}s); repository deadlines are capped by the run deadline",
                self.timeouts.repository, self.timeouts.run
            );
        }

        Ok(())
    }

    pub fn limits(&self) -> RunLimits {
        RunLimits {
            run_timeout: Duration::from_secs(self.timeouts.run),
            repository_timeout: Duration::from_secs(self.timeouts.repository),
            list_page_timeout: Duration::from_secs(self.timeouts.list_page),
            per_page: self.listing.per_page,
            channel_capacity: self.listing.channel_capacity,
            retry: RetryPolicy::new(
                Duration::from_millis(self.listing.min_backoff_ms),
                Duration::from_millis(self.listing.max_backoff_ms),
                self.listing.max_retries,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn full_args() -> CredentialArgs {
        CredentialArgs {
            user: Some("flag-user".to_string()),
            repo_dir: Some("/srv/repos".to_string()),
            token: Some("ghp_flag".to_string()),
            org: Some("flag-org".to_string()),
        }
    }

    #[test]
    fn test_flags_win_over_environment() {
        let env = env_from(&[
            (GIT_USER_VAR, "env-user"),
            (REPO_DIR_VAR, "/env/repos"),
            (API_KEY_VAR, "ghp_env"),
            (ORG_VAR, "env-org"),
        ]);

        let creds = Credentials::resolve_with(full_args(), env, || {
            panic!("gitconfig must not be read when flags are complete")
        })
        .expect("resolve");

        assert_eq!(creds.user, "flag-user");
        assert_eq!(creds.repo_dir, PathBuf::from("/srv/repos"));
        assert_eq!(creds.token, "ghp_flag");
        assert_eq!(creds.org, "flag-org");
    }

    #[test]
    fn test_environment_fills_missing_flags() {
        let env = env_from(&[
            (GIT_USER_VAR, "env-user"),
            (REPO_DIR_VAR, "/env/repos"),
            (API_KEY_VAR, "ghp_env"),
            (ORG_VAR, "env-org"),
        ]);

        let creds =
            Credentials::resolve_with(CredentialArgs::default(), env, || None).expect("resolve");

        assert_eq!(creds.user, "env-user");
        assert_eq!(creds.repo_dir, PathBuf::from("/env/repos"));
        assert_eq!(creds.token, "ghp_env");
        assert_eq!(creds.org, "env-org");
    }

    #[test]
    fn test_gitconfig_fallback_for_user_and_token() {
        let env = env_from(&[(REPO_DIR_VAR, "/env/repos"), (ORG_VAR, "env-org")]);
        let gitconfig = "[user]\n\tname = Jane\n[github]\n\tuser = jane-gh\n\ttoken = ghp_fromfile\n";

        let creds = Credentials::resolve_with(CredentialArgs::default(), env, || {
            Some(gitconfig.to_string())
        })
        .expect("resolve");

        assert_eq!(creds.user, "jane-gh");
        assert_eq!(creds.token, "ghp_fromfile");
    }

    #[test]
    fn test_gitconfig_never_supplies_repo_dir_or_org() {
        let env = env_from(&[(GIT_USER_VAR, "u"), (API_KEY_VAR, "ghp_x")]);

        let err = Credentials::resolve_with(CredentialArgs::default(), env, || {
            Some("repo_dir = /tmp\norg = nope\n".to_string())
        })
        .unwrap_err();

        assert!(err.to_string().contains("local directory"));
    }

    #[test]
    fn test_missing_user_is_an_error() {
        let mut args = full_args();
        args.user = None;

        let err = Credentials::resolve_with(args, env_from(&[]), || None).unwrap_err();
        assert!(err.to_string().contains("github username"));
    }

    #[test]
    fn test_missing_org_is_an_error() {
        let mut args = full_args();
        args.org = Some("   ".to_string());

        let err = Credentials::resolve_with(args, env_from(&[]), || None).unwrap_err();
        assert!(err.to_string().contains("organization"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds =
            Credentials::resolve_with(full_args(), env_from(&[]), || None).expect("resolve");
        let printed = format!("{:?}", creds);

        assert!(!printed.contains("ghp_flag"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_find_gitconfig_value() {
        let contents = "[github]\n  user   =   octocat  \n  token=abc123\n";

        assert_eq!(find_gitconfig_value(contents, "user"), Some("octocat".to_string()));
        assert_eq!(find_gitconfig_value(contents, "token"), Some("abc123".to_string()));
        assert_eq!(find_gitconfig_value(contents, "email"), None);
        assert_eq!(find_gitconfig_value("username = x\n", "user"), None);
        assert_eq!(find_gitconfig_value("user =\n", "user"), None);
    }

    #[test]
    fn test_expand_repo_dir() {
        std::env::set_var("TEST_ORGSYNC_HOME", "/test/home");

        let path = expand_repo_dir("${TEST_ORGSYNC_HOME}/dev/./repos/").expect("expand");
        assert_eq!(path, PathBuf::from("/test/home/dev/repos"));

        std::env::remove_var("TEST_ORGSYNC_HOME");
    }

    #[test]
    fn test_settings_default_values() {
        let settings = Settings::default();

        assert_eq!(settings.timeouts.run, 300);
        assert_eq!(settings.timeouts.repository, 240);
        assert_eq!(settings.timeouts.list_page, 30);
        assert_eq!(settings.listing.per_page, 100);
        assert_eq!(settings.listing.channel_capacity, 10_000);
        assert_eq!(settings.listing.max_retries, 3);
        assert_eq!(settings.git.program, "git");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_limits_conversion() {
        let limits = Settings::default().limits();

        assert_eq!(limits.run_timeout, Duration::from_secs(300));
        assert_eq!(limits.repository_timeout, Duration::from_secs(240));
        assert_eq!(limits.list_page_timeout, Duration::from_secs(30));
        assert_eq!(limits.retry.max_retries, 3);
    }

    #[test]
    fn test_yaml_parsing_partial() {
        let yaml_content = r#"
timeouts:
  run: 60
listing:
  per_page: 50
  max_retries: 0
git:
  program: "/usr/local/bin/git"
  extra_args: ["-c", "protocol.version=2"]
"#;

        let settings: Settings = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(settings.timeouts.run, 60);
        assert_eq!(settings.timeouts.repository, 240);
        assert_eq!(settings.listing.per_page, 50);
        assert_eq!(settings.listing.max_retries, 0);
        assert_eq!(settings.listing.channel_capacity, 10_000);
        assert_eq!(settings.git.program, "/usr/local/bin/git");
        assert_eq!(settings.git.extra_args.len(), 2);
    }

    #[test]
    fn test_load_rejects_oversized_pages() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.yml");
        std::fs::write(&path, "listing:\n  per_page: 101\n").expect("write");

        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("per_page"));
    }

    #[test]
    fn test_load_rejects_unbounded_timeouts() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.yml");
        std::fs::write(&path, "timeouts:\n  run: 18446744073709551615\n").expect("write");

        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("timeouts.run must be at most"));

        let settings: Settings =
            serde_yaml::from_str("timeouts:\n  repository: 31536001\n").expect("parse");
        assert!(settings.validate().is_err());

        let settings: Settings =
            serde_yaml::from_str("timeouts:\n  run: 31536000\n").expect("parse");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Settings::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_default_config_path() {
        let path = Settings::default_config_path().expect("Failed to get default path");
        assert!(path.to_string_lossy().contains("orgsync"));
        assert!(path.to_string_lossy().ends_with("config.yml"));
    }
}
