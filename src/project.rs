//! Project configuration discovery and loading.
//!
//! Planloop projects are defined by a `.planloop.toml` file at the project
//! root. This module walks up the directory tree to find it, parses it,
//! and creates it on `planloop init`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::run_loop::{DEFAULT_ACTION_TIMEOUT, DEFAULT_MAX_ACTIONS_PER_STEP, DEFAULT_MAX_RETRIES};

pub const CONFIG_FILE: &str = ".planloop.toml";
pub const STATE_DIR: &str = ".planloop";
const DEFAULT_EVENTS_DB: &str = ".planloop/events.db";

/// Project configuration loaded from `.planloop.toml`.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// The directory containing `.planloop.toml`.
    pub root: PathBuf,
    pub config: PlanloopConfig,
}

impl ProjectConfig {
    /// Absolute path of the event database.
    pub fn events_db(&self) -> PathBuf {
        self.root.join(&self.config.stream.path)
    }
}

/// Contents of `.planloop.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlanloopConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_max_actions_per_step")]
    pub max_actions_per_step: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            action_timeout_secs: default_action_timeout_secs(),
            max_actions_per_step: default_max_actions_per_step(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Event database, relative to the project root.
    #[serde(default = "default_events_db")]
    pub path: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: default_events_db(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_action_timeout_secs() -> u64 {
    DEFAULT_ACTION_TIMEOUT.as_secs()
}

fn default_max_actions_per_step() -> usize {
    DEFAULT_MAX_ACTIONS_PER_STEP
}

fn default_events_db() -> PathBuf {
    PathBuf::from(DEFAULT_EVENTS_DB)
}

/// Discover the project configuration by walking up from CWD.
///
/// Returns an error if no `.planloop.toml` is found, instructing the user
/// to run `planloop init`.
pub fn discover() -> Result<ProjectConfig> {
    let cwd = env::current_dir()?;
    discover_from(&cwd)
}

fn discover_from(start: &Path) -> Result<ProjectConfig> {
    let mut current = start;

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.is_file() {
            let config = load_config(&config_path)?;
            return Ok(ProjectConfig {
                root: current.to_path_buf(),
                config,
            });
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => {
                bail!("No {CONFIG_FILE} found. Run 'planloop init' to create one.")
            }
        }
    }
}

fn load_config(path: &Path) -> Result<PlanloopConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let config: PlanloopConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(config)
}

/// Initialize a planloop project in the current directory.
///
/// Creates `.planloop.toml` with commented defaults, the `.planloop/`
/// directory, and a `.gitignore` entry for it. Running it again changes
/// nothing.
pub fn init() -> Result<()> {
    let cwd = env::current_dir()?;
    init_in_dir(&cwd)
}

fn init_in_dir(cwd: &Path) -> Result<()> {
    let config_path = cwd.join(CONFIG_FILE);
    if config_path.exists() {
        println!("{CONFIG_FILE} already exists, skipping.");
    } else {
        let default_config = format!(
            r#"[execution]
# max_retries = {DEFAULT_MAX_RETRIES}
# action_timeout_secs = {}
# max_actions_per_step = {DEFAULT_MAX_ACTIONS_PER_STEP}

[stream]
# path = "{DEFAULT_EVENTS_DB}"
"#,
            DEFAULT_ACTION_TIMEOUT.as_secs()
        );
        fs::write(&config_path, default_config)
            .with_context(|| format!("Failed to create {CONFIG_FILE}"))?;
        println!("Created {CONFIG_FILE}");
    }

    fs::create_dir_all(cwd.join(STATE_DIR))
        .with_context(|| format!("Failed to create {STATE_DIR}/ directory"))?;

    let gitignore_path = cwd.join(".gitignore");
    let entry = format!("{STATE_DIR}/");

    if gitignore_path.exists() {
        let content = fs::read_to_string(&gitignore_path).context("Failed to read .gitignore")?;
        if !content.lines().any(|line| line.trim() == entry) {
            let mut new_content = content;
            if !new_content.is_empty() && !new_content.ends_with('\n') {
                new_content.push('\n');
            }
            new_content.push_str(&entry);
            new_content.push('\n');
            fs::write(&gitignore_path, new_content).context("Failed to update .gitignore")?;
            println!("Added {entry} to .gitignore");
        }
    } else {
        fs::write(&gitignore_path, format!("{entry}\n")).context("Failed to create .gitignore")?;
        println!("Created .gitignore with {entry}");
    }

    println!("\nPlanloop project initialized.");
    println!("Next: planloop run \"<request>\" --step \"[RUN] <command>\"");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_project(toml_content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join(CONFIG_FILE), toml_content).unwrap();
        (dir, root)
    }

    #[test]
    fn discovers_config_in_start_dir() {
        let (_tmp, root) = temp_project("[execution]\nmax_retries = 5");
        let result = discover_from(&root).unwrap();
        assert_eq!(result.root, root);
        assert_eq!(result.config.execution.max_retries, 5);
    }

    #[test]
    fn discovers_config_two_directories_up() {
        let (_tmp, root) = temp_project("[execution]\nmax_retries = 5");
        let subdir = root.join("a").join("b");
        fs::create_dir_all(&subdir).unwrap();

        let result = discover_from(&subdir).unwrap();
        assert_eq!(result.root, root);
    }

    #[test]
    fn no_config_returns_error_with_init_message() {
        let tmp = TempDir::new().unwrap();
        let err_msg = discover_from(tmp.path()).unwrap_err().to_string();
        assert!(err_msg.contains("planloop init"), "got: {err_msg}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let (_tmp, root) = temp_project("");
        let result = discover_from(&root).unwrap();
        assert_eq!(result.config.execution.max_retries, 2);
        assert_eq!(result.config.execution.action_timeout_secs, 120);
        assert_eq!(result.config.execution.max_actions_per_step, 8);
        assert_eq!(result.events_db(), root.join(".planloop/events.db"));
    }

    #[test]
    fn stream_path_is_relative_to_root() {
        let (_tmp, root) = temp_project("[stream]\npath = \"data/log.db\"");
        let result = discover_from(&root).unwrap();
        assert_eq!(result.events_db(), root.join("data/log.db"));
    }

    #[test]
    fn invalid_toml_returns_error() {
        let (_tmp, root) = temp_project("[execution\nmax_retries = 3");
        assert!(discover_from(&root).is_err());
    }

    #[test]
    fn unknown_keys_ignored() {
        let (_tmp, root) = temp_project("[foo]\nbar = 1\n[execution]\nmax_retries = 7");
        let result = discover_from(&root).unwrap();
        assert_eq!(result.config.execution.max_retries, 7);
    }

    #[test]
    fn init_creates_config_dir_and_gitignore() {
        let tmp = TempDir::new().unwrap();
        init_in_dir(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert!(tmp.path().join(STATE_DIR).is_dir());
        let gitignore = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".planloop/"));

        // The commented template must still parse to defaults.
        let parsed = discover_from(tmp.path()).unwrap();
        assert_eq!(parsed.config.execution.max_retries, 2);
    }

    #[test]
    fn init_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), "target/").unwrap();

        init_in_dir(tmp.path()).unwrap();
        let first = fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        init_in_dir(tmp.path()).unwrap();
        let second = fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(first, second);

        let gitignore = fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert!(gitignore.starts_with("target/\n"));
        assert_eq!(gitignore.matches(".planloop/").count(), 1);
    }
}
