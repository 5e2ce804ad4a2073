//! Replicates the entry log by committing it to a git repository and pushing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::SyncNotifier;
use crate::config::SyncConfig;
use crate::error::{IngestError, Result};

/// Commits the store file and pushes it with the `git` CLI
#[derive(Debug, Clone)]
pub struct GitNotifier {
    repo_path: PathBuf,
    file: PathBuf,
    timeout: Duration,
    push: bool,
}

impl GitNotifier {
    /// # Arguments
    ///
    /// * `repo_path` - Working tree the commands run in
    /// * `file` - Store file to stage, relative to `repo_path` or absolute
    pub fn new(repo_path: impl Into<PathBuf>, file: impl Into<PathBuf>, timeout: Duration, push: bool) -> Self {
        Self {
            repo_path: repo_path.into(),
            file: file.into(),
            timeout,
            push,
        }
    }

    /// Build from configuration
    ///
    /// `store_path` is resolved the way the store resolves it (against the
    /// process working directory) and then expressed relative to
    /// `repo_path`, where the git commands run.
    pub fn from_config(config: &SyncConfig, store_path: &Path) -> Self {
        let repo_path = PathBuf::from(&config.repo_path);
        let file = path_in_repo(&repo_path, store_path);

        Self::new(
            repo_path,
            file,
            Duration::from_millis(config.command_timeout_ms),
            config.push,
        )
    }

    /// Run one git command, returning its stdout
    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!("git {}", args.join(" "));

        let child = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IngestError::Sync(format!("failed to run git {}: {}", args[0], e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| IngestError::Timeout(format!("git {} after {:?}", args[0], self.timeout)))?
            .map_err(|e| IngestError::Sync(format!("git {} failed: {}", args[0], e)))?;

        if !output.status.success() {
            return Err(IngestError::Sync(format!(
                "git {} exited with {}: {}",
                args[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn file_arg(&self) -> Result<&str> {
        self.file
            .to_str()
            .ok_or_else(|| IngestError::Sync(format!("store path is not UTF-8: {}", self.file.display())))
    }
}

/// `store_path` relative to the working tree at `repo_path`
///
/// Falls back to the absolute store path (logging a warning) when the store
/// lives outside the repository.
fn path_in_repo(repo_path: &Path, store_path: &Path) -> PathBuf {
    let repo = absolute(repo_path);
    let repo = repo.canonicalize().unwrap_or(repo);

    // The store file may not exist yet, so only its directory is canonicalized
    let store = absolute(store_path);
    let canonical = match (store.parent(), store.file_name()) {
        (Some(parent), Some(name)) => parent.canonicalize().ok().map(|p| p.join(name)),
        _ => None,
    };
    let store = canonical.unwrap_or(store);

    match store.strip_prefix(&repo) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => {
            warn!(
                "Store {} is outside the sync repository {}; git will reject it",
                store.display(),
                repo.display()
            );
            store
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

#[async_trait]
impl SyncNotifier for GitNotifier {
    async fn notify(&self, change: &str) -> Result<()> {
        let file = self.file_arg()?;

        let status = self.git(&["status", "--porcelain", "--", file]).await?;
        if status.trim().is_empty() {
            info!("No changes to push");
            return Ok(());
        }

        self.git(&["add", "--", file]).await?;
        self.git(&["commit", "-m", change]).await?;

        if self.push {
            self.git(&["push"]).await?;
            info!("Pushed '{}' to remote", change);
        } else {
            info!("Committed '{}'", change);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.name", "Aqua Ingest Test"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "commit.gpgsign", "false"],
        ] {
            let status = StdCommand::new("git").args(&args).current_dir(dir).status().unwrap();
            assert!(status.success());
        }
    }

    fn commit_count(dir: &Path) -> usize {
        let out = StdCommand::new("git")
            .args(["rev-list", "--count", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        if !out.status.success() {
            return 0;
        }
        String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
    }

    #[tokio::test]
    async fn test_commits_changed_file() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("coordinates.json"), "{\"entries\": []}").unwrap();

        let notifier = GitNotifier::new(dir.path(), "coordinates.json", Duration::from_secs(30), false);
        notifier.notify("Add sensor data entry").await.unwrap();

        assert_eq!(commit_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_unchanged_file_is_skipped() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("coordinates.json"), "{}").unwrap();

        let notifier = GitNotifier::new(dir.path(), "coordinates.json", Duration::from_secs(30), false);
        notifier.notify("first").await.unwrap();
        notifier.notify("second").await.unwrap();

        assert_eq!(commit_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_outside_repository_fails() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let notifier = GitNotifier::new(dir.path().join("missing"), "coordinates.json", Duration::from_secs(30), false);

        let result = notifier.notify("Add sensor data entry").await;
        assert!(matches!(result, Err(IngestError::Sync(_))));
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig::default();
        let notifier = GitNotifier::from_config(&config, Path::new("coordinates.json"));
        assert_eq!(notifier.repo_path, PathBuf::from("."));
        assert_eq!(notifier.file, PathBuf::from("coordinates.json"));
        assert_eq!(notifier.timeout, Duration::from_secs(30));
        assert!(notifier.push);
    }

    #[test]
    fn test_store_path_is_made_relative_to_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("data")).unwrap();

        let file = path_in_repo(&repo, &repo.join("data/coordinates.json"));
        assert_eq!(file, PathBuf::from("data/coordinates.json"));
    }

    #[test]
    fn test_relative_store_path_resolves_against_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();

        // Relative store path, repository elsewhere: git needs the full path
        let file = path_in_repo(dir.path(), Path::new("coordinates.json"));
        assert_eq!(file, cwd.join("coordinates.json"));
    }

    #[tokio::test]
    async fn test_commits_store_in_repo_subdirectory() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("data")).unwrap();
        init_repo(&repo);
        let store_path = repo.join("data/coordinates.json");
        std::fs::write(&store_path, "{\"entries\": []}").unwrap();

        let config = SyncConfig {
            enabled: true,
            repo_path: repo.display().to_string(),
            push: false,
            ..Default::default()
        };
        let notifier = GitNotifier::from_config(&config, &store_path);
        notifier.notify("Add sensor data entry").await.unwrap();

        assert_eq!(commit_count(&repo), 1);
    }
}
