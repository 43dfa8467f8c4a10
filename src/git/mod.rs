// The version-control collaborator: init/add/remove/commit/sync plus the
// process-local advisory lock serializing all of them.

use crate::error::{Result, VaultError};
use git2::Repository;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Handle to the git repository backing a store root.
///
/// The repository is reopened per operation; `git2::Repository` is not
/// `Sync` and the store must be shareable across threads.
pub struct Git {
    root: PathBuf,
    lock: Mutex<()>,
}

/// Held for the duration of an add/commit/sync sequence. At most one
/// version-control operation is outstanding per store instance.
pub struct GitLock<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl Git {
    pub fn new(root: &Path) -> Git {
        Git {
            root: root.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn is_repo(&self) -> bool {
        Repository::open(&self.root).is_ok()
    }

    pub fn init(&self) -> Result<()> {
        if !self.is_repo() {
            Repository::init(&self.root).map_err(|e| VaultError::git("init", e))?;
        }
        Ok(())
    }

    /// Acquire the process-local advisory lock. Multi-process exclusion is
    /// left to git's own index.lock.
    pub fn lock(&self) -> Result<GitLock<'_>> {
        self.lock
            .lock()
            .map(GitLock)
            .map_err(|_| VaultError::Lock("git lock poisoned".to_string()))
    }

    /// The lock file git creates while mutating its index. The watcher
    /// pauses event emission while this path exists.
    pub fn lock_file_path(&self) -> PathBuf {
        self.root.join(".git").join("index.lock")
    }

    /// Stage paths (relative to the root) in one index write.
    pub fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let repo = self.open()?;
        let mut index = repo.index().map_err(|e| VaultError::git("add", e))?;
        for path in paths {
            index
                .add_path(Path::new(path))
                .map_err(|e| VaultError::git(format!("add {path}"), e))?;
        }
        index.write().map_err(|e| VaultError::git("add", e))?;
        Ok(())
    }

    /// Unstage removed paths. Paths git never tracked are skipped.
    pub fn remove(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let repo = self.open()?;
        let mut index = repo.index().map_err(|e| VaultError::git("remove", e))?;
        for path in paths {
            if index.remove_path(Path::new(path)).is_err() {
                log::debug!("remove: {path} was not tracked");
            }
        }
        index.write().map_err(|e| VaultError::git("remove", e))?;
        Ok(())
    }

    /// Create one checkpoint from the current index state.
    pub fn commit(&self, message: &str) -> Result<()> {
        let repo = self.open()?;
        let mut index = repo.index().map_err(|e| VaultError::git("commit", e))?;
        let tree_id = index
            .write_tree()
            .map_err(|e| VaultError::git("commit", e))?;
        let tree = repo
            .find_tree(tree_id)
            .map_err(|e| VaultError::git("commit", e))?;
        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("vaultdb", "vaultdb@localhost"))
            .map_err(|e| VaultError::git("commit", e))?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(|e| VaultError::git("commit", e))?;
        Ok(())
    }

    /// Pull-then-push against `origin`. Only fast-forward updates are
    /// applied locally; with no remote configured this is a no-op.
    pub fn sync(&self) -> Result<()> {
        let repo = self.open()?;
        let mut remote = match repo.find_remote("origin") {
            Ok(remote) => remote,
            Err(_) => {
                log::debug!("sync: no 'origin' remote configured");
                return Ok(());
            }
        };

        let head = repo.head().map_err(|e| VaultError::git("sync", e))?;
        let branch = head.shorthand().unwrap_or("master").to_string();

        remote
            .fetch(&[branch.as_str()], None, None)
            .map_err(|e| VaultError::git("sync fetch", e))?;

        if let Ok(fetch_head) = repo.find_reference("FETCH_HEAD") {
            let fetch_commit = repo
                .reference_to_annotated_commit(&fetch_head)
                .map_err(|e| VaultError::git("sync", e))?;
            let (analysis, _) = repo
                .merge_analysis(&[&fetch_commit])
                .map_err(|e| VaultError::git("sync", e))?;
            if analysis.is_fast_forward() {
                let refname = format!("refs/heads/{branch}");
                let mut reference = repo
                    .find_reference(&refname)
                    .map_err(|e| VaultError::git("sync", e))?;
                reference
                    .set_target(fetch_commit.id(), "sync fast-forward")
                    .map_err(|e| VaultError::git("sync", e))?;
                repo.set_head(&refname)
                    .map_err(|e| VaultError::git("sync", e))?;
                repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))
                    .map_err(|e| VaultError::git("sync", e))?;
            }
        }

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], None)
            .map_err(|e| VaultError::git("sync push", e))?;
        Ok(())
    }

    /// Append the system directory to .gitignore once.
    pub fn ensure_ignore(&self, system_dir: &str) -> Result<()> {
        let ignore_path = self.root.join(".gitignore");
        let existing = std::fs::read_to_string(&ignore_path).unwrap_or_default();
        let wanted = format!("{system_dir}/");
        let present = existing
            .lines()
            .any(|line| line.trim() == wanted || line.trim() == system_dir);
        if !present {
            let mut updated = existing;
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&wanted);
            updated.push('\n');
            std::fs::write(&ignore_path, updated)?;
        }
        Ok(())
    }

    /// Count of checkpoints reachable from HEAD. Zero for an unborn branch.
    pub fn commit_count(&self) -> Result<usize> {
        let repo = self.open()?;
        if repo.head().is_err() {
            return Ok(0);
        }
        let mut walk = repo.revwalk().map_err(|e| VaultError::git("log", e))?;
        walk.push_head().map_err(|e| VaultError::git("log", e))?;
        Ok(walk.count())
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.root).map_err(|e| VaultError::git("open", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_init_and_is_repo() {
        let tmp = TempDir::new().unwrap();
        let git = Git::new(tmp.path());
        assert!(!git.is_repo());
        git.init().unwrap();
        assert!(git.is_repo());
        // Idempotent
        git.init().unwrap();
    }

    #[test]
    fn test_add_commit_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let git = Git::new(tmp.path());
        git.init().unwrap();
        assert_eq!(git.commit_count().unwrap(), 0);

        std::fs::write(tmp.path().join("a.md"), "hello").unwrap();
        git.add(&["a.md".to_string()]).unwrap();
        git.commit("update a").unwrap();
        assert_eq!(git.commit_count().unwrap(), 1);

        std::fs::write(tmp.path().join("a.md"), "changed").unwrap();
        git.add(&["a.md".to_string()]).unwrap();
        git.commit("update a again").unwrap();
        assert_eq!(git.commit_count().unwrap(), 2);
    }

    #[test]
    fn test_remove_tolerates_untracked() {
        let tmp = TempDir::new().unwrap();
        let git = Git::new(tmp.path());
        git.init().unwrap();
        git.remove(&["never-added.md".to_string()]).unwrap();
    }

    #[test]
    fn test_ensure_ignore_appends_once() {
        let tmp = TempDir::new().unwrap();
        let git = Git::new(tmp.path());
        git.init().unwrap();
        git.ensure_ignore(".vaultdb").unwrap();
        git.ensure_ignore(".vaultdb").unwrap();
        let ignore = std::fs::read_to_string(tmp.path().join(".gitignore")).unwrap();
        assert_eq!(ignore.matches(".vaultdb/").count(), 1);
    }

    #[test]
    fn test_sync_without_remote_is_noop() {
        let tmp = TempDir::new().unwrap();
        let git = Git::new(tmp.path());
        git.init().unwrap();
        std::fs::write(tmp.path().join("a.md"), "x").unwrap();
        git.add(&["a.md".to_string()]).unwrap();
        git.commit("seed").unwrap();
        git.sync().unwrap();
    }
}
