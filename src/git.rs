//! git2 primitives used by the isolation engine.
//!
//! Every method opens the repository fresh, so a `GitOps` is cheap to clone
//! and safe to move into `spawn_blocking` closures.

use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature};
use tracing::{debug, warn};

use crate::{Error, Result};

const FALLBACK_NAME: &str = "stackwise";
const FALLBACK_EMAIL: &str = "stackwise@localhost";

/// A worktree registered with the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "opening repository");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Root of the main working copy.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Full commit id that `spec` (branch, tag, sha, `HEAD`) points at.
    pub fn resolve_commit(&self, spec: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.revparse_single(spec)?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Short name of the checked-out branch, or the abbreviated commit when
    /// HEAD is detached.
    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn head_commit(&self) -> Result<String> {
        self.resolve_commit("HEAD")
    }

    /// Create `name` at the commit `parent_ref` resolves to. With `force`
    /// an existing branch is reset to that commit.
    pub fn create_branch(&self, name: &str, parent_ref: &str, force: bool) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.revparse_single(parent_ref)?.peel_to_commit()?;
        debug!(branch = name, parent = parent_ref, commit = %commit.id(), "creating branch");
        repo.branch(name, &commit, force)?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Commit id at the tip of a local branch.
    pub fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Check out an existing branch into a new worktree at `path`,
    /// registered under `name`.
    pub fn add_worktree(&self, name: &str, branch: &str, path: &Path) -> Result<()> {
        debug!(name, branch, path = %path.display(), "adding worktree");
        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(name, path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree: prune its registration, delete the directory and
    /// the admin dir under `.git/worktrees`. Removing an absent worktree is
    /// a no-op.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "removing worktree");
        let repo = self.repo()?;

        let registered = self.list_worktrees()?;
        let folder = path.file_name().and_then(|n| n.to_str()).map(String::from);
        let name = registered
            .iter()
            .find(|wt| same_path(&wt.path, path))
            .map(|wt| wt.name.clone())
            .or_else(|| {
                folder
                    .clone()
                    .filter(|f| registered.iter().any(|wt| &wt.name == f))
            });

        if let Some(name) = &name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }

        // A leftover admin dir keeps the branch marked as checked out.
        if let Some(name) = name.as_deref() {
            let admin = repo.path().join("worktrees").join(name);
            if admin.exists() {
                std::fs::remove_dir_all(&admin)?;
            }
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        let mut out = Vec::new();
        for name in names.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                out.push(WorktreeEntry {
                    name: name.to_string(),
                    path: wt.path().to_path_buf(),
                });
            }
        }
        Ok(out)
    }

    /// Prune registrations whose directories no longer exist. Returns how
    /// many were pruned.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for entry in self.list_worktrees()? {
            if entry.path.exists() {
                continue;
            }
            if let Ok(wt) = repo.find_worktree(&entry.name) {
                if wt.prune(Some(git2::WorktreePruneOptions::new().working_tree(true)))
                    .is_ok()
                {
                    pruned += 1;
                }
            }
        }
        debug!(pruned, "pruned stale worktrees");
        Ok(pruned)
    }

    /// Stage everything in `worktree` and commit it on its HEAD.
    ///
    /// Returns [`Error::NothingToCommit`] when the staged tree equals the
    /// parent's tree.
    pub fn commit_all(&self, worktree: &Path, message: &str) -> Result<String> {
        let repo = Repository::open(worktree)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let unchanged = match &parent {
            Some(p) => p.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            return Err(Error::NothingToCommit {
                path: worktree.to_path_buf(),
            });
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %id, path = %worktree.display(), "committed");
        Ok(id.to_string())
    }

    /// Apply `commit` on top of the worktree's HEAD as a new commit.
    ///
    /// The merge runs in memory; on conflict nothing is written and
    /// [`Error::CherryPickConflict`] lists the conflicted paths.
    pub fn cherry_pick(&self, worktree: &Path, commit: &str) -> Result<String> {
        let repo = Repository::open(worktree)?;
        let theirs = repo.find_commit(Oid::from_str(commit)?)?;
        let ours = repo.head()?.peel_to_commit()?;

        let mut index = repo.cherrypick_commit(&theirs, &ours, 0, None)?;
        if index.has_conflicts() {
            let mut files: Vec<String> = index
                .conflicts()?
                .flatten()
                .filter_map(|c| c.our.or(c.their).or(c.ancestor))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            files.sort();
            files.dedup();
            return Err(Error::CherryPickConflict {
                commit: commit.to_string(),
                files,
            });
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let committer = signature(&repo)?;
        let message = theirs.message().unwrap_or("cherry-picked change");
        let id = repo.commit(
            Some("HEAD"),
            &theirs.author(),
            &committer,
            message,
            &tree,
            &[&ours],
        )?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        debug!(source = commit, commit = %id, "cherry-picked");
        Ok(id.to_string())
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
