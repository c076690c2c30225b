//! GitSubstrate - a git remote as the coordination log.
//!
//! - `sync`: fetch the branch into a remote-tracking ref and read the task
//!   files straight from the object database.
//! - `publish`: build a commit on top of `base` with plumbing commands (a
//!   private index file, never the working tree) and push it without force.
//!
//! A non-forced push only lands if the remote head is an ancestor of the new
//! commit. The log is append-only, so that means "the head is still `base`":
//! the push is the compare-and-swap. A rejected push leaves only an unreachable
//! commit behind, which `git gc` collects.
//!
//! A branch missing on the remote syncs as an empty snapshot at revision `""`;
//! publishing on that base creates the branch with a root commit.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backlog::Layout;
use crate::domain::BranchName;
use crate::error::SubstrateError;
use crate::ports::{ChangeSet, PublishOutcome, Revision, Snapshot, Substrate};

const MISSING_REF_MARKERS: &[&str] = &["couldn't find remote ref", "could not find remote ref"];
const REJECTED_MARKERS: &[&str] = &["[rejected]", "non-fast-forward", "fetch first", "stale info"];

pub struct GitSubstrate {
    workdir: PathBuf,
    remote: String,
    layout: Layout,
    author_name: String,
    author_email: String,
    /// One git operation at a time per process (shared index file).
    lock: Mutex<()>,
}

impl GitSubstrate {
    pub fn new(workdir: impl Into<PathBuf>, remote: impl Into<String>, layout: Layout) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.into(),
            layout,
            author_name: "claimlog".to_string(),
            author_email: "claimlog@localhost".to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    fn tracking_ref(&self, branch: &BranchName) -> String {
        format!("refs/remotes/{}/{branch}", self.remote)
    }

    async fn raw(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Output, SubstrateError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            // close stdin so git sees EOF
            drop(pipe);
        }
        Ok(child.wait_with_output().await?)
    }

    /// Run git and return stdout, or a `Command` error with its stderr.
    async fn git(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, SubstrateError> {
        let output = self.raw(args, envs, stdin).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(command_error(args, &output))
        }
    }

    async fn git_line(&self, args: &[&str], envs: &[(&str, &str)]) -> Result<String, SubstrateError> {
        let stdout = self.git(args, envs, None).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Fetch `branch`. `None` when the remote does not have it.
    async fn fetch(&self, branch: &BranchName) -> Result<Option<Revision>, SubstrateError> {
        let tracking = self.tracking_ref(branch);
        let refspec = format!("+refs/heads/{branch}:{tracking}");
        let output = self
            .raw(&["fetch", "--quiet", "--no-tags", &self.remote, &refspec], &[], None)
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if MISSING_REF_MARKERS.iter().any(|m| stderr.contains(m)) {
                return Ok(None);
            }
            return Err(SubstrateError::Unreachable(stderr.trim().to_string()));
        }

        let rev = self
            .git_line(&["rev-parse", "--verify", &format!("{tracking}^{{commit}}")], &[])
            .await?;
        Ok(Some(Revision::new(rev)))
    }

    async fn read_files(
        &self,
        revision: &Revision,
    ) -> Result<std::collections::BTreeMap<String, Vec<u8>>, SubstrateError> {
        let mut args = vec!["ls-tree", "-r", "-z", "--name-only", revision.as_str()];
        if !self.layout.root().is_empty() {
            args.push("--");
            args.push(self.layout.root());
        }
        let listing = self.git(&args, &[], None).await?;

        let mut files = std::collections::BTreeMap::new();
        for raw_path in listing.split(|b| *b == 0).filter(|p| !p.is_empty()) {
            let path = String::from_utf8_lossy(raw_path).into_owned();
            let object = format!("{revision}:{path}");
            let bytes = self.git(&["cat-file", "blob", &object], &[], None).await?;
            files.insert(path, bytes);
        }
        Ok(files)
    }

    async fn commit(&self, base: &Revision, changes: &ChangeSet) -> Result<String, SubstrateError> {
        let git_dir = self.git_line(&["rev-parse", "--absolute-git-dir"], &[]).await?;
        let index = Path::new(&git_dir).join(format!("claimlog-{}.index", std::process::id()));
        let index = index.to_string_lossy().into_owned();
        let index_env = [("GIT_INDEX_FILE", index.as_str())];

        let result = self.commit_with_index(base, changes, &index_env).await;
        // best effort: the file is rewritten by the next publish anyway
        let _ = tokio::fs::remove_file(&index).await;
        result
    }

    async fn commit_with_index(
        &self,
        base: &Revision,
        changes: &ChangeSet,
        index_env: &[(&str, &str)],
    ) -> Result<String, SubstrateError> {
        if base.as_str().is_empty() {
            self.git(&["read-tree", "--empty"], index_env, None).await?;
        } else {
            self.git(&["read-tree", base.as_str()], index_env, None).await?;
        }

        for (path, bytes) in &changes.writes {
            let blob = self
                .git(&["hash-object", "-w", "--stdin"], &[], Some(bytes))
                .await?;
            let blob = String::from_utf8_lossy(&blob).trim().to_string();
            let cacheinfo = format!("100644,{blob},{path}");
            self.git(&["update-index", "--add", "--cacheinfo", &cacheinfo], index_env, None)
                .await?;
        }

        let tree = self.git_line(&["write-tree"], index_env).await?;
        let identity = [
            ("GIT_AUTHOR_NAME", self.author_name.as_str()),
            ("GIT_AUTHOR_EMAIL", self.author_email.as_str()),
            ("GIT_COMMITTER_NAME", self.author_name.as_str()),
            ("GIT_COMMITTER_EMAIL", self.author_email.as_str()),
        ];
        let mut args = vec!["commit-tree", tree.as_str(), "-m", changes.message.as_str()];
        if !base.as_str().is_empty() {
            args.push("-p");
            args.push(base.as_str());
        }
        self.git_line(&args, &identity).await
    }
}

fn command_error(args: &[&str], output: &Output) -> SubstrateError {
    SubstrateError::Command {
        command: format!("git {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

#[async_trait]
impl Substrate for GitSubstrate {
    async fn sync(&self, branch: &BranchName) -> Result<Snapshot, SubstrateError> {
        let _guard = self.lock.lock().await;

        let Some(revision) = self.fetch(branch).await? else {
            debug!(branch = %branch, "branch missing on remote, empty snapshot");
            return Ok(Snapshot {
                revision: Revision::new(""),
                files: Default::default(),
            });
        };
        let files = self.read_files(&revision).await?;
        Ok(Snapshot { revision, files })
    }

    async fn publish(
        &self,
        branch: &BranchName,
        base: &Revision,
        changes: ChangeSet,
    ) -> Result<PublishOutcome, SubstrateError> {
        let _guard = self.lock.lock().await;

        let commit = self.commit(base, &changes).await?;
        let refspec = format!("{commit}:refs/heads/{branch}");
        let args = ["push", "--porcelain", self.remote.as_str(), refspec.as_str()];
        let output = self.raw(&args, &[], None).await?;

        if output.status.success() {
            debug!(branch = %branch, revision = %commit, message = %changes.message, "published");
            return Ok(PublishOutcome::Published(Revision::new(commit)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let rejected = stdout.lines().any(|line| line.starts_with('!'))
            || REJECTED_MARKERS
                .iter()
                .any(|m| stdout.contains(m) || stderr.contains(m));
        if rejected {
            debug!(branch = %branch, base = %base, "push rejected, head moved");
            return Ok(PublishOutcome::Rejected);
        }

        warn!(branch = %branch, stderr = %stderr.trim(), "push failed");
        Err(command_error(&args, &output))
    }
}
