use crate::{
    config::{GitRemoteConfig, ToolLocator},
    process::CallError,
};
use chrono::{DateTime, TimeZone, Utc};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::info;

/// author identity used for results commits
pub const BOT_AUTHOR_NAME: &str = "benchwatch bot";
pub const BOT_AUTHOR_EMAIL: &str = "benchwatch-bot@gmail.com";

// field separator for --pretty output, unit separator never shows up in
// commit subjects
const SEP: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("git invocation failed")]
    Call(#[from] CallError),
    #[error("failed to parse git output: '{0}'")]
    Parse(String),
}

/// An immutable reference to one observed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub hash: String,
    pub subject: String,
    pub date: DateTime<Utc>,
}

/// Thin adapter over the git executable for a single local checkout.
///
/// All calls are synchronous and bounded by the configured sync timeout;
/// nothing here understands the repository beyond what the porcelain prints.
#[derive(Debug, Clone)]
pub struct GitRepo {
    tools: ToolLocator,
    dir: PathBuf,
    remote: GitRemoteConfig,
    timeout: Duration,
}

impl GitRepo {
    /// open the checkout at `dir`, cloning the remote first if it is empty
    pub fn clone_or_open(
        tools: &ToolLocator,
        dir: &Path,
        remote: &GitRemoteConfig,
        timeout: Duration,
    ) -> Result<Self, VcsError> {
        let repo = Self {
            tools: tools.clone(),
            dir: dir.to_owned(),
            remote: remote.clone(),
            timeout,
        };

        if !dir.join(".git").exists() {
            info!(
                "cloning '{}' branch '{}' to {:?}...",
                remote.url, remote.branch, dir
            );
            repo.git(&[
                "clone".to_owned(),
                "--branch".to_owned(),
                remote.branch.clone(),
                repo.authed_url(),
                ".".to_owned(),
            ])?;
        }

        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch(&self) -> &str {
        &self.remote.branch
    }

    fn git(&self, args: &[String]) -> Result<String, VcsError> {
        Ok(self.tools.run(&self.tools.git, args, &self.dir, self.timeout)?)
    }

    // remote url with the configured credentials embedded
    fn authed_url(&self) -> String {
        if self.remote.username.is_empty() {
            return self.remote.url.clone();
        }

        match self.remote.url.split_once("://") {
            Some((scheme, rest)) => format!(
                "{scheme}://{}:{}@{rest}",
                self.remote.username, self.remote.password
            ),
            None => self.remote.url.clone(),
        }
    }

    /// fetch `refspec` from the remote, returning the fetched head
    pub fn fetch(&self, refspec: &str) -> Result<String, VcsError> {
        self.git(&[
            "fetch".to_owned(),
            self.authed_url(),
            refspec.to_owned(),
        ])?;
        let head = self.git(&["rev-parse".to_owned(), "FETCH_HEAD".to_owned()])?;

        Ok(head.trim().to_owned())
    }

    /// commits reachable from `to` but not `from`, oldest first
    pub fn log_range(&self, from: &str, to: &str) -> Result<Vec<CommitRef>, VcsError> {
        let output = self.git(&[
            "log".to_owned(),
            "--reverse".to_owned(),
            format!("--pretty=format:%H{SEP}%s{SEP}%ct"),
            format!("{from}..{to}"),
        ])?;

        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_log_line)
            .collect()
    }

    /// resolve a single commit into a [`CommitRef`]
    pub fn commit_at(&self, hash: &str) -> Result<CommitRef, VcsError> {
        let output = self.git(&[
            "show".to_owned(),
            "-s".to_owned(),
            format!("--pretty=format:%H{SEP}%s{SEP}%ct"),
            hash.to_owned(),
        ])?;

        parse_log_line(output.trim())
    }

    /// discard local modifications, then move the working tree to `hash`
    pub fn checkout_clean(&self, hash: &str) -> Result<(), VcsError> {
        self.git(&["clean".to_owned(), "-fdx".to_owned()])?;
        self.git(&[
            "checkout".to_owned(),
            "--force".to_owned(),
            "--detach".to_owned(),
            hash.to_owned(),
        ])?;

        Ok(())
    }

    /// fetch the tracked branch and check out its head
    pub fn fetch_and_checkout_latest(&self) -> Result<String, VcsError> {
        let head = self.fetch(&self.remote.branch)?;
        self.checkout_clean(&head)?;

        Ok(head)
    }

    pub fn add(&self, path: &Path) -> Result<(), VcsError> {
        self.git(&["add".to_owned(), path.to_string_lossy().into_owned()])?;

        Ok(())
    }

    /// commit staged changes under the bot identity, returning the new head
    pub fn commit(&self, message: &str) -> Result<String, VcsError> {
        self.git(&[
            "-c".to_owned(),
            format!("user.name={BOT_AUTHOR_NAME}"),
            "-c".to_owned(),
            format!("user.email={BOT_AUTHOR_EMAIL}"),
            "commit".to_owned(),
            "-m".to_owned(),
            message.to_owned(),
            "--author".to_owned(),
            format!("{BOT_AUTHOR_NAME} <{BOT_AUTHOR_EMAIL}>"),
        ])?;
        let head = self.git(&["rev-parse".to_owned(), "HEAD".to_owned()])?;

        Ok(head.trim().to_owned())
    }

    pub fn push(&self, hash: &str, branch: &str) -> Result<(), VcsError> {
        self.git(&[
            "push".to_owned(),
            self.authed_url(),
            format!("{hash}:refs/heads/{branch}"),
        ])?;

        Ok(())
    }
}

fn parse_log_line(line: &str) -> Result<CommitRef, VcsError> {
    let mut fields = line.splitn(3, SEP);

    let (hash, subject, epoch) = match (fields.next(), fields.next(), fields.next()) {
        (Some(hash), Some(subject), Some(epoch)) => (hash, subject, epoch),
        _ => return Err(VcsError::Parse(line.to_owned())),
    };

    let secs: i64 = epoch
        .trim()
        .parse()
        .map_err(|_| VcsError::Parse(line.to_owned()))?;
    let date = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| VcsError::Parse(line.to_owned()))?;

    Ok(CommitRef {
        hash: hash.to_owned(),
        subject: subject.to_owned(),
        date,
    })
}
