//! Best-effort git persistence of the content root at session end.
//!
//! The local commit is the durability boundary; pushing to a remote is
//! advisory. A failed push is logged and carried forward by the next
//! graceful session end, whose commit and push cover any unpushed history.

use std::path::Path;
use std::process::Output;

use chrono::NaiveDate;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("failed to run git {0}: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("git {0} failed: {1}")]
    Git(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The working tree was clean; nothing to commit.
    NoChanges,
    Committed { pushed: bool },
}

async fn git(root: &Path, label: &'static str, args: &[&str]) -> Result<Output, CommitError> {
    Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await
        .map_err(|e| CommitError::Spawn(label, e))
}

fn check(label: &'static str, output: Output) -> Result<Output, CommitError> {
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommitError::Git(label, stderr))
    }
}

/// Commits any pending changes under `root` with a deterministic message,
/// then pushes best-effort when `push` is set.
pub async fn commit_session_notes(
    root: &Path,
    topic: &str,
    date: NaiveDate,
    push: bool,
) -> Result<CommitOutcome, CommitError> {
    let status = check("status", git(root, "status", &["status", "--porcelain"]).await?)?;
    if status.stdout.is_empty() {
        info!(%topic, "content tree clean; skipping commit");
        return Ok(CommitOutcome::NoChanges);
    }

    check("add", git(root, "add", &["add", "-A"]).await?)?;

    let message = format!("notes({topic}): session {date}");
    check(
        "commit",
        git(root, "commit", &["commit", "-m", &message]).await?,
    )?;
    info!(%topic, %message, "committed session notes");

    if !push {
        return Ok(CommitOutcome::Committed { pushed: false });
    }

    // Push failures are swallowed: the commit above already made the notes
    // durable, and the next session end will push the backlog.
    let pushed = match git(root, "push", &["push"]).await {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(%stderr, "git push failed; unpushed commits remain local");
            false
        }
        Err(e) => {
            warn!(error = %e, "git push could not run; unpushed commits remain local");
            false
        }
    };

    Ok(CommitOutcome::Committed { pushed })
}
