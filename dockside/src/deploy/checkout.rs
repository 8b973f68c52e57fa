//! Source checkout through the git command line

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::OrchestratorError;

/// Run git, forwarding its output line by line to `progress`
async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
    progress: &mpsc::UnboundedSender<String>,
) -> Result<(), OrchestratorError> {
    debug!("Running git {}", args.join(" "));
    let mut cmd = Command::new("git");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| OrchestratorError::CheckoutError(format!("Failed to run git: {}", e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (mut out, mut err) = match (stdout, stderr) {
        (Some(out), Some(err)) => (BufReader::new(out).lines(), BufReader::new(err).lines()),
        _ => {
            return Err(OrchestratorError::CheckoutError(
                "git output unavailable".to_string(),
            ))
        }
    };

    let mut out_done = false;
    let mut err_done = false;
    let mut last_line = String::new();
    while !(out_done && err_done) {
        let (line, from_stderr) = tokio::select! {
            line = out.next_line(), if !out_done => (line?, false),
            line = err.next_line(), if !err_done => (line?, true),
        };
        match line {
            Some(line) => {
                last_line = line.clone();
                let _ = progress.send(line);
            }
            None if from_stderr => err_done = true,
            None => out_done = true,
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(OrchestratorError::CheckoutError(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            last_line
        )));
    }
    Ok(())
}

/// Sync a git repository into `target_dir` (clone, or fetch and reset to the
/// remote branch when a checkout is already there). Returns the checkout
/// directory.
pub async fn sync_repository(
    repo_url: &str,
    branch: &str,
    target_dir: &Path,
    progress: &mpsc::UnboundedSender<String>,
) -> Result<PathBuf, OrchestratorError> {
    info!(
        "Syncing Git repository: {} (branch: {}) to {}",
        repo_url,
        branch,
        target_dir.display()
    );

    if target_dir.join(".git").exists() {
        debug!("Target directory exists, fetching updates...");
        run_git(&["fetch", "--progress", "origin", branch], Some(target_dir), progress).await?;
        run_git(&["reset", "--hard", "FETCH_HEAD"], Some(target_dir), progress).await?;
    } else {
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = target_dir.display().to_string();
        debug!("Cloning repository to {}...", target);
        run_git(
            &["clone", "--progress", "--depth", "1", "-b", branch, repo_url, &target],
            None,
            progress,
        )
        .await?;
    }

    info!("Successfully synced Git repository");
    Ok(target_dir.to_path_buf())
}
