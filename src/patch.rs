//! Patch application: ensure a working branch, commit minimal diffs, open the
//! pull request.
//!
//! Invoked by the generation step as a tool, not by the execution envelope
//! directly. Surgical find/replace edits take hard precedence over
//! full-content writes because they minimize diff size and review surface.

use std::hash::{Hash, Hasher};

use tracing::{debug, info};

use crate::errors::PatchError;
use crate::github::RepoHost;
use crate::models::{FileWrite, PullRequestSpec, SurgicalEdit};

/// Apply a bounded find/replace to `original`.
///
/// With no count, every occurrence is replaced. With a count, occurrences are
/// replaced left to right, at most `count` non-overlapping times, and the
/// scan cursor advances past each replacement's inserted text so newly
/// inserted text is never re-matched.
pub fn apply_replacement(
    original: &str,
    find: &str,
    replace: &str,
    count: Option<usize>,
) -> String {
    match count {
        None => original.replace(find, replace),
        Some(n) => {
            let mut out = original.to_string();
            let mut cursor = 0;
            let mut remaining = n;
            while remaining > 0 {
                let Some(rel) = out[cursor..].find(find) else {
                    break;
                };
                let idx = cursor + rel;
                out.replace_range(idx..idx + find.len(), replace);
                cursor = idx + replace.len();
                remaining -= 1;
            }
            out
        }
    }
}

/// Deterministic fallback branch name for a change title.
fn auto_branch_name(title: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    title.hash(&mut hasher);
    format!("auto/pr-{}", hasher.finish() % 10_000_000)
}

/// Ensure a working branch exists off the base branch.
///
/// A pre-existing branch of the resolved name is reused unconditionally, with no
/// content check. Returns the resolved `(branch, base)` names.
pub async fn ensure_branch(
    gh: &dyn RepoHost,
    owner_repo: &str,
    title: &str,
    branch_name: Option<&str>,
    base_branch: Option<&str>,
) -> Result<(String, String), PatchError> {
    let base = match base_branch {
        Some(base) => base.to_string(),
        None => gh
            .default_branch(owner_repo)
            .await
            .map_err(|e| PatchError::api("default_branch", owner_repo, e))?,
    };
    let base_sha = gh
        .branch_sha(owner_repo, &base)
        .await
        .map_err(|e| PatchError::api("branch_sha", format!("{}@{}", owner_repo, base), e))?
        .ok_or_else(|| {
            PatchError::api(
                "branch_sha",
                format!("{}@{}", owner_repo, base),
                anyhow::anyhow!("base branch not found"),
            )
        })?;

    let branch = match branch_name {
        Some(name) => name.to_string(),
        None => auto_branch_name(title),
    };

    let existing = gh
        .branch_sha(owner_repo, &branch)
        .await
        .map_err(|e| PatchError::api("branch_sha", format!("{}@{}", owner_repo, branch), e))?;
    match existing {
        Some(_) => debug!(branch, "working branch already exists; reusing"),
        None => {
            gh.create_branch(owner_repo, &branch, &base_sha)
                .await
                .map_err(|e| {
                    PatchError::api("create_ref", format!("{}@{}", owner_repo, branch), e)
                })?;
            info!(branch, base, "created working branch");
        }
    }

    Ok((branch, base))
}

/// Apply surgical edits to the branch, one commit per changed file.
///
/// Each file is read from the branch when it exists there (picking up edits
/// committed earlier in the same call), else from the base branch. A missing
/// target file is a failure naming the path. An edit that leaves the content
/// unchanged commits nothing.
pub async fn apply_edits(
    gh: &dyn RepoHost,
    owner_repo: &str,
    branch: &str,
    base: &str,
    title: &str,
    edits: &[SurgicalEdit],
) -> Result<(), PatchError> {
    for edit in edits {
        edit.validate()?;

        let existing = gh
            .file_contents(owner_repo, &edit.path, branch)
            .await
            .map_err(|e| PatchError::api("file_contents", edit.path.clone(), e))?;
        let existing = match existing {
            Some(file) => file,
            None => gh
                .file_contents(owner_repo, &edit.path, base)
                .await
                .map_err(|e| PatchError::api("file_contents", edit.path.clone(), e))?
                .ok_or_else(|| PatchError::MissingTarget {
                    path: edit.path.clone(),
                })?,
        };

        let updated = apply_replacement(
            &existing.content,
            &edit.find_text,
            &edit.replace_text,
            edit.count,
        );
        if updated == existing.content {
            debug!(path = %edit.path, "replacement was a no-op; skipping commit");
            continue;
        }

        let message = format!("{} (surgical edit)", title);
        gh.put_file(
            owner_repo,
            &edit.path,
            branch,
            &message,
            &updated,
            Some(&existing.sha),
        )
        .await
        .map_err(|e| PatchError::api("update_file", edit.path.clone(), e))?;
        info!(path = %edit.path, "committed surgical edit");
    }
    Ok(())
}

/// Commit full-content writes to the branch: update when the file exists
/// there, create otherwise.
pub async fn apply_writes(
    gh: &dyn RepoHost,
    owner_repo: &str,
    branch: &str,
    title: &str,
    writes: &[FileWrite],
) -> Result<(), PatchError> {
    for write in writes {
        write.validate()?;

        let existing = gh
            .file_contents(owner_repo, &write.path, branch)
            .await
            .map_err(|e| PatchError::api("file_contents", write.path.clone(), e))?;
        let message = write.message.as_deref().unwrap_or(title);
        gh.put_file(
            owner_repo,
            &write.path,
            branch,
            message,
            &write.content,
            existing.as_ref().map(|f| f.sha.as_str()),
        )
        .await
        .map_err(|e| PatchError::api("put_file", write.path.clone(), e))?;
        info!(path = %write.path, created = existing.is_none(), "committed file write");
    }
    Ok(())
}

/// Open exactly one pull request from the working branch to the base.
pub async fn open_pull_request(
    gh: &dyn RepoHost,
    owner_repo: &str,
    branch: &str,
    base: &str,
    title: &str,
    body: &str,
) -> Result<String, PatchError> {
    gh.create_pull(owner_repo, title, body, branch, base)
        .await
        .map_err(|e| PatchError::api("create_pull", format!("{}@{}", owner_repo, branch), e))
}

/// Full publication protocol for one pull-request spec: validate, ensure the
/// branch, commit the change set (surgical edits preferred), open the PR.
/// Returns the pull request URL.
pub async fn publish_pull_request(
    gh: &dyn RepoHost,
    owner_repo: &str,
    spec: &PullRequestSpec,
) -> Result<String, PatchError> {
    spec.validate()?;

    let (branch, base) = ensure_branch(
        gh,
        owner_repo,
        &spec.title,
        spec.branch_name.as_deref(),
        spec.base_branch.as_deref(),
    )
    .await?;

    if !spec.replacements.is_empty() {
        apply_edits(gh, owner_repo, &branch, &base, &spec.title, &spec.replacements).await?;
    } else if !spec.changes.is_empty() {
        apply_writes(gh, owner_repo, &branch, &spec.title, &spec.changes).await?;
    }

    let url = open_pull_request(gh, owner_repo, &branch, &base, &spec.title, &spec.body).await?;
    info!(%url, "opened pull request");
    Ok(url)
}
