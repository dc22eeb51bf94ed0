use std::path::Path;
use std::process::Command;

/// Build revision reported by `/health`.
///
/// Source tarballs carry no `.git`, so packagers can pin the value through
/// `CADENCE_GIT_SHA` in the build environment.
fn main() {
    println!("cargo:rerun-if-env-changed=CADENCE_GIT_SHA");

    let revision = std::env::var("CADENCE_GIT_SHA")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(describe_worktree)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CADENCE_GIT_SHA={revision}");

    let git_dir = Path::new("../../.git");
    if git_dir.exists() {
        for watched in ["HEAD", "index", "refs"] {
            println!("cargo:rerun-if-changed={}", git_dir.join(watched).display());
        }
    }
}

/// `git describe` names the nearest tag when there is one and marks local edits.
fn describe_worktree() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
