//! TTL cache of per-directory context: file listing, git state, and
//! manifest summaries (§4.4).

mod manifest;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::util::truncate_with_ellipsis;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
const GATHER_DEADLINE: Duration = Duration::from_secs(5);
const FIELD_CAP: usize = 512;

const LOCKFILE_PRIORITY: &[(&str, &str)] = &[
    ("pnpm-lock.yaml", "pnpm"),
    ("yarn.lock", "yarn"),
    ("bun.lockb", "bun"),
    ("package-lock.json", "npm"),
    ("Cargo.lock", "cargo"),
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirContext {
    pub cwd_path: String,
    pub cwd_listing: String,
    pub cwd_manifests: HashMap<String, String>,
    pub package_manager: String,
    pub git_root_listing: String,
    pub git_staged_files: String,
    pub git_manifests: HashMap<String, String>,
}

struct CachedEntry {
    context: DirContext,
    inserted_at: Instant,
}

pub struct DirContextCache {
    entries: RwLock<HashMap<String, CachedEntry>>,
    ttl: Duration,
}

impl Default for DirContextCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DirContextCache {
    pub fn new(ttl: Duration) -> Self {
        DirContextCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Miss or expiry both return `None`. Does not refresh the entry on hit.
    pub async fn get(&self, cwd: &str) -> Option<DirContext> {
        let entries = self.entries.read().await;
        let entry = entries.get(cwd)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.context.clone())
    }

    /// Builds a fresh entry and installs it unconditionally, even if one
    /// already existed. Concurrent `Gather`s for the same path may both run;
    /// last writer wins.
    pub async fn gather(&self, cwd: &str) -> DirContext {
        let context = build_context(cwd).await;
        self.entries.write().await.insert(
            cwd.to_string(),
            CachedEntry {
                context: context.clone(),
                inserted_at: Instant::now(),
            },
        );
        context
    }
}

async fn build_context(cwd: &str) -> DirContext {
    let cwd_path = PathBuf::from(cwd);

    let (listing, git_root, staged) = tokio::time::timeout(GATHER_DEADLINE, async {
        tokio::join!(list_files(&cwd_path), git_toplevel(&cwd_path), git_staged_files(&cwd_path))
    })
    .await
    .unwrap_or_default();

    let cwd_listing = truncate_with_ellipsis(&listing.unwrap_or_default(), FIELD_CAP);
    let git_staged_files = truncate_with_ellipsis(&staged.unwrap_or_default(), FIELD_CAP);
    let cwd_manifests = extract_manifests(&cwd_path).await;

    let mut git_root_listing = String::new();
    let mut git_manifests = HashMap::new();
    if let Some(root) = &git_root {
        if root != &cwd_path {
            git_root_listing = truncate_with_ellipsis(&list_files(root).await.unwrap_or_default(), FIELD_CAP);
            git_manifests = extract_manifests(root).await;
        }
    }

    let package_manager = detect_package_manager(&cwd_path, git_root.as_deref()).await;

    DirContext {
        cwd_path: cwd.to_string(),
        cwd_listing,
        cwd_manifests,
        package_manager,
        git_root_listing,
        git_staged_files,
        git_manifests,
    }
}

async fn list_files(dir: &Path) -> Option<String> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Some(names.join(" "))
}

async fn git_toplevel(dir: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

async fn git_staged_files(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["diff", "--name-status", "--cached"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let tags: Vec<String> = text.lines().filter_map(parse_staged_line).collect();
    Some(tags.join(" "))
}

/// `git diff --name-status` lines are tab-separated: `M\tpath`,
/// `A\tpath`, `D\tpath`, or `R100\told\tnew` / `C100\told\tnew` for
/// renames/copies, which shorten to a single-letter status.
fn parse_staged_line(line: &str) -> Option<String> {
    let mut parts = line.split('\t');
    let status = parts.next()?;
    let first = status.chars().next()?;
    match first {
        'R' | 'C' => {
            let old = parts.next()?;
            let new = parts.next()?;
            Some(format!("{first}:{old}\u{2192}{new}"))
        }
        _ => {
            let path = parts.next()?;
            Some(format!("{first}:{path}"))
        }
    }
}

async fn extract_manifests(dir: &Path) -> HashMap<String, String> {
    let mut found = HashMap::new();
    for name in manifest::known_manifest_names() {
        let path = dir.join(name);
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };
        let content = String::from_utf8_lossy(&bytes);
        if let Some((label, summary)) = manifest::summarize(name, &content) {
            found.insert(label, summary);
        }
    }
    found
}

async fn detect_package_manager(cwd: &Path, git_root: Option<&Path>) -> String {
    for (file, manager) in LOCKFILE_PRIORITY {
        if tokio::fs::try_exists(cwd.join(file)).await.unwrap_or(false) {
            return manager.to_string();
        }
        if let Some(root) = git_root {
            if tokio::fs::try_exists(root.join(file)).await.unwrap_or(false) {
                return manager.to_string();
            }
        }
    }
    String::new()
}
