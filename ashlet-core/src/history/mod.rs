//! History file discovery, recency view, and background semantic index
//! (§4.3).

mod graph;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::warn;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::redactor;
use graph::AnnGraph;

const DEFAULT_MAX_HISTORY_COMMANDS: usize = 3000;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const EMBED_BATCH_SIZE: usize = 32;
const TAIL_SEEK_BYTES_PER_LINE: u64 = 100;

pub struct HistoryIndexer {
    embedder: Option<Arc<Embedder>>,
    graph: RwLock<AnnGraph>,
    commands: RwLock<HashMap<String, String>>,
    max_history_commands: usize,
    refresh_interval: Duration,
    init_tx: watch::Sender<bool>,
    init_rx: watch::Receiver<bool>,
}

impl HistoryIndexer {
    pub fn new(embedder: Option<Arc<Embedder>>) -> Self {
        Self::with_config(embedder, DEFAULT_MAX_HISTORY_COMMANDS, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_config(embedder: Option<Arc<Embedder>>, max_history_commands: usize, refresh_interval: Duration) -> Self {
        let (init_tx, init_rx) = watch::channel(false);
        HistoryIndexer {
            embedder,
            graph: RwLock::new(AnnGraph::new()),
            commands: RwLock::new(HashMap::new()),
            max_history_commands,
            refresh_interval,
            init_tx,
            init_rx,
        }
    }

    pub fn init_done_signal(&self) -> watch::Receiver<bool> {
        self.init_rx.clone()
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Spawn the background refresher. A no-op (returns `None`) when no
    /// embedder is configured.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.embedder.is_none() {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                if let Err(err) = this.index_history().await {
                    warn!(error = %err, "history index refresh failed");
                }
                this.init_tx.send_replace(true);
                tokio::time::sleep(this.refresh_interval).await;
            }
        }))
    }

    pub async fn recent_commands(&self, n: usize) -> Vec<String> {
        let Some(path) = locate_history_file().await else {
            return Vec::new();
        };
        match read_recent(&path, n).await {
            Ok(commands) => commands,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read history file");
                Vec::new()
            }
        }
    }

    /// Reads up to `max_history_commands` parsed commands, embeds the ones
    /// not yet indexed, and inserts all of them under a single write lock.
    /// Embedding failures are logged and skipped; a missing history file is
    /// not an error.
    pub async fn index_history(&self) -> Result<()> {
        let Some(embedder) = &self.embedder else {
            return Ok(());
        };
        let Some(path) = locate_history_file().await else {
            debug!("no history file found, nothing to index");
            return Ok(());
        };

        let all = read_all_parsed(&path).await?;
        let unique = cap_and_dedup(all, self.max_history_commands);

        let mut pending: Vec<(String, String)> = Vec::new();
        {
            let graph = self.graph.read().await;
            for original in unique {
                let hash = hash_command(&original);
                if !graph.contains_hash(&hash) {
                    pending.push((hash, redactor::redact(&original)));
                }
            }
        }

        let mut embedded: Vec<(String, String, Vec<f32>)> = Vec::new();
        for chunk in pending.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = chunk.iter().map(|(_, redacted)| redacted.clone()).collect();
            match embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    for ((hash, redacted), vector) in chunk.iter().zip(vectors) {
                        embedded.push((hash.clone(), redacted.clone(), vector));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "history embedding batch failed, keeping partial progress");
                }
            }
        }

        let mut graph = self.graph.write().await;
        let mut commands = self.commands.write().await;
        for (hash, redacted, vector) in embedded {
            graph.insert(hash.clone(), vector);
            commands.insert(hash, redacted);
        }

        Ok(())
    }

    /// Empty when no embedder, empty graph, or `top_k <= 0`.
    pub async fn search_relevant(&self, query: &str, top_k: usize) -> Vec<String> {
        if top_k == 0 {
            return Vec::new();
        }
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        if self.graph.read().await.is_empty() {
            return Vec::new();
        }

        let redacted_query = redactor::redact(query);
        let vector = match embedder.embed(&redacted_query).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "query embedding failed");
                return Vec::new();
            }
        };

        let graph = self.graph.read().await;
        let commands = self.commands.read().await;
        graph
            .search(&vector, top_k)
            .into_iter()
            .filter_map(|(idx, _)| graph.hash_at(idx))
            .filter_map(|hash| commands.get(hash).cloned())
            .collect()
    }

    pub async fn save_cache(&self, path: &Path, model: &str) -> Result<()> {
        let graph = self.graph.read().await;
        let commands = self.commands.read().await;
        let mut entries = Vec::with_capacity(graph.len());
        for idx in 0..graph.len() {
            let Some(hash) = graph.hash_at(idx) else {
                continue;
            };
            let Some(command) = commands.get(hash) else {
                continue;
            };
            entries.push(CacheEntry {
                hash: hash.to_string(),
                command: command.clone(),
                vector: graph.vector_at(idx).to_vec(),
            });
        }
        let file = CacheFile {
            model: model.to_string(),
            entries,
        };
        let json = serde_json::to_vec(&file)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Silently discards the cache when its `model` doesn't match `model`.
    /// A successful, matching load also signals init-done.
    pub async fn load_cache(&self, path: &Path, model: &str) -> Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let file: CacheFile = serde_json::from_slice(&bytes)?;
        if file.model != model {
            warn!(cached_model = %file.model, current_model = %model, "discarding history cache built with a different model");
            return Ok(());
        }

        let mut graph = self.graph.write().await;
        let mut commands = self.commands.write().await;
        for entry in file.entries {
            graph.insert(entry.hash.clone(), entry.vector);
            commands.insert(entry.hash, entry.command);
        }
        drop(graph);
        drop(commands);
        self.init_tx.send_replace(true);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    hash: String,
    command: String,
    vector: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    model: String,
    entries: Vec<CacheEntry>,
}

fn hash_command(command: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(command.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `$HISTFILE` (if set), then `~/.zsh_history`, then `~/.bash_history`; the
/// candidate with the most recent modification time wins. Missing files are
/// skipped.
async fn locate_history_file() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(histfile) = std::env::var("HISTFILE") {
        if !histfile.is_empty() {
            candidates.push(PathBuf::from(histfile));
        }
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".zsh_history"));
        candidates.push(home.join(".bash_history"));
    }

    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;
    for candidate in candidates {
        let Ok(metadata) = tokio::fs::metadata(&candidate).await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, best_time)| modified > *best_time) {
            best = Some((candidate, modified));
        }
    }
    best.map(|(path, _)| path)
}

/// Lines beginning with `": "` are zsh extended-history entries
/// (`": <timestamp>:<duration>;<command>"`); only the command portion is
/// kept. Other non-empty lines are taken verbatim.
fn parse_history_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix(": ") {
        if let Some(semicolon) = rest.find(';') {
            return Some(rest[semicolon + 1..].to_string());
        }
    }
    Some(trimmed.to_string())
}

async fn read_all_parsed(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content.lines().filter_map(parse_history_line).collect())
}

/// Returns the last `n` parsed commands, oldest first. Seeks to
/// approximately `n * 100` bytes from the end before reading; falls back to
/// a full read if that isn't enough to produce `n` commands and the file is
/// larger than the seek budget.
async fn read_recent(path: &Path, n: usize) -> Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let metadata = tokio::fs::metadata(path).await?;
    let file_len = metadata.len();
    let budget = n as u64 * TAIL_SEEK_BYTES_PER_LINE;

    let parsed = if file_len > budget {
        let tail = read_tail(path, budget).await?;
        let mut commands: Vec<String> = tail.lines().filter_map(parse_history_line).collect();
        if commands.len() < n {
            commands = read_all_parsed(path).await?;
        }
        commands
    } else {
        read_all_parsed(path).await?
    };

    let start = parsed.len().saturating_sub(n);
    Ok(parsed[start..].to_vec())
}

async fn read_tail(path: &Path, budget: u64) -> Result<String> {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(budget);
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Keeps the last `limit` parsed commands, deduplicated by original text
/// (first occurrence within that window wins the ordering position).
fn cap_and_dedup(commands: Vec<String>, limit: usize) -> Vec<String> {
    let start = commands.len().saturating_sub(limit);
    let window = &commands[start..];
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for command in window {
        if seen.insert(command.clone()) {
            unique.push(command.clone());
        }
    }
    unique
}
