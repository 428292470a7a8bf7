//! The engine façade (§4.8): bundles the collaborators behind one `Arc` so a
//! config `Reload` can swap them out from under in-flight completions
//! without either side taking a lock for the duration of a request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::dircontext::DirContextCache;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::generator::Attribution;
use crate::generator::GeneratorClient;
use crate::generator::GeneratorConfig;
use crate::history::HistoryIndexer;
use crate::protocol::Request;
use crate::protocol::Response;

/// One consistent snapshot of collaborators built from a single [`Config`].
/// In-flight completions clone the surrounding `Arc<EngineInner>` at call
/// time and keep running against it even after a `Reload` installs a new
/// one.
pub struct EngineInner {
    pub config: Config,
    pub generator: Arc<GeneratorClient>,
    pub dircontext: Arc<DirContextCache>,
    pub history: Arc<HistoryIndexer>,
    /// Contents of `config.prompt.template_path`, read once at build time.
    /// `None` when no override is configured or the file failed to load, in
    /// which case the orchestrator falls back to the embedded default.
    pub system_prompt_override: Option<String>,
}

impl EngineInner {
    pub async fn build(config: Config) -> Result<Self> {
        let attribution = config.telemetry.enabled.then(|| Attribution {
            title: config.telemetry.title.clone(),
            referer: config.telemetry.referer.clone(),
        });
        let generator = GeneratorClient::new(GeneratorConfig {
            base_url: config.generation.base_url.clone(),
            api_key: config.generation.api_key.clone(),
            model: config.generation.model.clone(),
            wire_api: config.generation.wire_api,
            max_output_tokens: config.generation.max_output_tokens,
            temperature: config.generation.temperature,
            stop: config.generation.stop.clone(),
            attribution,
        })?;

        let embedder = if config.embedding.is_enabled() {
            Some(Arc::new(Embedder::new(
                config.embedding.base_url.clone(),
                config.embedding.api_key.clone(),
                config.embedding.model.clone(),
            )?))
        } else {
            None
        };

        let history = Arc::new(HistoryIndexer::with_config(
            embedder,
            config.history.max_history_commands,
            Duration::from_secs(config.history.refresh_interval_secs),
        ));
        history.spawn_refresh_loop();

        let dircontext = Arc::new(DirContextCache::new(Duration::from_secs(config.dircontext.ttl_secs)));

        let system_prompt_override = match &config.prompt.template_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => Some(contents),
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to load prompt template override, using default");
                    None
                }
            },
            None => None,
        };

        Ok(EngineInner {
            config,
            generator: Arc::new(generator),
            dircontext,
            history,
            system_prompt_override,
        })
    }
}

/// The daemon's single long-lived handle. Holds an `Arc<EngineInner>` behind
/// an `RwLock` so readers clone the `Arc` quickly and `Reload` only holds the
/// write lock for the swap itself, not for the rebuild.
pub struct Engine {
    inner: RwLock<Arc<EngineInner>>,
    ashlet_home: Option<PathBuf>,
}

impl Engine {
    pub fn new(inner: EngineInner, ashlet_home: Option<PathBuf>) -> Self {
        Engine {
            inner: RwLock::new(Arc::new(inner)),
            ashlet_home,
        }
    }

    pub async fn from_config(ashlet_home: Option<PathBuf>) -> Result<Self> {
        let config = Config::load(ashlet_home.as_deref()).await?;
        let inner = EngineInner::build(config).await?;
        Ok(Engine::new(inner, ashlet_home))
    }

    async fn snapshot(&self) -> Arc<EngineInner> {
        Arc::clone(&*self.inner.read().await)
    }

    /// Runs one completion against whichever `EngineInner` is current at
    /// call time; a concurrent `Reload` does not affect this request.
    pub async fn complete(&self, request: &Request, cancel: &CancellationToken) -> Option<Response> {
        let snapshot = self.snapshot().await;
        crate::orchestrator::complete(&snapshot, request, cancel).await
    }

    /// Gathers (or refreshes) directory context for `cwd` without answering
    /// a completion. Used by the context IPC action to warm the cache ahead
    /// of the first keystroke.
    pub async fn warm_context(&self, cwd: &str) {
        let snapshot = self.snapshot().await;
        snapshot.dircontext.gather(cwd).await;
    }

    pub async fn config_snapshot(&self) -> Config {
        self.snapshot().await.config.clone()
    }

    pub async fn validate(&self) -> Vec<String> {
        self.snapshot().await.config.validate()
    }

    /// Rebuilds collaborators from the config file on disk and swaps them
    /// in. In-flight completions already hold their own `Arc<EngineInner>`
    /// and run to completion against the old collaborators.
    pub async fn reload(&self) -> Result<()> {
        let config = Config::load(self.ashlet_home.as_deref()).await?;
        let rebuilt = EngineInner::build(config).await?;
        let mut guard = self.inner.write().await;
        *guard = Arc::new(rebuilt);
        Ok(())
    }
}

/// Logged best-effort shutdown hook: nothing currently needs explicit
/// teardown beyond letting background tasks die with the process, but this
/// is the seam a future persistent resource (e.g. a flushed history cache)
/// would hang off.
pub async fn close(engine: &Engine) {
    let snapshot = engine.snapshot().await;
    if let Err(err) = snapshot
        .history
        .save_cache(&default_history_cache_path(), &snapshot.config.embedding.model)
        .await
    {
        warn!(error = %err, "failed to persist history cache on shutdown");
    }
}

fn default_history_cache_path() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".ashlet").join("history_cache.json")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[tokio::test]
    async fn build_from_defaults_succeeds_without_network() {
        let inner = EngineInner::build(Config::defaults()).await.expect("build");
        assert!(!inner.history.has_embedder());
    }

    #[tokio::test]
    async fn complete_with_empty_input_short_circuits_without_api_key() {
        let engine = Engine::new(EngineInner::build(Config::defaults()).await.expect("build"), None);
        let request = Request {
            request_id: 1,
            input: String::new(),
            cursor_pos: 0,
            cwd: "/tmp".into(),
            session_id: String::new(),
            max_candidates: None,
        };
        let response = engine.complete(&request, &CancellationToken::new()).await.expect("reply");
        assert!(response.candidates.is_empty());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn complete_without_api_key_reports_not_configured() {
        let engine = Engine::new(EngineInner::build(Config::defaults()).await.expect("build"), None);
        let request = Request {
            request_id: 1,
            input: "git sta".into(),
            cursor_pos: 7,
            cwd: "/tmp".into(),
            session_id: String::new(),
            max_candidates: None,
        };
        let response = engine.complete(&request, &CancellationToken::new()).await.expect("reply");
        assert_eq!(response.error.expect("error").code, "not_configured");
    }

    #[tokio::test]
    async fn reload_swaps_config_without_affecting_a_held_snapshot() {
        let engine = Engine::new(EngineInner::build(Config::defaults()).await.expect("build"), None);
        let held = engine.snapshot().await;
        assert!(held.config.generation.api_key.is_empty());

        let dir = tempfile::TempDir::new().expect("tempdir");
        tokio::fs::write(dir.path().join("config.toml"), "[generation]\napi_key = \"reloaded\"\n")
            .await
            .expect("write");
        let engine = Engine::new(EngineInner::build(Config::defaults()).await.expect("build"), Some(dir.path().to_path_buf()));
        engine.reload().await.expect("reload");

        assert!(held.config.generation.api_key.is_empty());
        assert_eq!(engine.config_snapshot().await.generation.api_key, "reloaded");
    }

    #[tokio::test]
    async fn build_loads_prompt_template_override_from_disk() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let template_path = dir.path().join("prompt.md.j2");
        tokio::fs::write(&template_path, "custom prompt, max {{ max_candidates }}")
            .await
            .expect("write");

        let mut config = Config::defaults();
        config.prompt.template_path = Some(template_path);
        let inner = EngineInner::build(config).await.expect("build");

        assert_eq!(inner.system_prompt_override.as_deref(), Some("custom prompt, max {{ max_candidates }}"));
    }

    #[tokio::test]
    async fn build_falls_back_to_no_override_when_template_file_is_missing() {
        let mut config = Config::defaults();
        config.prompt.template_path = Some(PathBuf::from("/nonexistent/prompt.md.j2"));
        let inner = EngineInner::build(config).await.expect("build");

        assert!(inner.system_prompt_override.is_none());
    }
}
