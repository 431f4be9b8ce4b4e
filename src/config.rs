use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::{MempackError, Result};

pub const ENV_DATA_DIR: &str = "MEMPACK_DATA_DIR";
pub const ENV_EMBED_HOST: &str = "MEMPACK_EMBED_HOST";
pub const ENV_EMBED_HOST_FALLBACK: &str = "OLLAMA_HOST";
pub const ENV_EMBED_MODEL: &str = "MEMPACK_EMBED_MODEL";

const DEFAULT_EMBED_HOST: &str = "http://localhost:11434";
const PROBE_MEMO_TTL: Duration = Duration::from_secs(30);

/// Fully resolved configuration. Threaded explicitly to every component
/// that needs paths or provider settings; nothing reads globals after this
/// is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub tokenizer: String,
    pub token_budget: usize,
    pub state_max_tokens: usize,
    pub memory_max_each: usize,
    pub chunk_max_each: usize,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_host: String,
    pub embedding_min_similarity: f64,
    pub default_thread: String,
    pub mcp_allow_write: bool,
    pub mcp_write_mode: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            tokenizer: "bytes-estimate".into(),
            token_budget: 8000,
            state_max_tokens: 1500,
            memory_max_each: 400,
            chunk_max_each: 600,
            embedding_provider: "none".into(),
            embedding_model: "nomic-embed-text".into(),
            embedding_host: DEFAULT_EMBED_HOST.into(),
            embedding_min_similarity: 0.35,
            default_thread: "T-default".into(),
            mcp_allow_write: false,
            mcp_write_mode: "confirm".into(),
        }
    }
}

impl Config {
    /// Per-repo database path: `<data_root>/repos/<repo_id>/memory.db`.
    pub fn db_path(&self, repo_id: &str) -> PathBuf {
        self.data_dir.join("repos").join(repo_id).join("memory.db")
    }
}

/// The subset of fields a settings file may carry. Anything absent keeps
/// the previous layer's value.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    data_dir: Option<PathBuf>,
    tokenizer: Option<String>,
    token_budget: Option<usize>,
    state_max_tokens: Option<usize>,
    memory_max_each: Option<usize>,
    chunk_max_each: Option<usize>,
    embedding_provider: Option<String>,
    embedding_model: Option<String>,
    embedding_host: Option<String>,
    embedding_min_similarity: Option<f64>,
    default_thread: Option<String>,
    mcp_allow_write: Option<bool>,
    mcp_write_mode: Option<String>,
}

/// Repo-scoped overrides from `<repo_root>/.mempack/config.json`. Absent or
/// empty values preserve the global config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RepoOverrides {
    pub mcp_allow_write: Option<bool>,
    pub mcp_write_mode: Option<String>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub token_budget: Option<usize>,
    pub default_thread: Option<String>,
}

/// Explicit, highest-precedence overrides (CLI flags).
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub token_budget: Option<usize>,
}

/// Resolve the effective configuration.
///
/// Data-root precedence, highest first: explicit override, process
/// environment, settings-file `data_dir`, working directory.
pub fn resolve(overrides: &Overrides) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(settings) = read_settings_file(&settings_path())? {
        apply_settings(&mut cfg, settings);
    }

    if let Ok(dir) = std::env::var(ENV_DATA_DIR)
        && !dir.is_empty()
    {
        cfg.data_dir = PathBuf::from(dir);
    }
    if let Ok(host) = std::env::var(ENV_EMBED_HOST)
        && !host.is_empty()
    {
        cfg.embedding_host = host;
    } else if let Ok(host) = std::env::var(ENV_EMBED_HOST_FALLBACK)
        && !host.is_empty()
    {
        cfg.embedding_host = host;
    }
    if let Ok(model) = std::env::var(ENV_EMBED_MODEL)
        && !model.is_empty()
    {
        cfg.embedding_model = model;
    }

    if let Some(dir) = &overrides.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(p) = &overrides.embedding_provider {
        cfg.embedding_provider = p.clone();
    }
    if let Some(m) = &overrides.embedding_model {
        cfg.embedding_model = m.clone();
    }
    if let Some(b) = overrides.token_budget {
        cfg.token_budget = b;
    }

    if cfg.data_dir.as_os_str().is_empty() {
        cfg.data_dir = std::env::current_dir()?;
    }
    if cfg.token_budget == 0 {
        return Err(MempackError::Config("token_budget must be positive".into()));
    }
    Ok(cfg)
}

fn settings_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_default();
    Path::new(&home).join(".mempack").join("settings.json")
}

fn read_settings_file(path: &Path) -> Result<Option<SettingsFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let settings: SettingsFile = serde_json::from_str(&data)
        .map_err(|e| MempackError::Config(format!("{}: {e}", path.display())))?;
    Ok(Some(settings))
}

fn apply_settings(cfg: &mut Config, s: SettingsFile) {
    if let Some(v) = s.data_dir {
        cfg.data_dir = v;
    }
    if let Some(v) = s.tokenizer {
        cfg.tokenizer = v;
    }
    if let Some(v) = s.token_budget {
        cfg.token_budget = v;
    }
    if let Some(v) = s.state_max_tokens {
        cfg.state_max_tokens = v;
    }
    if let Some(v) = s.memory_max_each {
        cfg.memory_max_each = v;
    }
    if let Some(v) = s.chunk_max_each {
        cfg.chunk_max_each = v;
    }
    if let Some(v) = s.embedding_provider {
        cfg.embedding_provider = v;
    }
    if let Some(v) = s.embedding_model {
        cfg.embedding_model = v;
    }
    if let Some(v) = s.embedding_host {
        cfg.embedding_host = v;
    }
    if let Some(v) = s.embedding_min_similarity {
        cfg.embedding_min_similarity = v;
    }
    if let Some(v) = s.default_thread {
        cfg.default_thread = v;
    }
    if let Some(v) = s.mcp_allow_write {
        cfg.mcp_allow_write = v;
    }
    if let Some(v) = s.mcp_write_mode {
        cfg.mcp_write_mode = v;
    }
}

/// Apply `<repo_root>/.mempack/config.json` on top of the global config.
/// Empty strings in the file are treated as absent.
pub fn apply_repo_overrides(cfg: &Config, overrides: &RepoOverrides) -> Config {
    let mut out = cfg.clone();
    if let Some(v) = overrides.mcp_allow_write {
        out.mcp_allow_write = v;
    }
    if let Some(v) = &overrides.mcp_write_mode
        && !v.is_empty()
    {
        out.mcp_write_mode = v.clone();
    }
    if let Some(v) = &overrides.embedding_provider
        && !v.is_empty()
    {
        out.embedding_provider = v.clone();
    }
    if let Some(v) = &overrides.embedding_model
        && !v.is_empty()
    {
        out.embedding_model = v.clone();
    }
    if let Some(v) = overrides.token_budget
        && v > 0
    {
        out.token_budget = v;
    }
    if let Some(v) = &overrides.default_thread
        && !v.is_empty()
    {
        out.default_thread = v.clone();
    }
    out
}

#[derive(Debug, Clone)]
struct CachedRepoConfig {
    size: u64,
    mtime: Option<SystemTime>,
    overrides: RepoOverrides,
}

/// Per-path cache for repo-scoped config files, invalidated when the file's
/// size or modification time changes.
#[derive(Default)]
pub struct RepoConfigCache {
    entries: RwLock<HashMap<PathBuf, CachedRepoConfig>>,
}

impl RepoConfigCache {
    pub fn load(&self, repo_root: &Path) -> RepoOverrides {
        let path = repo_root.join(".mempack").join("config.json");
        let Ok(meta) = fs::metadata(&path) else {
            self.entries.write().unwrap().remove(&path);
            return RepoOverrides::default();
        };
        let size = meta.len();
        let mtime = meta.modified().ok();

        if let Some(cached) = self.entries.read().unwrap().get(&path)
            && cached.size == size
            && cached.mtime == mtime
        {
            return cached.overrides.clone();
        }

        let overrides: RepoOverrides = fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default();

        self.entries.write().unwrap().insert(
            path,
            CachedRepoConfig {
                size,
                mtime,
                overrides: overrides.clone(),
            },
        );
        overrides
    }
}

/// Process-wide context: the resolved config plus the small in-memory
/// caches that used to be ambient singletons.
pub struct AppContext {
    pub config: Config,
    pub repo_configs: RepoConfigCache,
    probe_memo: Mutex<HashMap<(String, String), (Instant, bool)>>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            repo_configs: RepoConfigCache::default(),
            probe_memo: Mutex::new(HashMap::new()),
        }
    }

    /// Effective config for one repository root.
    pub fn config_for_repo(&self, repo_root: &Path) -> Config {
        let overrides = self.repo_configs.load(repo_root);
        apply_repo_overrides(&self.config, &overrides)
    }

    /// Memoized availability probe result per `(host, model)`.
    pub fn cached_probe(&self, host: &str, model: &str) -> Option<bool> {
        let memo = self.probe_memo.lock().unwrap();
        memo.get(&(host.to_string(), model.to_string()))
            .filter(|(at, _)| at.elapsed() < PROBE_MEMO_TTL)
            .map(|(_, ok)| *ok)
    }

    pub fn record_probe(&self, host: &str, model: &str, ok: bool) {
        self.probe_memo
            .lock()
            .unwrap()
            .insert((host.to_string(), model.to_string()), (Instant::now(), ok));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.token_budget, 8000);
        assert_eq!(cfg.embedding_host, DEFAULT_EMBED_HOST);
        assert_eq!(cfg.default_thread, "T-default");
    }

    #[test]
    fn db_path_layout() {
        let cfg = Config {
            data_dir: PathBuf::from("/data"),
            ..Config::default()
        };
        assert_eq!(
            cfg.db_path("r_12345678"),
            PathBuf::from("/data/repos/r_12345678/memory.db")
        );
    }

    #[test]
    fn explicit_override_beats_everything() {
        let cfg = resolve(&Overrides {
            data_dir: Some(PathBuf::from("/explicit")),
            token_budget: Some(123),
            ..Overrides::default()
        })
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/explicit"));
        assert_eq!(cfg.token_budget, 123);
    }

    #[test]
    fn repo_overrides_skip_empty_values() {
        let base = Config::default();
        let merged = apply_repo_overrides(
            &base,
            &RepoOverrides {
                embedding_model: Some(String::new()),
                token_budget: Some(0),
                default_thread: Some("T-feature".into()),
                ..RepoOverrides::default()
            },
        );
        assert_eq!(merged.embedding_model, base.embedding_model);
        assert_eq!(merged.token_budget, base.token_budget);
        assert_eq!(merged.default_thread, "T-feature");
    }

    #[test]
    fn repo_config_cache_invalidates_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".mempack");
        fs::create_dir_all(&cfg_dir).unwrap();
        let cfg_path = cfg_dir.join("config.json");
        fs::write(&cfg_path, r#"{"token_budget": 100}"#).unwrap();

        let cache = RepoConfigCache::default();
        assert_eq!(cache.load(dir.path()).token_budget, Some(100));

        // Same size would not invalidate, so change the length too.
        fs::write(&cfg_path, r#"{"token_budget": 2500}"#).unwrap();
        assert_eq!(cache.load(dir.path()).token_budget, Some(2500));
    }

    #[test]
    fn repo_config_cache_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepoConfigCache::default();
        assert!(cache.load(dir.path()).token_budget.is_none());
    }

    #[test]
    fn probe_memo_round_trips() {
        let ctx = AppContext::new(Config::default());
        assert_eq!(ctx.cached_probe("h", "m"), None);
        ctx.record_probe("h", "m", true);
        assert_eq!(ctx.cached_probe("h", "m"), Some(true));
        assert_eq!(ctx.cached_probe("h", "other"), None);
    }
}
