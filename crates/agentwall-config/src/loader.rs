use agentwall_core::AgentWallError;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::AgentWallConfig;

/// Loads and optionally hot-reloads the AgentWall configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<AgentWallConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > `AGENTWALL_CONFIG` env > `./agentwall.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("AGENTWALL_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("agentwall.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AgentWallError> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<AgentWallConfig>(&raw).map_err(|e| {
                AgentWallError::InvalidRequest(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            AgentWallConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(AgentWallError::InvalidRequest(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> AgentWallConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<AgentWallConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply `AGENTWALL_<SECTION>_<FIELD>` overrides plus the direct
    /// provider-credential environment variables.
    fn apply_env_overrides(mut config: AgentWallConfig) -> AgentWallConfig {
        if let Ok(v) = std::env::var("AGENTWALL_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("AGENTWALL_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("AGENTWALL_DLP_MODE") {
            config.dlp.mode = v;
        }
        if let Ok(v) = std::env::var("AGENTWALL_BUDGET_DAILY_LIMIT_USD") {
            if let Ok(n) = v.parse::<f64>() {
                config.budget.daily_limit_usd = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTWALL_BUDGET_PER_RUN_LIMIT_USD") {
            if let Ok(n) = v.parse::<f64>() {
                config.budget.per_run_limit_usd = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTWALL_RUN_DEFAULT_MAX_STEPS") {
            if let Ok(n) = v.parse::<u32>() {
                config.run.default_max_steps = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTWALL_IDENTITY_SERVICE_URL") {
            config.server.identity_service_url = Some(v);
        }

        // Direct provider credentials: config file wins, env var fills gaps.
        for (env_var, provider) in [
            ("OPENAI_API_KEY", "openai"),
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("GROQ_API_KEY", "groq"),
            ("DEEPSEEK_API_KEY", "deepseek"),
            ("MISTRAL_API_KEY", "mistral"),
            ("QWEN_API_KEY", "qwen"),
        ] {
            if let Ok(v) = std::env::var(env_var) {
                let entry = config.providers.entries.entry(provider.into()).or_default();
                if entry.api_key.is_none() {
                    entry.api_key = Some(v);
                }
            }
        }
        if let Ok(v) = std::env::var("OLLAMA_BASE_URL") {
            let entry = config.providers.entries.entry("ollama".into()).or_default();
            if entry.base_url.is_empty() {
                entry.base_url = v;
            }
        }

        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> Result<(), AgentWallError> {
        if !self.config_path.exists() {
            return Err(AgentWallError::InvalidRequest(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<AgentWallConfig>(&raw).map_err(|e| {
            AgentWallError::InvalidRequest(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        new_config
            .validate()
            .map_err(AgentWallError::InvalidRequest)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that triggers a reload when the config
    /// file changes. The returned watcher must be kept alive.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher, AgentWallError> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            match res {
                Ok(event) => match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }
                        info!("config file changed, reloading");
                        match std::fs::read_to_string(&path_for_event) {
                            Ok(raw) => match toml::from_str::<AgentWallConfig>(&raw) {
                                Ok(new_config) => {
                                    let new_config = ConfigLoader::apply_env_overrides(new_config);
                                    if let Err(e) = new_config.validate() {
                                        warn!(error = %e, "reloaded config is invalid, keeping current config");
                                        return;
                                    }
                                    *config.write() = new_config;
                                    info!("configuration hot-reloaded successfully");
                                }
                                Err(e) => warn!(error = %e, "config file has errors, keeping current config"),
                            },
                            Err(e) => warn!(error = %e, "failed to read config file during hot-reload"),
                        }
                    }
                    _ => {}
                },
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })
        .map_err(|e| AgentWallError::Internal(format!("failed to create file watcher: {e}")))?;

        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| AgentWallError::Internal(format!("failed to watch config directory: {e}")))?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let loader = ConfigLoader::load(Some(Path::new("/nonexistent/agentwall.toml"))).unwrap();
        assert_eq!(loader.get().server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn load_parses_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9000\"\n").unwrap();
        let loader = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(loader.get().server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn reload_rejects_invalid_config_and_keeps_old() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"127.0.0.1:9000\"\n").unwrap();
        let loader = ConfigLoader::load(Some(file.path())).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(loader.path())
            .unwrap();
        writeln!(file, "[dlp]\nmode = \"not-a-mode\"\n").unwrap();

        assert!(loader.reload().is_err());
        assert_eq!(loader.get().server.listen, "127.0.0.1:9000");
    }
}
