use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{AppConfig, MAX_MEDIA_CODECS};
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads, so hot paths can call [`get`](Self::get)
/// freely.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load configuration from `path`, or defaults if the file does not exist
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::read_file(path).await?,
            None => AppConfig::default(),
        };
        validate(&config)?;

        Ok(Self {
            path: path.map(Path::to_path_buf),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Store holding an in-memory configuration
    pub fn from_config(config: AppConfig) -> Result<Self> {
        validate(&config)?;
        Ok(Self {
            path: None,
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration after validating it
    pub fn set(&self, config: AppConfig) -> Result<()> {
        validate(&config)?;
        self.cache.store(Arc::new(config));
        Ok(())
    }

    /// Re-read the backing file
    pub async fn reload(&self) -> Result<Arc<AppConfig>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.get());
        };
        let config = Self::read_file(path).await?;
        self.set(config)?;
        info!("Configuration reloaded from {}", path.display());
        Ok(self.get())
    }

    async fn read_file(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file {} not found, using defaults", path.display());
                Ok(AppConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.engine.rtc_min_port > config.engine.rtc_max_port {
        return Err(AppError::Config(format!(
            "rtc_min_port {} exceeds rtc_max_port {}",
            config.engine.rtc_min_port, config.engine.rtc_max_port
        )));
    }
    if config.engine.listen_ips.is_empty() {
        return Err(AppError::Config("engine.listen_ips is empty".to_string()));
    }
    if config.engine.media_codecs.is_empty() {
        return Err(AppError::Config("engine.media_codecs is empty".to_string()));
    }
    if config.engine.media_codecs.len() > MAX_MEDIA_CODECS {
        return Err(AppError::Config(format!(
            "engine.media_codecs lists {} codecs, at most {} are supported",
            config.engine.media_codecs.len(),
            MAX_MEDIA_CODECS
        )));
    }
    if config.channel.request_timeout_ms == 0 {
        return Err(AppError::Config(
            "channel.request_timeout_ms must be positive".to_string(),
        ));
    }
    Ok(())
}
