//! Layered configuration.
//!
//! Values are merged in explicit passes: schema defaults, configuration files, environment
//! variables. Afterwards required fields are checked and the result is deserialized.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use ::config::{builder::DefaultState, Config, ConfigBuilder, File};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

static DEFAULT_ENV_PREFIX: &str = "ICS_SRV";
static DEFAULT_ENVIRONMENT: &str = "development";

/// How a single configuration value is found.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// dotted path inside the configuration tree
    pub path: &'static str,
    /// environment variable name, without prefix
    pub env: &'static str,
    pub default: Option<&'static str>,
    pub required: bool,
}

/// The schema of [`AppConfig`].
///
/// `time_zone_aliases` is a map and only read from files.
pub static SCHEMA: &[FieldSpec] = &[
    FieldSpec {
        path: "app_name",
        env: "APP_NAME",
        default: Some("Tidbyt ICS Server"),
        required: true,
    },
    FieldSpec {
        path: "port",
        env: "PORT",
        default: Some("3000"),
        required: true,
    },
    FieldSpec {
        path: "debug",
        env: "DEBUG",
        default: Some("false"),
        required: false,
    },
    FieldSpec {
        path: "lookahead_days",
        env: "LOOKAHEAD_DAYS",
        default: Some("7"),
        required: true,
    },
    FieldSpec {
        path: "rate_limit.max",
        env: "RATE_LIMIT_MAX",
        default: Some("20"),
        required: true,
    },
    FieldSpec {
        path: "rate_limit.expiration_secs",
        env: "RATE_LIMIT_EXPIRATION_SECS",
        default: Some("30"),
        required: true,
    },
    FieldSpec {
        path: "reload.enabled",
        env: "RELOAD_ENABLED",
        default: Some("false"),
        required: false,
    },
    FieldSpec {
        path: "reload.interval_secs",
        env: "RELOAD_INTERVAL_SECS",
        default: Some("1"),
        required: false,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    pub port: u16,
    pub debug: bool,
    /// how many days ahead calendars are searched
    pub lookahead_days: u32,
    pub rate_limit: RateLimitConfig,
    pub reload: ReloadConfig,
    /// zone names used by calendars mapped to IANA names
    #[serde(default)]
    pub time_zone_aliases: HashMap<String, String>,
}

impl AppConfig {
    /// The span searched for upcoming events.
    pub fn lookahead(&self) -> ics_core::chrono::Duration {
        ics_core::chrono::Duration::days(i64::from(self.lookahead_days))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// requests allowed per window and client
    pub max: u32,
    pub expiration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] ::config::ConfigError),
    #[error("{0} is required, but blank")]
    Required(&'static str),
}

/// Settings of the loader itself.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// selects `config.<environment>.yml`
    pub environment: Option<String>,
    /// `-` disables the prefix
    pub env_prefix: Option<String>,
    pub debug: bool,
}

impl Settings {
    /// Read the loader settings from `CONFIG_ENV`, `CONFIG_ENV_PREFIX` and `CONFIG_DEBUG_MODE`.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());
        Settings {
            environment: non_empty("CONFIG_ENV"),
            env_prefix: non_empty("CONFIG_ENV_PREFIX")
                .or_else(|| Some(DEFAULT_ENV_PREFIX.to_string())),
            debug: non_empty("CONFIG_DEBUG_MODE").is_some(),
        }
    }

    pub fn environment(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    /// The full environment variable name of a field.
    fn env_name(&self, field: &FieldSpec) -> String {
        match self.env_prefix.as_deref() {
            Some("-") => field.env.to_string(),
            Some(prefix) => format!("{prefix}_{}", field.env),
            None => format!("CONFIG_{}", field.env),
        }
    }
}

/// Loads configuration and remembers which files it came from.
#[derive(Debug)]
pub struct ConfigLoader {
    settings: Settings,
    schema: &'static [FieldSpec],
    files: Vec<PathBuf>,
    mod_times: HashMap<PathBuf, SystemTime>,
}

impl ConfigLoader {
    /// Earlier files take precedence over later ones.
    pub fn new(settings: Settings, schema: &'static [FieldSpec], files: Vec<PathBuf>) -> Self {
        ConfigLoader {
            settings,
            schema,
            files,
            mod_times: HashMap::new(),
        }
    }

    /// The files used by the last load, sorted by path.
    pub fn loaded_files(&self) -> Vec<&Path> {
        let mut files: Vec<&Path> = self.mod_times.keys().map(PathBuf::as_path).collect();
        files.sort();
        files
    }

    pub fn load<T: DeserializeOwned>(&mut self) -> Result<T, ConfigError> {
        let files = self.discover();
        self.mod_times = files.iter().cloned().collect();

        let mut builder = Config::builder();
        for field in self.schema {
            if let Some(default) = field.default {
                builder = builder.set_default(field.path, default)?;
            }
        }
        for (file, _) in &files {
            debug!(file = %file.display(), "loading configuration file");
            builder = builder.add_source(File::from(file.as_path()));
        }
        builder = self.apply_env(builder)?;
        let config = builder.build()?;

        for field in self.schema.iter().filter(|field| field.required) {
            match config.get_string(field.path) {
                Ok(value) if !value.trim().is_empty() => {}
                _ => return Err(ConfigError::Required(field.path)),
            }
        }
        Ok(config.try_deserialize()?)
    }

    /// Whether configuration files appeared, vanished or were modified since the last load.
    pub fn has_changed(&self) -> bool {
        let current: HashMap<PathBuf, SystemTime> = self.discover().into_iter().collect();
        current != self.mod_times
    }

    fn apply_env(
        &self,
        mut builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        for field in self.schema {
            let name = self.settings.env_name(field);
            if let Some(value) = env::var(&name).ok().filter(|value| !value.is_empty()) {
                debug!(field = field.path, env = %name, "loading configuration from environment");
                builder = builder.set_override(field.path, value)?;
            }
        }
        Ok(builder)
    }

    /// Find the existing configuration files in the order they are merged.
    ///
    /// Each file is followed by its environment specific variant, when neither exists the
    /// `example` variant is used.
    fn discover(&self) -> Vec<(PathBuf, SystemTime)> {
        let environment = self.settings.environment();
        let mut found = vec![];
        for file in self.files.iter().rev() {
            let candidates = [file.clone(), variant(file, environment)];
            let mut existing: Vec<(PathBuf, SystemTime)> = candidates
                .into_iter()
                .filter_map(|path| modified(&path).map(|time| (path, time)))
                .collect();
            if existing.is_empty() {
                let example = variant(file, "example");
                match modified(&example) {
                    Some(time) => {
                        debug!(
                            file = %file.display(),
                            example = %example.display(),
                            "using example configuration"
                        );
                        existing.push((example, time));
                    }
                    None => debug!(file = %file.display(), "configuration file not found"),
                }
            }
            found.extend(existing);
        }
        found
    }
}

/// `config.yml` with variant `test` becomes `config.test.yml`.
fn variant(file: &Path, name: &str) -> PathBuf {
    match (file.file_stem(), file.extension()) {
        (Some(stem), Some(extension)) => file.with_file_name(format!(
            "{}.{name}.{}",
            stem.to_string_lossy(),
            extension.to_string_lossy()
        )),
        _ => PathBuf::from(format!("{}.{name}", file.display())),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    metadata.modified().ok()
}

/// Reload the configuration whenever its files change and publish it to `sender`.
///
/// A configuration which fails to load is skipped, the previous one stays active.
pub async fn watch_changes(
    mut loader: ConfigLoader,
    sender: watch::Sender<Arc<AppConfig>>,
    interval: Duration,
) {
    info!(?interval, "watching configuration files");
    loop {
        tokio::time::sleep(interval).await;
        if !loader.has_changed() {
            continue;
        }
        match loader.load::<AppConfig>() {
            Ok(config) => {
                info!(files = ?loader.loaded_files(), "configuration reloaded");
                sender.send_replace(Arc::new(config));
            }
            Err(err) => warn!(%err, "failed to reload configuration"),
        }
    }
}
