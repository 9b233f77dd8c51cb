use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use session_core::{
    OrchestratorConfig, DEFAULT_BLOCK_COOLDOWN, DEFAULT_SESSION_DIR, DEFAULT_SYNC_FALLBACK,
};
use shared::domain::PhoneNumber;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub session_dir: PathBuf,
    pub default_phone: Option<String>,
    pub block_cooldown_secs: u64,
    pub sync_fallback_secs: u64,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            default_phone: None,
            block_cooldown_secs: DEFAULT_BLOCK_COOLDOWN.as_secs(),
            sync_fallback_secs: DEFAULT_SYNC_FALLBACK.as_secs(),
        }
    }
}

impl ConsoleSettings {
    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let default_phone = self
            .default_phone
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(PhoneNumber::parse)
            .transpose()
            .context("invalid default phone number")?;

        Ok(OrchestratorConfig {
            session_dir: self.session_dir.clone(),
            default_phone,
            block_cooldown: Duration::from_secs(self.block_cooldown_secs),
            sync_fallback: Duration::from_secs(self.sync_fallback_secs),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    session_dir: Option<PathBuf>,
    default_phone: Option<String>,
    block_cooldown_secs: Option<u64>,
    sync_fallback_secs: Option<u64>,
}

/// Defaults, then the TOML file at `path` if present, then `APP__*` variables.
pub fn load_settings(path: &Path) -> ConsoleSettings {
    load_settings_with(path, |key| std::env::var(key).ok())
}

fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> ConsoleSettings {
    let mut settings = ConsoleSettings::default();

    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<FileSettings>(&raw) {
            Ok(file) => {
                if let Some(v) = file.session_dir {
                    settings.session_dir = v;
                }
                if file.default_phone.is_some() {
                    settings.default_phone = file.default_phone;
                }
                if let Some(v) = file.block_cooldown_secs {
                    settings.block_cooldown_secs = v;
                }
                if let Some(v) = file.sync_fallback_secs {
                    settings.sync_fallback_secs = v;
                }
            }
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring unparsable settings file: {err}");
            }
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "config: cannot read settings file: {err}"),
    }

    if let Some(v) = env("APP__SESSION_DIR") {
        settings.session_dir = PathBuf::from(v);
    }
    if let Some(v) = env("APP__DEFAULT_PHONE") {
        settings.default_phone = Some(v);
    }
    if let Some(secs) = env_secs(&env, "APP__BLOCK_COOLDOWN_SECS") {
        settings.block_cooldown_secs = secs;
    }
    if let Some(secs) = env_secs(&env, "APP__SYNC_FALLBACK_SECS") {
        settings.sync_fallback_secs = secs;
    }

    settings
}

fn env_secs(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = env(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(err) => {
            warn!(key, value = %raw, "config: ignoring invalid duration: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings_with(&dir.path().join("absent.toml"), no_env);
        assert_eq!(settings, ConsoleSettings::default());
        assert_eq!(settings.block_cooldown_secs, 600);
        assert_eq!(settings.sync_fallback_secs, 10);
    }

    #[test]
    fn file_values_then_env_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.toml");
        fs::write(
            &path,
            "session_dir = \"/srv/wa/auth\"\ndefault_phone = \"+62 812 3456 7\"\nsync_fallback_secs = 3\n",
        )
        .expect("write config");

        let from_file = load_settings_with(&path, no_env);
        assert_eq!(from_file.session_dir, PathBuf::from("/srv/wa/auth"));
        assert_eq!(from_file.default_phone.as_deref(), Some("+62 812 3456 7"));
        assert_eq!(from_file.sync_fallback_secs, 3);
        assert_eq!(from_file.block_cooldown_secs, 600);

        let overridden = load_settings_with(
            &path,
            env_from(&[
                ("APP__SESSION_DIR", "/tmp/other"),
                ("APP__BLOCK_COOLDOWN_SECS", "30"),
            ]),
        );
        assert_eq!(overridden.session_dir, PathBuf::from("/tmp/other"));
        assert_eq!(overridden.block_cooldown_secs, 30);
        assert_eq!(overridden.sync_fallback_secs, 3);
    }

    #[test]
    fn invalid_numbers_and_broken_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.toml");
        fs::write(&path, "session_dir = [").expect("write config");

        let settings = load_settings_with(
            &path,
            env_from(&[
                ("APP__BLOCK_COOLDOWN_SECS", "ten minutes"),
                ("APP__SYNC_FALLBACK_SECS", "-1"),
            ]),
        );
        assert_eq!(settings, ConsoleSettings::default());
    }

    #[test]
    fn orchestrator_config_normalizes_the_phone() {
        let settings = ConsoleSettings {
            default_phone: Some("+62 812-3456-7".into()),
            block_cooldown_secs: 5,
            ..ConsoleSettings::default()
        };
        let config = settings.orchestrator_config().expect("config");
        assert_eq!(
            config.default_phone.as_ref().map(PhoneNumber::as_str),
            Some("6281234567")
        );
        assert_eq!(config.block_cooldown, Duration::from_secs(5));

        let blank = ConsoleSettings {
            default_phone: Some("  ".into()),
            ..ConsoleSettings::default()
        };
        assert_eq!(blank.orchestrator_config().expect("config").default_phone, None);

        let bad = ConsoleSettings {
            default_phone: Some("operator".into()),
            ..ConsoleSettings::default()
        };
        assert!(bad.orchestrator_config().is_err());
    }
}
