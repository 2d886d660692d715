use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::template;

pub(crate) static DEFAULT_PROJECT_DIRS: Lazy<Option<ProjectDirs>> = Lazy::new(|| {
    #[cfg(target_os = "macos")]
    {
        // macOS: com.tunefetch.tunefetch
        ProjectDirs::from("com", "tunefetch", "tunefetch")
    }
    #[cfg(target_os = "windows")]
    {
        // Windows: tunefetch\tunefetch
        ProjectDirs::from("", "tunefetch", "tunefetch")
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        // Linux: tunefetch
        ProjectDirs::from("", "", "tunefetch")
    }
});

pub const CONFIG_RELATIVE_PATH: &str = "tunefetch.toml";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_CLIENT_ID: &str = "492e1e45ea814fa3ac555fe1576aaf5b";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LogSettings,
}

impl Config {
    pub fn load_or_default(path: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let resolved_path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(default_config_path);

        if resolved_path.exists() {
            let content = fs::read_to_string(&resolved_path).map_err(|source| ConfigError::Io {
                path: resolved_path.clone(),
                source,
            })?;
            let config =
                toml::from_str::<Config>(&content).map_err(|source| ConfigError::Parse {
                    path: resolved_path.clone(),
                    source,
                })?;
            config.validate()?;
            Ok((config, resolved_path))
        } else {
            let config = Config::default();
            config.save(&resolved_path)?;
            Ok((config, resolved_path))
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, serialized).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        template::validate(&self.download.output_template)?;
        Ok(())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.auth
            .credentials_path
            .clone()
            .unwrap_or_else(|| data_dir().join("credentials.json"))
    }

    pub fn archive_path(&self) -> PathBuf {
        data_dir().join("archive.db")
    }
}

fn default_config_path() -> PathBuf {
    if let Some(project_dirs) = DEFAULT_PROJECT_DIRS.as_ref() {
        project_dirs.config_dir().join(CONFIG_RELATIVE_PATH)
    } else {
        PathBuf::from(CONFIG_RELATIVE_PATH)
    }
}

pub(crate) fn data_dir() -> PathBuf {
    DEFAULT_PROJECT_DIRS
        .as_ref()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub music_dir: PathBuf,
    pub podcast_dir: PathBuf,
    pub language: String,
    pub theme: ThemePreference,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            music_dir: default_library_dir("Music"),
            podcast_dir: default_library_dir("Podcasts"),
            language: default_language(),
            theme: ThemePreference::System,
        }
    }
}

fn default_library_dir(folder: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(folder).join("Tunefetch");
    }
    // Fallback to current directory
    PathBuf::from(".").join(folder)
}

fn default_language() -> String {
    match std::env::var("LANG") {
        Ok(value) => value
            .split('.')
            .next()
            .map(|tag| tag.replace('_', "-"))
            .filter(|tag| !tag.is_empty() && tag != "C" && tag != "POSIX")
            .unwrap_or_else(|| "en-US".to_string()),
        Err(_) => "en-US".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Auto,
    Normal,
    High,
    VeryHigh,
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Quality::Auto => "auto",
            Quality::Normal => "normal",
            Quality::High => "high",
            Quality::VeryHigh => "very_high",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub quality: Quality,
    pub output_template: String,
    pub save_metadata: bool,
    pub retry_attempts: u8,
    pub bulk_wait_sec: u64,
    pub skip_previously_downloaded: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            quality: Quality::Auto,
            output_template: template::DEFAULT_TEMPLATE.to_string(),
            save_metadata: true,
            retry_attempts: 3,
            bulk_wait_sec: 1,
            skip_previously_downloaded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    pub helper_path: PathBuf,
    pub helper_args: Vec<String>,
    pub helper_extension: String,
    pub api_base_url: String,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from("tunefetch-stream"),
            helper_args: Vec::new(),
            helper_extension: "ogg".to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub client_id: String,
    pub redirect_port: u16,
    pub timeout_sec: u64,
    pub credentials_path: Option<PathBuf>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_port: 8898,
            timeout_sec: 300,
            credentials_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    pub enabled: bool,
    pub level: LogLevel,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
        }
    }
}

impl std::fmt::Display for ThemePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ThemePreference::Light => "Light",
            ThemePreference::Dark => "Dark",
            ThemePreference::System => "System",
        };
        write!(f, "{}", label)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        write!(f, "{}", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let restored: Config = toml::from_str(&toml).unwrap();
        assert_eq!(restored.download.quality, Quality::Auto);
        assert_eq!(restored.download.output_template, "{artist} - {song_name}");
        assert!(restored.download.save_metadata);
        assert_eq!(restored.auth.redirect_port, 8898);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str("[download]\nquality = \"very_high\"\noutput_template = \"{album}/{song_name}\"\nsave_metadata = false\nretry_attempts = 0\nbulk_wait_sec = 0\nskip_previously_downloaded = true\n").unwrap();
        assert_eq!(config.download.quality, Quality::VeryHigh);
        assert!(config.download.skip_previously_downloaded);
        assert_eq!(config.advanced.helper_extension, "ogg");
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf/tunefetch.toml");
        let (config, resolved) = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(resolved, path);
        assert!(path.exists());
        assert_eq!(config.download.retry_attempts, 3);
    }

    #[test]
    fn load_rejects_unknown_placeholder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tunefetch.toml");
        let mut config = Config::default();
        config.download.output_template = "{genre}/{song_name}".to_string();
        config.save(&path).unwrap();
        assert!(matches!(
            Config::load_or_default(Some(&path)),
            Err(ConfigError::Template(_))
        ));
    }
}
