use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_scrape.conf";
const DEFAULT_SCRAPE_FILE: &str = "scrape.yaml";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Scrape change watcher", version)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    #[clap(long, env = "SCRAPE_CONFIG_PATH", help = "Path to the JSON settings file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SCRAPE_DEFINITIONS_PATH", help = "Path to the scrape definitions (JSON or YAML).")]
    pub scrape_path: Option<PathBuf>,

    #[clap(long, env = "SCRAPE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SCRAPE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SCRAPE_STATE_PATH", help = "Write a JSON dump of every sensor here after each update.")]
    pub state_path: Option<PathBuf>,
}

impl Settings {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Settings) -> Settings {
        Settings {
            config_path: other.config_path.or(self.config_path),
            scrape_path: other.scrape_path.or(self.scrape_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            state_path: other.state_path.or(self.state_path),
        }
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or(Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn scrape_path(&self) -> &Path {
        self.scrape_path
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_SCRAPE_FILE))
    }
}

fn defaults() -> Settings {
    let local = PathBuf::from(DEFAULT_SCRAPE_FILE);
    // Fall back to ~/.scrape/scrape.yaml when there is none in the working directory.
    let scrape_path = if local.exists() {
        local
    } else {
        dirs::home_dir()
            .map(|home| home.join(".scrape").join(DEFAULT_SCRAPE_FILE))
            .unwrap_or(local)
    };

    Settings {
        scrape_path: Some(scrape_path),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    }
}

/// Reads the settings file named by `cli` (or the default one) and layers
/// defaults < file < env/CLI.
pub fn resolve(cli: Settings) -> Settings {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(file_settings) => current = current.merge(file_settings),
                Err(e) => log::warn!(
                    "Failed to parse settings file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read settings file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Settings file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current.merge(cli)
}

pub fn load_settings() -> Settings {
    resolve(Settings::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"scrapePath": "/etc/scrape/sites.json", "logLevel": "debug", "statePath": "/tmp/state.json"}}"#
        )
        .unwrap();

        let cli = Settings {
            config_path: Some(file.path().to_path_buf()),
            log_level: Some("warn".into()),
            ..Default::default()
        };
        let settings = resolve(cli);

        assert_eq!(settings.scrape_path(), Path::new("/etc/scrape/sites.json"));
        assert_eq!(settings.log_level(), "warn");
        assert_eq!(settings.state_path, Some(PathBuf::from("/tmp/state.json")));
        assert_eq!(settings.log_dir(), Path::new("./logs"));
    }

    #[test]
    fn unreadable_settings_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let settings = resolve(Settings {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(settings.log_level(), "info");
        assert!(settings.state_path.is_none());
    }
}
