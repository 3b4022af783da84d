use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const CONFIG_FILE: &str = "bksave.toml";

/// Name of the encryption delegate binary shipped with this crate.
pub const CRYPT_BINARY: &str = "bksave-crypt";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Xml,
}

impl LogFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub jobs_file: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    /// Process name that pauses every running job while it is alive.
    pub business_software: Option<String>,
    pub encrypted_extensions: Vec<String>,
    pub encryption_key: Option<String>,
    pub crypt_executable: Option<PathBuf>,
    pub business_poll_ms: u64,
    pub max_jobs: usize,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("bksave-data"),
            jobs_file: None,
            state_file: None,
            log_dir: None,
            log_format: LogFormat::Json,
            business_software: None,
            encrypted_extensions: Vec::new(),
            encryption_key: None,
            crypt_executable: None,
            business_poll_ms: 1000,
            max_jobs: 5,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Resolve configuration: defaults, then the TOML file, then `BKSAVE_*`
    /// environment variables, then command-line overrides.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or_else(|| Path::new(CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("BKSAVE_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.jobs_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("jobs.json"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.json"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn business_poll_interval(&self) -> Duration {
        Duration::from_millis(self.business_poll_ms.max(10))
    }

    /// The configured business software name, if any non-blank one is set.
    pub fn business_process(&self) -> Option<&str> {
        self.business_software
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Locate the encryption executable: the configured path if it exists,
    /// otherwise `bksave-crypt` next to the running binary.
    pub fn resolve_crypt_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.crypt_executable {
            return path.is_file().then(|| path.clone());
        }

        let exe = std::env::current_exe().ok()?;
        let sibling = exe
            .parent()?
            .join(format!("{}{}", CRYPT_BINARY, std::env::consts::EXE_SUFFIX));
        sibling.is_file().then_some(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        business_software: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_jobs: Option<usize>,
    }

    #[test]
    fn test_derived_paths_follow_data_dir() {
        let config = AppConfig {
            data_dir: PathBuf::from("/var/lib/bksave"),
            ..AppConfig::default()
        };
        assert_eq!(config.jobs_path(), PathBuf::from("/var/lib/bksave/jobs.json"));
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/bksave/state.json"));
        assert_eq!(config.log_path(), PathBuf::from("/var/lib/bksave/logs"));
    }

    #[test]
    fn test_file_then_overrides() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("bksave.toml");
        std::fs::write(
            &file,
            "log_format = \"xml\"\nbusiness_software = \"calc\"\nencrypted_extensions = [\"txt\", \".pdf\"]\n",
        )
        .unwrap();

        let overrides = Overrides {
            business_software: None,
            max_jobs: Some(9),
        };
        let config = AppConfig::new(Some(&file), Some(&overrides)).unwrap();

        assert_eq!(config.log_format, LogFormat::Xml);
        assert_eq!(config.business_process(), Some("calc"));
        assert_eq!(config.encrypted_extensions, ["txt", ".pdf"]);
        assert_eq!(config.max_jobs, 9);
        assert_eq!(config.business_poll_ms, 1000);
    }

    #[test]
    fn test_blank_business_software_is_none() {
        let config = AppConfig {
            business_software: Some("  ".into()),
            ..AppConfig::default()
        };
        assert!(config.business_process().is_none());
    }

    #[test]
    fn test_configured_crypt_executable_must_exist() {
        let config = AppConfig {
            crypt_executable: Some(PathBuf::from("/definitely/not/here")),
            ..AppConfig::default()
        };
        assert!(config.resolve_crypt_executable().is_none());
    }
}
