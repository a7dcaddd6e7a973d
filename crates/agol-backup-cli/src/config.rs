use agol_backup_core::config::{FileConfig, WaitPolicy, DEFAULT_PORTAL_URL};
use agol_backup_core::error::AppError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "agol-backup")]
#[command(
    author,
    version,
    about = "Back up ArcGIS Online content (feature services, web maps, apps, dashboards)"
)]
#[command(after_help = "Examples:
  agol-backup --username gis_admin --output-dir /var/backups/agol
  AGOL_PASSWORD=... agol-backup --portal-url https://gis.example.org/portal -u gis_admin -o ./backup
  agol-backup --config ~/agol.toml --keep-going")]
pub struct Config {
    /// Portal to back up
    #[arg(long, env = "AGOL_PORTAL_URL", value_name = "URL")]
    pub portal_url: Option<String>,

    /// Account to sign in with
    #[arg(short, long, env = "AGOL_USERNAME")]
    pub username: Option<String>,

    /// Password for the account
    #[arg(long, env = "AGOL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Directory the backup files are written to
    #[arg(short, long, env = "AGOL_OUTPUT_DIR", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Custom path to config.toml
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log failed items and continue instead of stopping at the first error
    #[arg(long)]
    pub keep_going: bool,

    /// Seconds to wait for each geodatabase export before giving up
    #[arg(long, value_name = "SECS")]
    pub export_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub portal_url: String,
    pub username: String,
    pub password: String,
    pub output_dir: PathBuf,
    pub wait: WaitPolicy,
    pub keep_going: bool,
}

impl Settings {
    /// Merges command-line/env values over the configuration file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` when username, password or output
    /// directory is set nowhere.
    pub fn resolve(config: Config, file: FileConfig) -> Result<Self, AppError> {
        let portal_url = config
            .portal_url
            .or(file.portal_url)
            .unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string());
        let username = config
            .username
            .or(file.username)
            .ok_or_else(|| missing("username", "--username or AGOL_USERNAME"))?;
        let password = config
            .password
            .or(file.password)
            .ok_or_else(|| missing("password", "--password or AGOL_PASSWORD"))?;
        let output_dir = config
            .output_dir
            .or(file.output_dir)
            .ok_or_else(|| missing("output directory", "--output-dir or AGOL_OUTPUT_DIR"))?;

        let mut wait = file.wait.to_policy();
        if let Some(secs) = config.export_timeout {
            wait.timeout = Duration::from_secs(secs);
        }

        Ok(Self {
            portal_url,
            username,
            password,
            output_dir,
            wait,
            keep_going: config.keep_going,
        })
    }
}

fn missing(what: &str, hint: &str) -> AppError {
    AppError::ConfigError(format!("no {} configured (set {})", what, hint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agol_backup_core::config::WaitSection;

    // Keeps tests independent of AGOL_* variables in the developer's shell.
    fn parse(args: &[&str]) -> Config {
        let mut config = Config::try_parse_from(args).unwrap();
        if !args.contains(&"--portal-url") {
            config.portal_url = None;
        }
        if !args.iter().any(|a| *a == "--username" || *a == "-u") {
            config.username = None;
        }
        if !args.contains(&"--password") {
            config.password = None;
        }
        if !args.iter().any(|a| *a == "--output-dir" || *a == "-o") {
            config.output_dir = None;
        }
        config
    }

    #[test]
    fn test_parse_all_flags() {
        let config = parse(&[
            "agol-backup",
            "--portal-url",
            "https://gis.example.org/portal",
            "-u",
            "gis_admin",
            "--password",
            "secret",
            "-o",
            "/tmp/out",
            "--keep-going",
            "--export-timeout",
            "90",
            "-v",
        ]);
        assert_eq!(
            config.portal_url.as_deref(),
            Some("https://gis.example.org/portal")
        );
        assert_eq!(config.username.as_deref(), Some("gis_admin"));
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/out")));
        assert!(config.keep_going);
        assert!(config.verbose);
        assert_eq!(config.export_timeout, Some(90));
    }

    #[test]
    fn test_resolve_defaults_portal_and_wait() {
        let config = parse(&[
            "agol-backup",
            "-u",
            "bob",
            "--password",
            "pw",
            "-o",
            "/tmp/out",
        ]);
        let settings = Settings::resolve(config, FileConfig::default()).unwrap();
        assert_eq!(settings.portal_url, DEFAULT_PORTAL_URL);
        assert_eq!(settings.wait, WaitPolicy::default());
        assert!(!settings.keep_going);
    }

    #[test]
    fn test_resolve_cli_overrides_file() {
        let config = parse(&[
            "agol-backup",
            "-u",
            "cli_user",
            "--export-timeout",
            "45",
        ]);
        let file = FileConfig {
            portal_url: Some("https://file.example.org/portal".to_string()),
            username: Some("file_user".to_string()),
            password: Some("file_pw".to_string()),
            output_dir: Some(PathBuf::from("/srv/agol")),
            wait: WaitSection {
                initial_delay_secs: Some(3),
                max_delay_secs: None,
                timeout_secs: Some(300),
            },
        };

        let settings = Settings::resolve(config, file).unwrap();
        assert_eq!(settings.portal_url, "https://file.example.org/portal");
        assert_eq!(settings.username, "cli_user");
        assert_eq!(settings.password, "file_pw");
        assert_eq!(settings.output_dir, PathBuf::from("/srv/agol"));
        assert_eq!(settings.wait.initial_delay, Duration::from_secs(3));
        assert_eq!(settings.wait.timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_resolve_missing_password() {
        let config = parse(&["agol-backup", "-u", "bob", "-o", "/tmp/out"]);
        let err = Settings::resolve(config, FileConfig::default()).unwrap_err();
        match err {
            AppError::ConfigError(msg) => assert!(msg.contains("AGOL_PASSWORD")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }
}
