//! 命令行参数、JSON 配置文件与默认值。

use clap::Parser;
use serde::{Deserialize, Serialize};
use shadow_rs::formatcp;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 60088;
pub const DEFAULT_API_TOKEN: &str = "xxx";
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_TEMP_DIR: &str = "./temp";
pub const DEFAULT_CLEAN_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_TEMP_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_MULTIPART_EXPIRE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const MULTIPART_DIR: &str = "MultiPart";

/// 命令行参数。
#[derive(Parser, Debug)]
#[command(
    name = "simple-file-server",
    version = VERSION_INFO,
    about = "Simple file server with multipart upload"
)]
pub struct Args {
    #[arg(
        short = 'c',
        long,
        env = "SFS_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path of the JSON config file (created with defaults if absent)"
    )]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 磁盘上的服务配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub debug: bool,
    pub host: String,
    pub port: u16,
    pub api_token: String,
    pub data_dir: String,
    pub temp_dir: String,
    pub clean_interval_secs: u64,
    pub temp_retention_secs: u64,
    pub multipart_expire_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_token: DEFAULT_API_TOKEN.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            temp_dir: DEFAULT_TEMP_DIR.to_string(),
            clean_interval_secs: DEFAULT_CLEAN_INTERVAL_SECS,
            temp_retention_secs: DEFAULT_TEMP_RETENTION_SECS,
            multipart_expire_secs: DEFAULT_MULTIPART_EXPIRE_SECS,
        }
    }
}

impl AppConfig {
    /// 读取配置文件；文件不存在时写入默认配置。返回值第二项表示是否新建。
    pub fn load_or_create(path: &Path) -> Result<(Self, bool), ConfigError> {
        match std::fs::metadata(path) {
            Ok(_) => Ok((Self::load(path)?, false)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.write_new(path)?;
                Ok((config, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 读取并规范化配置文件。
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let mut config: AppConfig = serde_json::from_slice(&bytes)?;
        if config.data_dir.trim().is_empty() {
            config.data_dir = DEFAULT_DATA_DIR.to_string();
        }
        if config.temp_dir.trim().is_empty() {
            config.temp_dir = DEFAULT_TEMP_DIR.to_string();
        }
        Ok(config)
    }

    fn write_new(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = serde_json::to_vec_pretty(self)?;
        content.push(b'\n');
        std::fs::write(path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn temp_root(&self) -> PathBuf {
        PathBuf::from(&self.temp_dir)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn temp_retention(&self) -> Duration {
        Duration::from_secs(self.temp_retention_secs)
    }

    pub fn multipart_expire(&self) -> Duration {
        Duration::from_secs(self.multipart_expire_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_create_writes_defaults_when_missing() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("conf").join("config.json");

        let (config, created) = AppConfig::load_or_create(&path).expect("create config");
        assert!(created);
        assert_eq!(config, AppConfig::default());

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read config")).expect("json");
        assert_eq!(written["port"], DEFAULT_PORT);
        assert_eq!(written["apiToken"], DEFAULT_API_TOKEN);
        assert_eq!(written["cleanIntervalSecs"], DEFAULT_CLEAN_INTERVAL_SECS);

        let (reloaded, created) = AppConfig::load_or_create(&path).expect("reload config");
        assert!(!created);
        assert_eq!(reloaded, config);
    }

    #[test]
    fn load_fills_missing_and_empty_fields() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            br#"{"debug": true, "port": 8080, "apiToken": "secret", "dataDir": "", "tempDir": "  "}"#,
        )
        .expect("write config");

        let config = AppConfig::load(&path).expect("load config");
        assert!(config.debug);
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_token, "secret");
        assert_eq!(config.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(config.temp_dir, DEFAULT_TEMP_DIR);
        assert_eq!(config.multipart_expire(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn load_rejects_malformed_json() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, b"{ not json").expect("write config");

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Json(_))));
    }

    #[test]
    fn cli_parses_config_flag_and_describes_uploads_only() {
        use clap::CommandFactory;

        let args = Args::try_parse_from(["simple-file-server", "-c", "/etc/sfs.json"])
            .expect("parse args");
        assert_eq!(args.config, PathBuf::from("/etc/sfs.json"));

        let about = Args::command()
            .get_about()
            .map(|about| about.to_string())
            .unwrap_or_default();
        assert_eq!(about, "Simple file server with multipart upload");
    }

    #[test]
    fn sessions_use_multipart_dir_name_of_existing_deployments() {
        assert_eq!(MULTIPART_DIR, "MultiPart");
    }
}
