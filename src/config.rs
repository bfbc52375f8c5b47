use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TransferError},
    DEFAULT_HTTP_PORT, DEFAULT_RECEIVER_PORT, IO_CHUNK_SIZE, MAX_FILE_SIZE,
};

const CONFIG_FILE: &str = "filebridge.toml";
const ENV_PREFIX: &str = "FILEBRIDGE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the receiver stores incoming files.
    pub receive_dir: PathBuf,
    /// TCP listen address of the receiver.
    pub receiver_addr: SocketAddr,
    /// Listen address of the HTTP relay.
    pub http_addr: SocketAddr,
    pub max_file_size: u64,
    /// Lowercase extensions with their dot, e.g. `.png`. Empty allows all.
    pub allowed_extensions: Vec<String>,
    pub io_chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Request body limit for a single relay chunk.
    pub max_chunk_body: usize,
}

impl Default for Config {
    fn default() -> Self {
        let receive_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("filebridge-received"))
            .unwrap_or_else(|| PathBuf::from("received"));

        Self {
            receive_dir,
            receiver_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_RECEIVER_PORT).into(),
            http_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_HTTP_PORT).into(),
            max_file_size: MAX_FILE_SIZE,
            allowed_extensions: Vec::new(),
            io_chunk_size: IO_CHUNK_SIZE,
            connect_timeout_secs: 10,
            max_chunk_body: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads `filebridge.toml` from the platform config dir, writing the
    /// defaults there first if the file does not exist yet.
    pub fn new() -> Result<Self> {
        let dirs = directories::BaseDirs::new().ok_or(TransferError::NoHomeDir)?;
        let config_file = dirs.config_dir().join(CONFIG_FILE);

        if !config_file.exists() {
            log::info!("creating config file at {config_file:?}");
            if let Some(parent) = config_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&config_file, toml::to_string(&Self::default())?)?;
        }

        Self::from_file(&config_file)
    }

    /// Defaults, then the TOML file (if present), then `FILEBRIDGE_*` vars.
    pub fn from_file(path: &Path) -> Result<Self> {
        log::info!("reading config from {path:?}");
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?; // boxed because the error size from figment is large

        log::debug!("using config: {config:?}");
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether `filename`'s extension passes the allow-list.
    pub fn extension_allowed(&self, filename: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let ext = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.to_lowercase() == ext)
    }
}
