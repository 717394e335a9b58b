//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use slcp_core::{DiscoveryMode, DEFAULT_BROADCAST_ADDR};

/// Node configuration. File: ./slcp_config.toml, ~/.config/slcp/config.toml or /etc/slcp/config.toml.
/// Env overrides: SLCP_HANDLE, SLCP_PORT, SLCP_DISCOVERY_PORT, SLCP_IMAGE_DIR, SLCP_AUTOREPLY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our handle on the LAN. Required.
    #[serde(default)]
    pub handle: String,
    /// UDP and TCP port (default 5000). 0 picks a free one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface to bind (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Destination of JOIN/LEAVE/WHO/WHOIS (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    /// Port broadcasts are sent to. Defaults to `port`.
    #[serde(default)]
    pub discovery_port: Option<u16>,
    /// IP we put in our own KNOWNUSERS/IAM entry. Detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,
    /// Where received images are written (default ./received_images).
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Text sent back automatically to every incoming message.
    #[serde(default)]
    pub autoreply: Option<String>,
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_header_timeout_secs")]
    pub header_timeout_secs: u64,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Incoming images announcing more than this are refused.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
}

fn default_port() -> u16 {
    5000
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_broadcast_addr() -> IpAddr {
    DEFAULT_BROADCAST_ADDR
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("received_images")
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_header_timeout_secs() -> u64 {
    5
}
fn default_chunk_timeout_secs() -> u64 {
    30
}
fn default_max_image_bytes() -> u64 {
    64 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handle: String::new(),
            port: default_port(),
            bind_addr: default_bind_addr(),
            broadcast_addr: default_broadcast_addr(),
            discovery_port: None,
            advertise_ip: None,
            image_dir: default_image_dir(),
            autoreply: None,
            discovery_mode: DiscoveryMode::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            header_timeout_secs: default_header_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

impl Config {
    /// Config for `handle` with every other field at its default.
    pub fn for_handle(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            ..Self::default()
        }
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port.unwrap_or(self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Reject values that would break the wire grammar or the transfer path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handle.is_empty() {
            return Err(ConfigError::MissingHandle);
        }
        if self.handle.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(ConfigError::InvalidHandle(self.handle.clone()));
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_image_bytes",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{var}={value:?} is not valid")]
    InvalidEnv { var: &'static str, value: String },
    #[error("{field}={value:?} is not valid")]
    InvalidValue { field: &'static str, value: String },
    #[error("no handle configured")]
    MissingHandle,
    #[error("handle {0:?} must not contain whitespace or commas")]
    InvalidHandle(String),
}

/// Load config: default, then config file (explicit path, else the first of the
/// search paths that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply SLCP_* overrides read through `var`.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = var("SLCP_HANDLE") {
        c.handle = s;
    }
    if let Some(s) = var("SLCP_PORT") {
        c.port = parse_port("SLCP_PORT", &s)?;
    }
    if let Some(s) = var("SLCP_DISCOVERY_PORT") {
        c.discovery_port = Some(parse_port("SLCP_DISCOVERY_PORT", &s)?);
    }
    if let Some(s) = var("SLCP_IMAGE_DIR") {
        c.image_dir = PathBuf::from(s);
    }
    if let Some(s) = var("SLCP_AUTOREPLY") {
        c.autoreply = (!s.is_empty()).then_some(s);
    }
    Ok(())
}

fn parse_port(var: &'static str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = vec![PathBuf::from("slcp_config.toml")];
    if let Some(h) = home {
        out.push(h.join(".config/slcp/config.toml"));
    }
    out.push(PathBuf::from("/etc/slcp/config.toml"));
    out
}
