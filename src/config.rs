// ABOUTME: Process-wide configuration, loaded from a Java-properties-formatted file plus CLI overrides
// ABOUTME: Mirrors the source's classpath-default-plus-external-override model (§6)

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::warn;

/// Historical default P3 listen port (§6).
pub const DEFAULT_PORT: u16 = 5191;
/// Wire frame length cap (§6); maximum chunk payload is this minus 9.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 194;
/// Bytes of header/token/stream-id overhead subtracted from the frame cap
/// to get the maximum chunk payload.
pub const FRAME_OVERHEAD: usize = 9;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: java_properties::PropertiesError },

    #[error("{field} must be a valid {expected}, got {value:?}")]
    InvalidValue {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Process-wide settings, recognized options per §6's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialtoneConfig {
    pub server_port: u16,
    pub bind_address: IpAddr,
    pub max_frame_length: usize,
    pub packet_delay_ms: u64,
    pub auth_users: String,
    pub verbose: bool,
}

impl Default for DialtoneConfig {
    fn default() -> Self {
        DialtoneConfig {
            server_port: DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            packet_delay_ms: 0,
            auth_users: String::new(),
            verbose: false,
        }
    }
}

impl DialtoneConfig {
    /// Maximum chunk payload derivable from `max_frame_length` (§6).
    pub fn max_chunk_payload(&self) -> usize {
        self.max_frame_length.saturating_sub(FRAME_OVERHEAD)
    }

    /// Loads configuration from `path`, falling back to defaults for any
    /// option it doesn't set. A missing file is not fatal (§6's
    /// "[EXPANDED]" note); a malformed one is a [`ConfigError`].
    pub fn load(path: Option<&Path>) -> Result<DialtoneConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(DialtoneConfig::default());
        };
        let path_str = path.display().to_string();

        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path_str, "config file not found; using defaults");
                return Ok(DialtoneConfig::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path_str, source }),
        };

        let props = java_properties::read(file).map_err(|source| ConfigError::Parse {
            path: path_str.clone(),
            source,
        })?;

        let mut config = DialtoneConfig::default();
        if let Some(v) = props.get("server.port") {
            config.server_port = parse_field("server.port", "u16", v)?;
        }
        if let Some(v) = props.get("bind.address") {
            config.bind_address = parse_field("bind.address", "IP address", v)?;
        }
        if let Some(v) = props.get("p3.max.frame.length") {
            config.max_frame_length = parse_field("p3.max.frame.length", "usize", v)?;
        }
        if let Some(v) = props.get("packet.delay.ms") {
            config.packet_delay_ms = parse_field("packet.delay.ms", "u64", v)?;
        }
        if let Some(v) = props.get("auth.users") {
            config.auth_users = v.clone();
        }
        if let Some(v) = props.get("verbose").or_else(|| props.get("debug")) {
            config.verbose = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }

        Ok(config)
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, expected: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field,
        expected,
        value: value.to_string(),
    })
}
