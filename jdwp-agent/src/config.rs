// Agent configuration
//
// Parses the classic agent option string:
//   transport=dt_socket,server=y,suspend=n,address=*:8000[,timeout=5000]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_OUTGOING_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown option: {0}")]
    UnknownOption(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerOptions {
    pub transport: String,
    /// `None` means all interfaces when listening, localhost when attaching
    pub host: Option<String>,
    pub port: u16,
    /// Listen for the debugger (`true`) or attach to it (`false`)
    pub server: bool,
    /// Hold the process until a debugger is attached
    pub suspend: bool,
    pub handshake_timeout_ms: u64,
    pub outgoing_queue_capacity: usize,
}

impl Default for DebuggerOptions {
    fn default() -> Self {
        Self {
            transport: "dt_socket".to_string(),
            host: None,
            port: 0,
            server: false,
            suspend: true,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            outgoing_queue_capacity: DEFAULT_OUTGOING_QUEUE_CAPACITY,
        }
    }
}

impl DebuggerOptions {
    /// Parse a comma separated `key=value` option string
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        let mut have_address = false;

        for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: entry.to_string(),
                value: String::new(),
            })?;

            match key {
                "transport" => {
                    if value != "dt_socket" {
                        return Err(ConfigError::UnsupportedTransport(value.to_string()));
                    }
                    options.transport = value.to_string();
                }
                "address" => {
                    let (host, port) = parse_address(value)?;
                    options.host = host;
                    options.port = port;
                    have_address = true;
                }
                "server" => options.server = parse_flag(key, value)?,
                "suspend" => options.suspend = parse_flag(key, value)?,
                "timeout" => {
                    options.handshake_timeout_ms =
                        value.parse().map_err(|_| invalid(key, value))?;
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }

        if !have_address {
            return Err(ConfigError::Missing("address"));
        }

        Ok(options)
    }

    /// Host to bind (listen mode) or connect to (attach mode)
    pub fn effective_host(&self) -> &str {
        match self.host.as_deref() {
            Some(host) => host,
            None if self.server => "0.0.0.0",
            None => "localhost",
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn parse_address(value: &str) -> Result<(Option<String>, u16), ConfigError> {
    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (Some(host), port),
        None => (None, value),
    };

    let port = port.parse::<u16>().map_err(|_| invalid("address", value))?;
    let host = match host {
        None | Some("") | Some("*") => None,
        Some(h) => Some(h.to_string()),
    };

    Ok((host, port))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "y" => Ok(true),
        "n" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_options() {
        let options =
            DebuggerOptions::parse("transport=dt_socket,server=y,suspend=n,address=*:8000")
                .unwrap();
        assert!(options.server);
        assert!(!options.suspend);
        assert_eq!(options.port, 8000);
        assert_eq!(options.host, None);
        assert_eq!(options.effective_host(), "0.0.0.0");
    }

    #[test]
    fn test_parse_attach_defaults() {
        let options = DebuggerOptions::parse("address=debugger.local:5005,timeout=250").unwrap();
        assert!(!options.server);
        assert!(options.suspend);
        assert_eq!(options.effective_host(), "debugger.local");
        assert_eq!(options.handshake_timeout(), Duration::from_millis(250));

        let options = DebuggerOptions::parse("address=5005").unwrap();
        assert_eq!(options.effective_host(), "localhost");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DebuggerOptions::parse("server=y"),
            Err(ConfigError::Missing("address"))
        );
        assert_eq!(
            DebuggerOptions::parse("transport=dt_shmem,address=1"),
            Err(ConfigError::UnsupportedTransport("dt_shmem".to_string()))
        );
        assert!(matches!(
            DebuggerOptions::parse("address=1,suspend=maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            DebuggerOptions::parse("address=host:notaport"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            DebuggerOptions::parse("address=1,launch=foo"),
            Err(ConfigError::UnknownOption("launch".to_string()))
        );
    }
}
