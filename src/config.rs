//! Configuration surface (C6): a TOML file loaded once at startup and
//! published behind an `ArcSwap` so handlers always read a consistent
//! snapshot without taking a lock.
use serde_derive::Deserialize;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

const DEFAULT_READ_BUFFER: usize = 4 * 1024;
const DEFAULT_WRITE_BUFFER: usize = 4 * 1024;
const DEFAULT_OS_RECV_BUFFER: usize = 224 * 1024;
const DEFAULT_OS_SEND_BUFFER: usize = 224 * 1024;

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    11311
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Per-connection user-space read buffer, bytes. Zero means "use the
    /// default".
    pub read_buffer: usize,

    /// Per-connection user-space write buffer, bytes. Zero means "use the
    /// default".
    pub write_buffer: usize,

    /// OS-level `SO_RCVBUF`, bytes. Zero means "use the default".
    pub os_recv_buffer: usize,

    /// OS-level `SO_SNDBUF`, bytes. Zero means "use the default".
    pub os_send_buffer: usize,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            read_buffer: 0,
            write_buffer: 0,
            os_recv_buffer: 0,
            os_send_buffer: 0,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("could not read config file `{path}`: {e}"))?;
        let mut config: Config =
            toml::from_str(&text).map_err(|e| format!("could not parse config file `{path}`: {e}"))?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.read_buffer == 0 {
            self.read_buffer = DEFAULT_READ_BUFFER;
        }
        if self.write_buffer == 0 {
            self.write_buffer = DEFAULT_WRITE_BUFFER;
        }
        if self.os_recv_buffer == 0 {
            self.os_recv_buffer = DEFAULT_OS_RECV_BUFFER;
        }
        if self.os_send_buffer == 0 {
            self.os_send_buffer = DEFAULT_OS_SEND_BUFFER;
        }
        if self.log_level.is_empty() {
            self.log_level = default_log_level();
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The process-wide configuration, hot-swappable in principle (no reload
/// trigger is wired up yet; see DESIGN.md) the same way the teacher keeps
/// its pool configuration behind an `ArcSwap` rather than behind a lock.
pub static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

pub fn set(config: Config) {
    CONFIG.store(Arc::new(config));
}

pub fn get() -> Arc<Config> {
    CONFIG.load_full()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_zero_fields() {
        let mut config = Config {
            host: "0.0.0.0".into(),
            port: 1234,
            read_buffer: 0,
            write_buffer: 0,
            os_recv_buffer: 0,
            os_send_buffer: 0,
            log_level: String::new(),
        };
        config.apply_defaults();
        assert_eq!(config.read_buffer, DEFAULT_READ_BUFFER);
        assert_eq!(config.write_buffer, DEFAULT_WRITE_BUFFER);
        assert_eq!(config.os_recv_buffer, DEFAULT_OS_RECV_BUFFER);
        assert_eq!(config.os_send_buffer, DEFAULT_OS_SEND_BUFFER);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn nonzero_fields_survive() {
        let mut config = Config {
            read_buffer: 8192,
            ..Config::default()
        };
        config.apply_defaults();
        assert_eq!(config.read_buffer, 8192);
    }
}
