use ::config::Config;
use std::time::Duration;

// Defaults for the keys looked up by the server and the client
pub(crate) const DEFAULT_MAX_READ_SIZE: usize = 1024;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 128;
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub(crate) const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

/// Settings shared by the server and the client reactors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReactorSettings {
    pub max_read_size: usize,
    pub poll_capacity: usize,
    pub write_timeout: Duration,
}

impl ReactorSettings {
    pub fn from_config(config: &Config, name: &str) -> Self {
        let max_read_size = get_namespaced_usize(config, name, "max_read_size")
            .unwrap_or(DEFAULT_MAX_READ_SIZE)
            .max(1);
        let poll_capacity = get_namespaced_usize(config, name, "poll_capacity")
            .unwrap_or(DEFAULT_POLL_CAPACITY)
            .max(1);
        let write_timeout_ms = get_namespaced_u64(config, name, "write_timeout_ms")
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS);

        Self {
            max_read_size,
            poll_capacity,
            write_timeout: Duration::from_millis(write_timeout_ms),
        }
    }
}
