// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ForwarderError;
use std::env;
use std::time::Duration;

const DEFAULT_MAX_ITEMS: usize = 50;
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for the log forwarder device.
///
/// Fixed for the lifetime of a forwarder instance.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Per-group flush trigger by pending event count
    pub max_items: usize,
    /// Per-group flush trigger by age of the oldest pending event.
    /// `None` disables the timer-driven flush entirely.
    pub max_interval: Option<Duration>,
    /// Discard a batch when its flush fails instead of retrying it on the
    /// next trigger
    pub drop_on_flush_error: bool,
    /// Shed new events when a group's buffer is saturated instead of
    /// blocking the producer
    pub drop_on_full_buffer: bool,
    /// Whether the at-exit hook performs a final flush before teardown
    pub flush_at_exit: bool,
    /// Bypass buffering and flush synchronously on every write
    pub autoflush: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_interval: Some(DEFAULT_MAX_INTERVAL),
            drop_on_flush_error: false,
            drop_on_full_buffer: true,
            flush_at_exit: true,
            autoflush: false,
        }
    }
}

impl ForwarderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ForwarderError> {
        let max_items = env::var("DD_LOGS_BUFFER_MAX_ITEMS")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_ITEMS);
        // 0 disables the interval trigger
        let max_interval = match env::var("DD_LOGS_BUFFER_MAX_INTERVAL_SECS") {
            Ok(val) => match val.parse::<u64>().ok() {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => Some(DEFAULT_MAX_INTERVAL),
            },
            Err(_) => Some(DEFAULT_MAX_INTERVAL),
        };
        let drop_on_flush_error = env_flag("DD_LOGS_DROP_ON_FLUSH_ERROR", false);
        let drop_on_full_buffer = env_flag("DD_LOGS_DROP_ON_FULL_BUFFER", true);
        let flush_at_exit = env_flag("DD_LOGS_FLUSH_AT_EXIT", true);
        let autoflush = env_flag("DD_LOGS_AUTOFLUSH", false);

        let config = Self {
            max_items,
            max_interval,
            drop_on_flush_error,
            drop_on_full_buffer,
            flush_at_exit,
            autoflush,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ForwarderError> {
        if self.max_items == 0 {
            return Err(ForwarderError::InvalidConfig(
                "max_items must be greater than 0".to_string(),
            ));
        }

        if let Some(interval) = self.max_interval {
            if interval.is_zero() {
                return Err(ForwarderError::InvalidConfig(
                    "max_interval must be greater than 0, or unset to disable".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| match val.to_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ForwarderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_items, 50);
        assert_eq!(config.max_interval, Some(Duration::from_secs(5)));
        assert!(!config.drop_on_flush_error);
        assert!(config.drop_on_full_buffer);
    }

    #[test]
    fn test_validate_zero_max_items() {
        let config = ForwarderConfig {
            max_items: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = ForwarderConfig {
            max_interval: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ForwarderConfig {
            max_interval: None,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
