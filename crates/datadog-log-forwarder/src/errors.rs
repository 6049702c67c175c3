// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the forwarder and its transport collaborators
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Failed to establish connection: {0}")]
    Connection(String),

    #[error("Transport write failed: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ForwarderError::Connection("refused".to_string());
        assert_eq!(error.to_string(), "Failed to establish connection: refused");

        let error = ForwarderError::Transport("broken pipe".to_string());
        assert_eq!(error.to_string(), "Transport write failed: broken pipe");
    }

    #[test]
    fn test_error_debug() {
        let error = ForwarderError::InvalidConfig("max_items must be > 0".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("InvalidConfig"));
    }
}
