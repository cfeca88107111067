use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Config;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Ensure at least one listener is defined
        if self.listeners.is_empty() {
            anyhow::bail!("at least one listener must be defined");
        }

        // Validate listener names are unique
        let mut listener_names = std::collections::HashSet::new();
        for listener in &self.listeners {
            if !listener_names.insert(&listener.name) {
                anyhow::bail!("duplicate listener name: {}", listener.name);
            }
        }

        for listener in &self.listeners {
            let framing = &listener.framing;

            if framing.max_length > 0
                && framing.min_length > 0
                && framing.min_length > framing.max_length
            {
                anyhow::bail!(
                    "listener '{}': min_length ({}) exceeds max_length ({})",
                    listener.name,
                    framing.min_length,
                    framing.max_length
                );
            }

            // A terminator pattern replaces handler-driven framing; it only
            // makes sense in binary mode
            if let Some(pattern) = &framing.terminator_pattern {
                if pattern.is_empty() {
                    anyhow::bail!(
                        "listener '{}': terminator_pattern must not be empty",
                        listener.name
                    );
                }
                if framing.text {
                    anyhow::bail!(
                        "listener '{}': terminator_pattern requires binary mode (text: false)",
                        listener.name
                    );
                }
            }

            if listener.transport.is_stream() && listener.backlog == 0 {
                anyhow::bail!("listener '{}': backlog must be greater than zero", listener.name);
            }
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
listeners:
  - name: tracker
    port: 31200
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].transport, Transport::Stream);
        assert!(config.listeners[0].framing.text);
        assert!(config.listeners[0].terminate_on_timeout);
        assert_eq!(config.listeners[0].framing.line_terminators, vec![b'\n']);
    }

    #[test]
    fn test_datagram_listener() {
        let yaml = r#"
listeners:
  - name: tracker-udp
    port: 31200
    transport: datagram
    framing:
      text: false
      max_length: 512
    timeouts:
      idle: 5s
      packet: 500ms
"#;

        let config = Config::from_yaml(yaml).unwrap();
        let listener = &config.listeners[0];
        assert_eq!(listener.transport, Transport::Datagram);
        assert_eq!(listener.framing.max_length, 512);
        assert_eq!(
            listener.timeouts.packet,
            Some(std::time::Duration::from_millis(500))
        );
        assert_eq!(listener.timeouts.session, None);
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "listeners:\n  - name: tracker\n    port: 31200\n").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.listeners[0].port, 31200);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/sessiond.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_listener_name() {
        let yaml = r#"
listeners:
  - name: tracker
    port: 31200
  - name: tracker
    port: 31201
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("duplicate listener name"));
    }

    #[test]
    fn test_no_listeners() {
        let yaml = r#"
listeners: []
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("at least one listener"));
    }

    #[test]
    fn test_pattern_requires_binary() {
        let yaml = r#"
listeners:
  - name: tracker
    port: 31200
    framing:
      text: true
      terminator_pattern: [35, 33]
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("binary mode"));
    }

    #[test]
    fn test_min_exceeds_max() {
        let yaml = r#"
listeners:
  - name: tracker
    port: 31200
    framing:
      text: false
      min_length: 64
      max_length: 32
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.is_err());
    }
}
