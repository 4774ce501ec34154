//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

/// Parse and validate a TOML configuration.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{CookieRewrite, FollowRedirects};

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
            [listener]
            port = 8000
            hostname = "127.0.0.1"

            [proxy]
            target = "http://localhost:3000/api"
            xfwd = true
            change_origin = true
            follow_redirects = 3
            cookie_domain_rewrite = { "old.com" = "new.com", "*" = "" }

            [proxy.headers]
            x-proxied-by = "proxy-relay"

            [observability]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 8000);
        assert_eq!(config.listener.hostname.as_deref(), Some("127.0.0.1"));
        let target = config.proxy.target.as_ref().unwrap();
        assert_eq!(target.port, Some(3000));
        assert_eq!(target.path.as_deref(), Some("/api"));
        assert_eq!(config.proxy.xfwd, Some(true));
        assert_eq!(config.proxy.follow_redirects, Some(FollowRedirects::Limit(3)));
        assert!(matches!(config.proxy.cookie_domain_rewrite, Some(CookieRewrite::Rules(_))));
        assert_eq!(config.proxy.headers.as_ref().unwrap()["x-proxied-by"], "proxy-relay");
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse_config("[proxy"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_error_display() {
        let err = parse_config("[listener]\nport = 9000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().starts_with("Validation failed: "));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/proxy.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
