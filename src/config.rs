//! Server configuration from the environment.
//!
//! | Variable          | Default                 |
//! |-------------------|-------------------------|
//! | `PORT`            | 3001                    |
//! | `HEALTH_PORT`     | 3002                    |
//! | `ALLOWED_ORIGINS` | `http://localhost:3000` |
//! | `SESSION_SECRET`  | dev-only fallback       |
//! | `DATA_DIR`        | `data`                  |
//! | `NODE_ENV`        | `development`           |

use std::env;

const DEV_SECRET: &str = "banchess-dev-secret";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub health_port: u16,
    pub allowed_origins: Vec<String>,
    pub session_secret: String,
    pub data_dir: String,
    pub production: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let production = env::var("NODE_ENV").is_ok_and(|v| v == "production");
        let session_secret = match env::var("SESSION_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                if production {
                    log::warn!("SESSION_SECRET is not set; falling back to the dev secret");
                }
                DEV_SECRET.to_string()
            }
        };

        Self {
            port: env_port("PORT", 3001),
            health_port: env_port("HEALTH_PORT", 3002),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            session_secret,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            production,
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("invalid {} value {:?}, using {}", name, value, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Only assert pure defaults; the test environment may not set any
        // of the variables.
        let config = ServerConfig::from_env();
        assert!(config.port > 0);
        assert!(config.health_port > 0);
        assert!(!config.allowed_origins.is_empty() || env::var("ALLOWED_ORIGINS").is_ok());
    }
}
