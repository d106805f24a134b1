use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Seconds an unidentified connection may sit before being closed;
    /// 0 disables the timeout.
    pub handshake_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("COMPANION_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(9220),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            handshake_timeout_seconds: env::var("COMPANION_HANDSHAKE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(120),
        }
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        if self.handshake_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.handshake_timeout_seconds))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9220,
            redis_url: "redis://localhost:6379".to_string(),
            handshake_timeout_seconds: 120,
        }
    }
}
