use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;

/// Runtime configuration, resolved once from the environment.
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub upload_dir: PathBuf,
    pub max_upload_mb: u64,
    pub session_ttl_days: i64,
    /// Retry policy for the profile write that follows credential creation.
    pub profile_write_attempts: u32,
    pub profile_write_backoff: Duration,
}

lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

impl Config {
    fn from_env() -> Config {
        Config {
            bind_addr: parse_or(
                "EDUTRACK_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 3000)),
            ),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/edutrack".to_string()),
            upload_dir: PathBuf::from(
                env::var("EDUTRACK_UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),
            ),
            max_upload_mb: parse_or("EDUTRACK_MAX_UPLOAD_MB", 5),
            session_ttl_days: parse_or("EDUTRACK_SESSION_TTL_DAYS", 2),
            profile_write_attempts: parse_or("EDUTRACK_PROFILE_WRITE_ATTEMPTS", 3),
            profile_write_backoff: Duration::from_millis(parse_or(
                "EDUTRACK_PROFILE_WRITE_BACKOFF_MS",
                1000,
            )),
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}
