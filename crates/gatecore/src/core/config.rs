use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Bot token used to derive the init data signing key
/// Read from BOT_TOKEN environment variable
pub static BOT_TOKEN: Lazy<String> = Lazy::new(|| env::var("BOT_TOKEN").unwrap_or_else(|_| String::new()));

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: wallet.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "wallet.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: app.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "app.log".to_string()));

/// Port for the Mini App API server
/// Read from WEBAPP_PORT environment variable
/// Default: 3000
pub static WEBAPP_PORT: Lazy<u16> = Lazy::new(|| {
    env::var("WEBAPP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000)
});

/// Allowed CORS origin for the Mini App front-end
/// Read from CORS_ORIGIN environment variable
/// Default: "*" (any origin)
pub static CORS_ORIGIN: Lazy<String> =
    Lazy::new(|| env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".to_string()));

/// Init data freshness policy
pub mod auth {
    use super::{env, Lazy};

    /// Maximum accepted age of a signed init data payload (in seconds).
    /// A payload with `now - auth_date` strictly greater than this is
    /// rejected as expired. Policy constant, not a cryptographic bound.
    pub const MAX_AGE_SECS: i64 = 86400; // 24 hours

    /// Effective freshness window, overridable via AUTH_MAX_AGE_SECS
    pub static MAX_AGE: Lazy<i64> = Lazy::new(|| {
        env::var("AUTH_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MAX_AGE_SECS)
    });
}

/// PIN lockout policy
pub mod pin {
    use super::{env, Duration, Lazy};

    /// Consecutive failed verifications that trigger a lockout
    pub const LOCKOUT_THRESHOLD: u32 = 3;

    /// How long a locked account refuses verification attempts (in seconds)
    pub const LOCKOUT_DURATION_SECS: i64 = 300; // 5 minutes

    /// Effective threshold, overridable via PIN_LOCKOUT_THRESHOLD
    pub static THRESHOLD: Lazy<u32> = Lazy::new(|| {
        env::var("PIN_LOCKOUT_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LOCKOUT_THRESHOLD)
    });

    /// Effective lockout window, overridable via PIN_LOCKOUT_DURATION_SECS
    pub static DURATION_SECS: Lazy<i64> = Lazy::new(|| {
        env::var("PIN_LOCKOUT_DURATION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LOCKOUT_DURATION_SECS)
    });

    /// Lockout window as a `Duration`
    pub fn lockout_duration() -> Duration {
        Duration::from_secs(*DURATION_SECS as u64)
    }

    /// Policy snapshot used by the PIN guard
    pub fn policy() -> crate::auth::PinPolicy {
        crate::auth::PinPolicy {
            max_attempts: *THRESHOLD,
            lockout_secs: *DURATION_SECS,
        }
    }
}
