//! Environment-driven configuration for the tracker service

use std::time::Duration;

use crate::carrier::Carrier;
use crate::error::{CoreError, Result};

/// Full service configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auto_update: AutoUpdateConfig,
    pub carriers: CarriersConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub admin: AdminConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind host
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Drain window for in-flight requests on shutdown
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path of the embedded store file
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct AutoUpdateConfig {
    /// Master gate for the scheduler
    pub enabled: bool,
    /// Tick period
    pub interval_secs: u64,
    /// Global recency filter; shipments older than this are not auto-updated
    pub cutoff_days: i64,
    /// Consecutive failures after which a shipment drops out of auto-update
    pub failure_threshold: i64,
    /// Shipments pulled per eligibility query page
    pub batch_size: i64,
    /// Bound on one carrier batch within a tick
    pub batch_timeout_secs: u64,
    /// Bound on a single shipment refresh within a tick
    pub individual_timeout_secs: u64,
}

/// Credentials and per-carrier scheduler settings
#[derive(Debug, Clone, Default)]
pub struct CarrierConfig {
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_url: Option<String>,
    pub auto_update_enabled: bool,
    /// Per-carrier cutoff override; 0 falls back to the global cutoff
    pub auto_update_cutoff_days: i64,
}

#[derive(Debug, Clone)]
pub struct CarriersConfig {
    pub ups: CarrierConfig,
    pub usps: CarrierConfig,
    pub fedex: CarrierConfig,
    pub dhl: CarrierConfig,
}

impl CarriersConfig {
    pub fn get(&self, carrier: Carrier) -> &CarrierConfig {
        match carrier {
            Carrier::Ups => &self.ups,
            Carrier::Usps => &self.usps,
            Carrier::Fedex => &self.fedex,
            Carrier::Dhl => &self.dhl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub disabled: bool,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub disabled: bool,
    /// Minimum spacing between carrier calls for one shipment
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub api_key: Option<String>,
    /// Development only: bypasses bearer auth entirely
    pub auth_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    /// Overrides the default carrier-sender search filter
    pub search_query: Option<String>,
    pub scan_days: i64,
    pub check_interval_secs: u64,
    pub dry_run: bool,
    pub max_per_run: usize,
    pub retention_days: i64,
    /// Separate store file for email state; empty means co-located
    pub state_db_path: Option<String>,
    pub validation_timeout_secs: u64,
    pub create_retry_count: u32,
    pub create_retry_delay_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_parse("SERVER_PORT", 8080)?,
                shutdown_grace_secs: env_parse("SERVER_SHUTDOWN_GRACE", 30)?,
            },
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "./parceltrack.db"),
            },
            auto_update: AutoUpdateConfig {
                enabled: env_bool("AUTO_UPDATE_ENABLED", true),
                interval_secs: env_parse("UPDATE_INTERVAL", 3600)?,
                cutoff_days: env_parse("AUTO_UPDATE_CUTOFF_DAYS", 30)?,
                failure_threshold: env_parse("AUTO_UPDATE_FAILURE_THRESHOLD", 10)?,
                batch_size: env_parse("AUTO_UPDATE_BATCH_SIZE", 100)?,
                batch_timeout_secs: env_parse("AUTO_UPDATE_BATCH_TIMEOUT", 60)?,
                individual_timeout_secs: env_parse("AUTO_UPDATE_INDIVIDUAL_TIMEOUT", 30)?,
            },
            carriers: CarriersConfig {
                ups: carrier_from_env("UPS", true)?,
                usps: carrier_from_env("USPS", true)?,
                fedex: carrier_from_env("FEDEX", true)?,
                dhl: carrier_from_env("DHL", true)?,
            },
            cache: CacheConfig {
                ttl_secs: env_parse("CACHE_TTL", 300)?,
                disabled: env_bool("CACHE_DISABLED", false),
            },
            rate_limit: RateLimitConfig {
                disabled: env_bool("RATE_LIMIT_DISABLED", false),
                window_secs: 300,
            },
            admin: AdminConfig {
                api_key: env_opt("ADMIN_API_KEY"),
                auth_disabled: env_bool("ADMIN_AUTH_DISABLED", false),
            },
            email: EmailConfig {
                enabled: env_bool("EMAIL_ENABLED", false),
                imap_host: env_or("EMAIL_IMAP_HOST", ""),
                imap_port: env_parse("EMAIL_IMAP_PORT", 993)?,
                username: env_or("EMAIL_USERNAME", ""),
                password: env_or("EMAIL_PASSWORD", ""),
                mailbox: env_or("EMAIL_MAILBOX", "INBOX"),
                search_query: env_opt("EMAIL_SEARCH_QUERY"),
                scan_days: env_parse("EMAIL_SCAN_DAYS", 30)?,
                check_interval_secs: env_parse("EMAIL_CHECK_INTERVAL", 300)?,
                dry_run: env_bool("EMAIL_DRY_RUN", false),
                max_per_run: env_parse("EMAIL_MAX_PER_RUN", 50)?,
                retention_days: env_parse("EMAIL_RETENTION_DAYS", 90)?,
                state_db_path: env_opt("EMAIL_STATE_DB_PATH"),
                validation_timeout_secs: env_parse("EMAIL_VALIDATION_TIMEOUT", 120)?,
                create_retry_count: env_parse("EMAIL_CREATE_RETRY_COUNT", 3)?,
                create_retry_delay_secs: env_parse("EMAIL_CREATE_RETRY_DELAY", 1)?,
            },
        })
    }

    /// Socket address string for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Effective cutoff for one carrier: per-carrier override if positive,
    /// otherwise the global value
    pub fn cutoff_days(&self, carrier: Carrier) -> i64 {
        let per_carrier = self.carriers.get(carrier).auto_update_cutoff_days;
        if per_carrier > 0 {
            per_carrier
        } else {
            self.auto_update.cutoff_days
        }
    }

    /// Whether the scheduler includes this carrier at all.
    ///
    /// USPS is always swept when auto-update is on globally; UPS, FedEx and
    /// DHL have dedicated gates.
    pub fn carrier_auto_update_enabled(&self, carrier: Carrier) -> bool {
        match carrier {
            Carrier::Usps => true,
            other => self.carriers.get(other).auto_update_enabled,
        }
    }
}

fn carrier_from_env(prefix: &str, auto_update_default: bool) -> Result<CarrierConfig> {
    Ok(CarrierConfig {
        api_key: env_opt(&format!("{prefix}_API_KEY")),
        client_id: env_opt(&format!("{prefix}_CLIENT_ID")),
        client_secret: env_opt(&format!("{prefix}_CLIENT_SECRET")),
        api_url: env_opt(&format!("{prefix}_API_URL")),
        auto_update_enabled: env_bool(&format!("{prefix}_AUTO_UPDATE_ENABLED"), auto_update_default),
        auto_update_cutoff_days: env_parse(&format!("{prefix}_AUTO_UPDATE_CUTOFF_DAYS"), 0)?,
    })
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| CoreError::Config(format!("invalid value for {key}: {v}"))),
        Err(_) => Ok(default),
    }
}
