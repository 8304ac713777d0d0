//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Credentials are referenced by env-var name in the config and resolved
//! at runtime via `std::env::var`, so the file itself never holds secrets.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::{Credentials, LendError};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub bidding: BiddingConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Endpoints, transport limits and credential sources for the marketplace.
#[derive(Debug, Deserialize, Clone)]
pub struct MarketplaceConfig {
    /// Origin of the server-rendered site (login, 2FA, dashboard).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Root of the JSON API (listings, bidding).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: f64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_two_factor_path")]
    pub two_factor_path: String,
    #[serde(default = "default_landing_path")]
    pub landing_path: String,
    #[serde(default = "default_account_api_path")]
    pub account_api_path: String,
    #[serde(default = "default_email_env")]
    pub email_env: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_totp_secret_env")]
    pub totp_secret_env: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HarvestConfig {
    /// Records requested per listing page.
    pub page_size: u32,
    pub default_max_pages: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BiddingConfig {
    /// Lower bound for a recommended bid, in whole currency units.
    pub min_bid_floor: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_concurrent_jobs: usize,
    pub max_jobs: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_base_url() -> String {
    "https://www.kameo.se".into()
}
fn default_api_base_url() -> String {
    "https://api.kameo.se/v1".into()
}
fn default_connect_timeout_secs() -> f64 {
    5.0
}
fn default_read_timeout_secs() -> f64 {
    10.0
}
fn default_max_redirects() -> usize {
    5
}
fn default_user_agent() -> String {
    "LENDBOT/0.1.0 (loan-harvester)".into()
}
fn default_login_path() -> String {
    "/user/login".into()
}
fn default_two_factor_path() -> String {
    "/auth/2fa".into()
}
fn default_landing_path() -> String {
    "/investor/dashboard".into()
}
fn default_account_api_path() -> String {
    "/ezjscore/call/kameo_transfer::init".into()
}
fn default_email_env() -> String {
    "LENDBOT_EMAIL".into()
}
fn default_password_env() -> String {
    "LENDBOT_PASSWORD".into()
}
fn default_totp_secret_env() -> String {
    "LENDBOT_TOTP_SECRET".into()
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_base_url: default_api_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            login_path: default_login_path(),
            two_factor_path: default_two_factor_path(),
            landing_path: default_landing_path(),
            account_api_path: default_account_api_path(),
            email_env: default_email_env(),
            password_env: default_password_env(),
            totp_secret_env: default_totp_secret_env(),
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size: 12,
            default_max_pages: 10,
        }
    }
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self { min_bid_floor: 500 }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            cleanup_interval_secs: 3600,
            max_concurrent_jobs: 4,
            max_jobs: 1000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

impl MarketplaceConfig {
    /// Configuration pointing both site and API at one origin (mock servers).
    pub fn for_origin(origin: &str) -> Self {
        Self {
            base_url: origin.trim_end_matches('/').to_string(),
            api_base_url: origin.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Join a site-relative path onto `base_url`.
    pub fn site_url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Join an API-relative path onto `api_base_url`.
    pub fn api_url(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    pub fn connect_timeout(&self) -> Duration {
        timeout_from_secs(self.connect_timeout_secs, default_connect_timeout_secs())
    }

    pub fn read_timeout(&self) -> Duration {
        timeout_from_secs(self.read_timeout_secs, default_read_timeout_secs())
    }

    fn validate(&self) -> Result<(), LendError> {
        check_timeout("connect_timeout_secs", self.connect_timeout_secs)?;
        check_timeout("read_timeout_secs", self.read_timeout_secs)
    }

    /// Resolve credentials from the configured environment variables.
    ///
    /// Missing or malformed values are a [`LendError::Configuration`] and
    /// must abort startup before any network call.
    pub fn credentials_from_env(&self) -> Result<Credentials, LendError> {
        let email = AppConfig::resolve_env(&self.email_env)
            .map_err(|e| LendError::Configuration(e.to_string()))?;
        let password = AppConfig::resolve_env(&self.password_env)
            .map_err(|e| LendError::Configuration(e.to_string()))?;
        let totp_secret = std::env::var(&self.totp_secret_env).ok();
        Credentials::new(email, password, totp_secret)
    }
}

impl JobsConfig {
    /// Retention window, clamped to [`MAX_RETENTION_SECS`].
    pub fn retention(&self) -> chrono::Duration {
        let secs = i64::try_from(self.retention_secs.min(MAX_RETENTION_SECS)).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.clamp(1, MAX_RETENTION_SECS))
    }

    fn validate(&self) -> Result<(), LendError> {
        for (name, value) in [
            ("retention_secs", self.retention_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
        ] {
            if value > MAX_RETENTION_SECS {
                return Err(LendError::Configuration(format!(
                    "jobs.{name} = {value} exceeds the maximum of {MAX_RETENTION_SECS}"
                )));
            }
        }
        Ok(())
    }
}

/// Longest accepted connect/read timeout.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;

/// Longest accepted job retention or cleanup interval (ten years).
pub const MAX_RETENTION_SECS: u64 = 10 * 366 * 24 * 3600;

fn check_timeout(name: &str, secs: f64) -> Result<(), LendError> {
    if secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS {
        Ok(())
    } else {
        Err(LendError::Configuration(format!(
            "marketplace.{name} = {secs} must be within (0, {MAX_TIMEOUT_SECS}]"
        )))
    }
}

/// Out-of-range values fall back to `default` rather than panicking.
fn timeout_from_secs(secs: f64, default: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs.min(MAX_TIMEOUT_SECS))
    } else {
        Duration::from_secs_f64(default)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from a TOML string and check value ranges.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would overflow timers or clocks later on.
    pub fn validate(&self) -> Result<(), LendError> {
        self.marketplace.validate()?;
        self.jobs.validate()
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = AppConfig::from_toml("[marketplace]\n").unwrap();
        assert_eq!(cfg.marketplace.base_url, "https://www.kameo.se");
        assert_eq!(cfg.marketplace.max_redirects, 5);
        assert_eq!(cfg.harvest.page_size, 12);
        assert_eq!(cfg.bidding.min_bid_floor, 500);
        assert_eq!(cfg.jobs.retention_secs, 3600);
        assert!(cfg.api.enabled);
    }

    #[test]
    fn test_overrides() {
        let cfg = AppConfig::from_toml(
            r#"
            [marketplace]
            base_url = "https://example.test"
            connect_timeout_secs = 2.5
            [harvest]
            page_size = 50
            default_max_pages = 3
            [jobs]
            retention_secs = 60
            cleanup_interval_secs = 10
            max_concurrent_jobs = 2
            max_jobs = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.marketplace.base_url, "https://example.test");
        assert_eq!(cfg.marketplace.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.harvest.page_size, 50);
        assert_eq!(cfg.jobs.max_jobs, 10);
        assert_eq!(cfg.jobs.retention(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_url_joining() {
        let cfg = MarketplaceConfig::for_origin("http://127.0.0.1:9000/");
        assert_eq!(cfg.site_url("/user/login"), "http://127.0.0.1:9000/user/login");
        assert_eq!(cfg.api_url("loans"), "http://127.0.0.1:9000/loans");
        assert_eq!(cfg.site_url("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_missing_credentials_are_configuration_errors() {
        let cfg = MarketplaceConfig {
            email_env: "LENDBOT_TEST_UNSET_EMAIL_VAR".into(),
            ..MarketplaceConfig::default()
        };
        let err = cfg.credentials_from_env().unwrap_err();
        assert!(matches!(err, LendError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_values_are_configuration_errors() {
        for toml in [
            "[marketplace]\n[jobs]\nretention_secs = 10000000000000000\n",
            "[marketplace]\n[jobs]\ncleanup_interval_secs = 9223372036854775807\n",
            "[marketplace]\nread_timeout_secs = 1e300\n",
            "[marketplace]\nconnect_timeout_secs = nan\n",
            "[marketplace]\nconnect_timeout_secs = 0.0\n",
        ] {
            let err = AppConfig::from_toml(toml).unwrap_err();
            let lend = err.downcast_ref::<LendError>();
            assert!(
                matches!(lend, Some(LendError::Configuration(_))),
                "{toml:?} gave {err}"
            );
        }
    }

    #[test]
    fn test_accessors_never_panic_on_extreme_values() {
        let marketplace = MarketplaceConfig {
            connect_timeout_secs: 1e300,
            read_timeout_secs: f64::NAN,
            ..MarketplaceConfig::default()
        };
        assert_eq!(marketplace.connect_timeout(), Duration::from_secs(3600));
        assert_eq!(marketplace.read_timeout(), Duration::from_secs(10));

        let jobs = JobsConfig {
            retention_secs: u64::MAX,
            cleanup_interval_secs: u64::MAX,
            ..JobsConfig::default()
        };
        let max = i64::try_from(MAX_RETENTION_SECS).unwrap();
        assert_eq!(jobs.retention(), chrono::Duration::seconds(max));
        assert_eq!(jobs.cleanup_interval(), Duration::from_secs(MAX_RETENTION_SECS));
    }

    #[test]
    fn test_load_config_file() {
        // Requires config.toml in the working directory; absent is acceptable.
        if let Ok(cfg) = AppConfig::load("config.toml") {
            assert!(cfg.harvest.page_size > 0);
            assert!(cfg.jobs.max_concurrent_jobs > 0);
        }
    }
}
