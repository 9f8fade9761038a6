use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_SEARCH_BASE_URL: &str = "https://www.google.com/maps/search/";
const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:9515";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub input_csv: PathBuf,
    pub output_csv: PathBuf,
    pub gazetteer_csv: Option<PathBuf>,
    pub columns: ColumnMap,
    pub search_base_url: String,
    pub pacing: PacingConfig,
    pub webdriver_url: String,
    pub navigation_settle_ms: u64,
    pub navigation_timeout_secs: Option<u64>,
    pub headless: bool,
}

/// Column names of the input universe.
#[derive(Clone, Debug, Serialize)]
pub struct ColumnMap {
    pub unique_id: String,
    pub target: String,
    pub fallback_target: String,
    pub address: String,
    pub locality: String,
    pub region: String,
    pub postal_code: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            unique_id: "id".into(),
            target: "url".into(),
            fallback_target: "url_fallback".into(),
            address: "Address".into(),
            locality: "city".into(),
            region: "state".into(),
            postal_code: "zip".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PacingConfig {
    pub request_delay_min_ms: u64,
    pub request_delay_max_ms: u64,
    pub cooldown_min_ms: u64,
    pub cooldown_max_ms: u64,
    pub write_settle_ms: u64,
    pub max_failure_rate: f64,
    pub min_sample_size: usize,
    pub max_consecutive_failures: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            request_delay_min_ms: 3_800,
            request_delay_max_ms: 8_000,
            cooldown_min_ms: 20_000,
            cooldown_max_ms: 30_000,
            write_settle_ms: 500,
            max_failure_rate: 15.0,
            min_sample_size: 35,
            max_consecutive_failures: 5,
        }
    }
}

impl PacingConfig {
    /// No pauses at all; breaker thresholds keep their defaults.
    pub fn immediate() -> Self {
        Self {
            request_delay_min_ms: 0,
            request_delay_max_ms: 0,
            cooldown_min_ms: 0,
            cooldown_max_ms: 0,
            write_settle_ms: 0,
            ..Self::default()
        }
    }

    pub fn write_settle(&self) -> Duration {
        Duration::from_millis(self.write_settle_ms)
    }
}

impl AppConfig {
    /// Defaults for everything except the two tables.
    pub fn new(input_csv: impl Into<PathBuf>, output_csv: impl Into<PathBuf>) -> Self {
        Self {
            input_csv: input_csv.into(),
            output_csv: output_csv.into(),
            gazetteer_csv: None,
            columns: ColumnMap::default(),
            search_base_url: DEFAULT_SEARCH_BASE_URL.to_string(),
            pacing: PacingConfig::default(),
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            navigation_settle_ms: 1_500,
            navigation_timeout_secs: None,
            headless: true,
        }
    }

    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = PacingConfig::default();
        let request_delay_min_ms = parse_u64("REQUEST_DELAY_MIN_MS", defaults.request_delay_min_ms);
        let cooldown_min_ms = parse_u64("COOLDOWN_MIN_MS", defaults.cooldown_min_ms);
        let column_defaults = ColumnMap::default();
        Self {
            input_csv: parse_path("INPUT_CSV")
                .unwrap_or_else(|| PathBuf::from("addresses_ready.csv")),
            output_csv: parse_path("OUTPUT_CSV")
                .unwrap_or_else(|| PathBuf::from("addresses_geocoded.csv")),
            gazetteer_csv: parse_path("GAZETTEER_CSV"),
            columns: ColumnMap {
                unique_id: parse_string("UNIQUE_ID_COLUMN", &column_defaults.unique_id),
                target: parse_string("TARGET_COLUMN", &column_defaults.target),
                fallback_target: parse_string("FALLBACK_COLUMN", &column_defaults.fallback_target),
                address: parse_string("ADDRESS_COLUMN", &column_defaults.address),
                locality: parse_string("LOCALITY_COLUMN", &column_defaults.locality),
                region: parse_string("REGION_COLUMN", &column_defaults.region),
                postal_code: parse_string("POSTAL_COLUMN", &column_defaults.postal_code),
            },
            search_base_url: parse_string("SEARCH_BASE_URL", DEFAULT_SEARCH_BASE_URL),
            pacing: PacingConfig {
                request_delay_min_ms,
                request_delay_max_ms: parse_u64(
                    "REQUEST_DELAY_MAX_MS",
                    defaults.request_delay_max_ms,
                )
                .max(request_delay_min_ms),
                cooldown_min_ms,
                cooldown_max_ms: parse_u64("COOLDOWN_MAX_MS", defaults.cooldown_max_ms)
                    .max(cooldown_min_ms),
                write_settle_ms: parse_u64("WRITE_SETTLE_MS", defaults.write_settle_ms),
                max_failure_rate: parse_f64("MAX_FAILURE_RATE", defaults.max_failure_rate),
                min_sample_size: parse_usize("MIN_SAMPLE_SIZE", defaults.min_sample_size).max(1),
                max_consecutive_failures: parse_usize(
                    "MAX_CONSECUTIVE_FAILURES",
                    defaults.max_consecutive_failures,
                )
                .max(1),
            },
            webdriver_url: parse_string("WEBDRIVER_URL", DEFAULT_WEBDRIVER_URL),
            navigation_settle_ms: parse_u64("NAVIGATION_SETTLE_MS", 1_500),
            navigation_timeout_secs: env::var("NAVIGATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0),
            headless: parse_bool("HEADLESS", true),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_overrides_and_clamps_ranges() {
        env::set_var("UNIQUE_ID_COLUMN", "parcel_id");
        env::set_var("GAZETTEER_CSV", "towns.csv");
        env::set_var("REQUEST_DELAY_MIN_MS", "9000");
        env::set_var("REQUEST_DELAY_MAX_MS", "100");
        env::set_var("MAX_FAILURE_RATE", "20.5");
        env::set_var("MIN_SAMPLE_SIZE", "0");
        env::set_var("NAVIGATION_TIMEOUT_SECS", "0");

        let config = AppConfig::from_env();

        assert_eq!(config.columns.unique_id, "parcel_id");
        assert_eq!(config.columns.target, "url");
        assert_eq!(config.gazetteer_csv, Some(PathBuf::from("towns.csv")));
        assert_eq!(config.pacing.request_delay_min_ms, 9_000);
        assert_eq!(config.pacing.request_delay_max_ms, 9_000);
        assert_eq!(config.pacing.max_failure_rate, 20.5);
        assert_eq!(config.pacing.min_sample_size, 1);
        assert_eq!(config.pacing.max_consecutive_failures, 5);
        assert_eq!(config.navigation_timeout_secs, None);
    }
}
