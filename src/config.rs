use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const CONFIG_FILE: &str = "tracker_config.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub h02_listen: String,
    pub gt06_listen: String,
    /// Listener that picks the protocol from each connection's first bytes.
    #[serde(default)]
    pub auto_listen: Option<String>,
    pub db_path: String,
    pub trip: TripSettings,
    pub precision: Precision,
    pub gateway: GatewaySettings,
    /// Nominatim-compatible base URL; geocoding is off when unset.
    pub geocoder_url: Option<String>,
    pub replay: Option<ReplaySource>,
}

/// Thresholds driving trip segmentation.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct TripSettings {
    /// Silence between two samples above which the open trip is closed.
    pub max_gap_secs: i64,
    /// An interval counts as movement when either end is faster than this.
    pub movement_epsilon_kmh: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct Precision {
    pub speed_decimals: u32,
    pub coordinate_decimals: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct GatewaySettings {
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReplaySource {
    pub protocol: String,
    pub file: PathBuf,
}

impl Default for TripSettings {
    fn default() -> Self {
        TripSettings {
            max_gap_secs: 1800,
            movement_epsilon_kmh: 0.5,
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Precision {
            speed_decimals: 2,
            coordinate_decimals: 5,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            max_attempts: 5,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl GatewaySettings {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config::from_lookup(|key| env::var(key).ok()))
    }

    /// Build a config from any key/value source, falling back to defaults
    /// for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let trip = TripSettings::default();
        let precision = Precision::default();
        let gateway = GatewaySettings::default();

        let replay = match (lookup("REPLAY_PROTOCOL"), lookup("REPLAY_FILE")) {
            (Some(protocol), Some(file)) => Some(ReplaySource {
                protocol,
                file: PathBuf::from(file),
            }),
            _ => None,
        };

        Config {
            h02_listen: lookup("H02_LISTEN").unwrap_or_else(|| "0.0.0.0:5013".to_string()),
            gt06_listen: lookup("GT06_LISTEN").unwrap_or_else(|| "0.0.0.0:5023".to_string()),
            auto_listen: lookup("AUTO_LISTEN").filter(|addr| !addr.is_empty()),
            db_path: lookup("DB_PATH").unwrap_or_else(|| "./tracker.db".to_string()),
            trip: TripSettings {
                max_gap_secs: parse_or(&lookup, "TRIP_MAX_GAP_SECS", trip.max_gap_secs),
                movement_epsilon_kmh: parse_or(
                    &lookup,
                    "TRIP_MOVEMENT_EPSILON_KMH",
                    trip.movement_epsilon_kmh,
                ),
            },
            precision: Precision {
                speed_decimals: parse_or(&lookup, "SPEED_DECIMALS", precision.speed_decimals),
                coordinate_decimals: parse_or(
                    &lookup,
                    "COORDINATE_DECIMALS",
                    precision.coordinate_decimals,
                ),
            },
            gateway: GatewaySettings {
                max_attempts: parse_or(&lookup, "GATEWAY_MAX_ATTEMPTS", gateway.max_attempts).max(1),
                backoff_initial_ms: parse_or(&lookup, "GATEWAY_BACKOFF_MS", gateway.backoff_initial_ms),
                backoff_max_ms: parse_or(&lookup, "GATEWAY_BACKOFF_MAX_MS", gateway.backoff_max_ms),
            },
            geocoder_url: lookup("GEOCODER_URL").filter(|url| !url.is_empty()),
            replay,
        }
    }

    /// Configuration for the binary: `$CONFIG_DIR/tracker_config.json` when
    /// that file exists, the environment otherwise.
    pub fn load() -> Result<Self> {
        match env::var("CONFIG_DIR") {
            Ok(dir) => Self::load_or_env(&Self::file_in(dir)),
            Err(_) => Self::from_env(),
        }
    }

    fn load_or_env(path: &Path) -> Result<Self> {
        if path.exists() {
            info!(file = %path.display(), "Loading configuration file");
            Self::load_from_file(path)
        } else {
            Self::from_env()
        }
    }

    pub fn file_in(dir: impl Into<PathBuf>) -> PathBuf {
        dir.into().join(CONFIG_FILE)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
