use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Ride-sharing real-time notification server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    name = "rideshare-server",
    version,
    about = "Ride-sharing real-time notification and presence server"
)]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RIDESHARE_PORT", default_value = "4000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RIDESHARE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./rideshare.toml")]
    pub config: String,

    /// Enable structured JSON logging
    #[arg(long, env = "RIDESHARE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the SQLite database and the shared JWT secret
    #[arg(long, env = "RIDESHARE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Seconds a ride request stays open for drivers
    #[arg(long, env = "RIDESHARE_RIDE_EXPIRY_SECS", default_value = "120")]
    pub ride_expiry_secs: u64,

    /// Seconds between presence counter resyncs
    #[arg(long, env = "RIDESHARE_PRESENCE_RESYNC_SECS", default_value = "30")]
    pub presence_resync_secs: u64,

    /// Delete notifications older than this many days (unset keeps them forever)
    #[arg(long, env = "RIDESHARE_NOTIFICATION_RETENTION_DAYS")]
    #[serde(default)]
    pub notification_retention_days: Option<u32>,

    /// Seconds between retention cleanup runs
    #[arg(long, env = "RIDESHARE_RETENTION_CLEANUP_INTERVAL_SECS", default_value = "3600")]
    pub retention_cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            bind_address: "0.0.0.0".to_string(),
            config: "./rideshare.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            ride_expiry_secs: 120,
            presence_resync_secs: 30,
            notification_retention_days: None,
            retention_cleanup_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RIDESHARE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RIDESHARE_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Ride-sharing notification server configuration
# Place this file at ./rideshare.toml or specify with --config <path>
# Every setting can be overridden via environment variables (RIDESHARE_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 4000)
# port = 4000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Structured JSON logging for production log shipping
# json_logs = false

# Data directory for the SQLite database and the JWT secret shared with
# the auth service
# data_dir = "./data"

# ---- Rides ----

# Seconds a ride request stays open before it expires (default: 120)
# ride_expiry_secs = 120

# ---- Presence ----

# Seconds between full presence resyncs (default: 30)
# presence_resync_secs = 30

# ---- Notification retention ----

# Delete notifications older than this many days. Unset keeps them forever.
# notification_retention_days = 90

# Seconds between retention cleanup runs (default: 3600 = 1 hour)
# retention_cleanup_interval_secs = 3600
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_as_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.ride_expiry_secs, 120);
        assert!(config.notification_retention_days.is_none());
    }
}
