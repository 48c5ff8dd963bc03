//! Command line, environment and config-file settings.
//!
//! Precedence is flag, then environment variable (both handled by clap),
//! then the optional TOML file, then the built-in default.

use clap::{Args, Parser, Subcommand};
use printsim_client::{BrokerConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT, QoS};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOPIC: &str = "printers/telemetry";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_IDENTITY: &str = "sim-printer-01";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
pub const DEFAULT_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_SEED: &str = "printer_iot_data.json";
pub const DEFAULT_FAILURE_ALERT_THRESHOLD: u32 = 5;
pub const DEFAULT_REPLAY_SPACING_MS: u64 = 300;

/// CONNECT carries keep-alive as a 16-bit number of seconds; 0 disables it.
const KEEP_ALIVE_SECS: RangeInclusive<u64> = 0..=u16::MAX as u64;
/// One day.
const INTERVAL_MS: RangeInclusive<u64> = 1..=86_400_000;
const TIMEOUT_SECS: RangeInclusive<u64> = 1..=3600;

#[derive(Debug, Default, Parser)]
#[command(name = "printsim", version, about = "Simulated printer publishing telemetry to AWS IoT Core")]
pub struct Cli {
    /// TOML file with broker and publish settings.
    #[arg(long, global = true, env = "PRINTSIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Broker hostname, without scheme or path.
    #[arg(long, global = true, env = "IOT_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, global = true, env = "IOT_PORT")]
    pub port: Option<u16>,

    #[arg(long, global = true, env = "IOT_TOPIC")]
    pub topic: Option<String>,

    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Client id prefix; a millisecond timestamp is appended per connection.
    #[arg(long, global = true, env = "AWS_IOT_IDENTITY")]
    pub identity: Option<String>,

    /// MQTT keep-alive in seconds. Zero disables pings.
    #[arg(long, global = true, env = "IOT_KEEP_ALIVE_SECS")]
    pub keep_alive_secs: Option<u64>,

    /// Seed document for the first snapshot.
    #[arg(long, global = true, env = "PRINTSIM_SEED")]
    pub seed: Option<PathBuf>,

    #[arg(long, global = true, env = "PRINTSIM_INTERVAL_MS")]
    pub interval_ms: Option<u64>,

    /// Log payloads instead of connecting to the broker.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish generated telemetry until interrupted (the default).
    Simulate,
    /// Publish every element of a JSON array file, in order.
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    pub file: PathBuf,

    /// Pause between consecutive publishes.
    #[arg(long, default_value_t = DEFAULT_REPLAY_SPACING_MS)]
    pub spacing_ms: u64,
}

/// Shape of the optional TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub publish: PublishSection,
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSection {
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    /// Plain `ws://` when false. Only useful against a local broker.
    pub tls: Option<bool>,
    pub region: Option<String>,
    pub identity: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub ack_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishSection {
    pub topic: Option<String>,
    pub interval_ms: Option<u64>,
    pub qos: Option<u8>,
    pub failure_alert_threshold: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no broker endpoint configured; pass --endpoint or set IOT_ENDPOINT")]
    MissingEndpoint,
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the publish loop behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSettings {
    pub topic: String,
    pub qos: QoS,
    pub interval: Duration,
    /// Consecutive failures before an alert is logged.
    pub failure_alert_threshold: u32,
}

/// Fully resolved settings, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub publish: PublishSettings,
    pub seed: PathBuf,
    pub dry_run: bool,
}

impl Config {
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let FileConfig {
            broker,
            publish,
            seed,
        } = file;

        let endpoint = cli
            .endpoint
            .clone()
            .or(broker.endpoint)
            .map(|endpoint| endpoint.trim().to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(ConfigError::MissingEndpoint)?;
        if endpoint.contains("://") || endpoint.contains('/') {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("expected a bare hostname, got {endpoint:?}"),
            });
        }

        let region = cli
            .region
            .clone()
            .or(broker.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let identity = cli
            .identity
            .clone()
            .or(broker.identity)
            .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
        let keep_alive_secs = bounded(
            "keep-alive seconds",
            cli.keep_alive_secs
                .or(broker.keep_alive_secs)
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            KEEP_ALIVE_SECS,
        )?;
        let connect_timeout = match broker.connect_timeout_secs {
            Some(secs) => Duration::from_secs(bounded("broker.connect_timeout_secs", secs, TIMEOUT_SECS)?),
            None => DEFAULT_CONNECT_TIMEOUT,
        };
        let ack_timeout = match broker.ack_timeout_secs {
            Some(secs) => Duration::from_secs(bounded("broker.ack_timeout_secs", secs, TIMEOUT_SECS)?),
            None => DEFAULT_ACK_TIMEOUT,
        };

        let broker = BrokerConfig {
            port: cli.port.or(broker.port).unwrap_or(DEFAULT_PORT),
            tls: broker.tls.unwrap_or(true),
            keep_alive: Duration::from_secs(keep_alive_secs),
            connect_timeout,
            ack_timeout,
            ..BrokerConfig::new(endpoint, region, identity)
        };

        let interval_ms = bounded(
            "interval",
            cli.interval_ms
                .or(publish.interval_ms)
                .unwrap_or(DEFAULT_INTERVAL_MS),
            INTERVAL_MS,
        )?;
        let qos = match publish.qos {
            Some(level) => QoS::try_from(level).map_err(|err| ConfigError::Invalid {
                field: "publish.qos",
                reason: err.to_string(),
            })?,
            None => QoS::AtLeastOnce,
        };

        Ok(Self {
            broker,
            publish: PublishSettings {
                topic: cli
                    .topic
                    .clone()
                    .or(publish.topic)
                    .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                qos,
                interval: Duration::from_millis(interval_ms),
                failure_alert_threshold: publish
                    .failure_alert_threshold
                    .unwrap_or(DEFAULT_FAILURE_ALERT_THRESHOLD),
            },
            seed: cli
                .seed
                .clone()
                .or(seed)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SEED)),
            dry_run: cli.dry_run,
        })
    }
}

fn bounded(field: &'static str, value: u64, range: RangeInclusive<u64>) -> Result<u64, ConfigError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is outside {}..={}", range.start(), range.end()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    fn cli_with_endpoint() -> Cli {
        Cli {
            endpoint: Some("a1b2c3-ats.iot.us-east-1.amazonaws.com".into()),
            ..Cli::default()
        }
    }

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply() {
        let config = Config::merge(&cli_with_endpoint(), FileConfig::default()).unwrap();
        assert_eq!(config.broker.url(), "wss://a1b2c3-ats.iot.us-east-1.amazonaws.com/mqtt");
        assert_eq!(config.broker.region, "us-east-1");
        assert_eq!(config.broker.client_id_prefix, "sim-printer-01");
        assert_eq!(config.broker.keep_alive, Duration::from_secs(30));
        assert_eq!(config.publish.topic, "printers/telemetry");
        assert_eq!(config.publish.qos, QoS::AtLeastOnce);
        assert_eq!(config.publish.interval, Duration::from_millis(3000));
        assert_eq!(config.publish.failure_alert_threshold, 5);
        assert_eq!(config.seed, PathBuf::from("printer_iot_data.json"));
        assert!(!config.dry_run);
    }

    #[test]
    fn flags_override_file() {
        let file: FileConfig = toml::from_str(
            r#"
            seed = "fixtures/seed.json"

            [broker]
            endpoint = "from-file.example.com"
            region = "eu-west-1"
            port = 8443

            [publish]
            topic = "file/topic"
            interval_ms = 500
            qos = 0
            "#,
        )
        .unwrap();
        let cli = Cli {
            topic: Some("cli/topic".into()),
            ..cli_with_endpoint()
        };

        let config = Config::merge(&cli, file).unwrap();
        assert_eq!(config.broker.endpoint, "a1b2c3-ats.iot.us-east-1.amazonaws.com");
        assert_eq!(config.broker.region, "eu-west-1");
        assert_eq!(config.broker.port, 8443);
        assert_eq!(config.publish.topic, "cli/topic");
        assert_eq!(config.publish.interval, Duration::from_millis(500));
        assert_eq!(config.publish.qos, QoS::AtMostOnce);
        assert_eq!(config.seed, PathBuf::from("fixtures/seed.json"));
    }

    #[test]
    fn file_is_loaded_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nendpoint = \"disk.example.com\"").unwrap();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };

        let config = Config::resolve(&cli).unwrap();
        assert_eq!(config.broker.endpoint, "disk.example.com");
    }

    #[test]
    fn missing_endpoint_is_reported() {
        let err = Config::merge(&Cli::default(), FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoint));
        assert!(err.to_string().contains("IOT_ENDPOINT"));

        let blank = Cli {
            endpoint: Some("  ".into()),
            ..Cli::default()
        };
        let err = Config::merge(&blank, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoint));
    }

    #[test]
    fn endpoint_must_be_a_hostname() {
        let cli = Cli {
            endpoint: Some("wss://host.example.com/mqtt".into()),
            ..Cli::default()
        };
        let err = Config::merge(&cli, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "endpoint", .. }));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cli = Cli {
            interval_ms: Some(0),
            ..cli_with_endpoint()
        };
        let err = Config::merge(&cli, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "interval", .. }));
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let cli = Cli {
            interval_ms: Some(u64::MAX),
            ..cli_with_endpoint()
        };
        let err = Config::merge(&cli, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "interval", .. }));

        let cli = Cli {
            interval_ms: Some(86_400_000),
            ..cli_with_endpoint()
        };
        let config = Config::merge(&cli, FileConfig::default()).unwrap();
        assert_eq!(config.publish.interval, Duration::from_secs(86_400));
    }

    #[test]
    fn keep_alive_must_fit_in_connect() {
        let cli = Cli {
            keep_alive_secs: Some(65_536),
            ..cli_with_endpoint()
        };
        let err = Config::merge(&cli, FileConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "keep-alive seconds",
                ..
            }
        ));

        let cli = Cli {
            keep_alive_secs: Some(65_535),
            ..cli_with_endpoint()
        };
        let config = Config::merge(&cli, FileConfig::default()).unwrap();
        assert_eq!(config.broker.keep_alive_secs(), 65_535);
        assert_eq!(config.broker.keep_alive, Duration::from_secs(65_535));

        let cli = Cli {
            keep_alive_secs: Some(0),
            ..cli_with_endpoint()
        };
        let config = Config::merge(&cli, FileConfig::default()).unwrap();
        assert!(config.broker.keep_alive.is_zero());
    }

    #[test]
    fn timeouts_are_bounded() {
        let file: FileConfig = toml::from_str("[broker]\nack_timeout_secs = 0\n").unwrap();
        let err = Config::merge(&cli_with_endpoint(), file).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "broker.ack_timeout_secs",
                ..
            }
        ));

        let file: FileConfig =
            toml::from_str("[broker]\nconnect_timeout_secs = 9223372036854775807\n").unwrap();
        let err = Config::merge(&cli_with_endpoint(), file).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "broker.connect_timeout_secs",
                ..
            }
        ));

        let file: FileConfig = toml::from_str("[broker]\nack_timeout_secs = 5\n").unwrap();
        let config = Config::merge(&cli_with_endpoint(), file).unwrap();
        assert_eq!(config.broker.ack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nendpont = \"typo.example.com\"").unwrap();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };
        assert!(matches!(
            Config::resolve(&cli).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn replay_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "printsim",
            "--dry-run",
            "replay",
            "observations.json",
            "--spacing-ms",
            "0",
        ])
        .unwrap();
        assert!(cli.dry_run);
        let Some(Command::Replay(args)) = cli.command else {
            panic!("expected replay");
        };
        assert_eq!(args.file, PathBuf::from("observations.json"));
        assert_eq!(args.spacing_ms, 0);
    }
}
