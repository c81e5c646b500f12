use clap::{Args, Parser, Subcommand, ValueEnum};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::order::LineRequest;
use crate::lifecycle::{SettlementConfig, SweeperConfig};
use crate::messaging::{DeliveryPolicy, RedpandaConfig};
use crate::utils::RetryConfig;

// ============================================================================
// Configuration
// ============================================================================
//
// Everything comes from the command line, with an environment variable
// fallback for each setting. Values are checked once here so the rest of
// the crate can take them as given.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Success probability must be within [0, 1], got {0}")]
    InvalidProbability(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("DATABASE_URL is required for the postgres store")]
    MissingDatabaseUrl,
}

/// Order lifecycle service: settlement processor, expiration sweeper and
/// notifier over a shared order store.
#[derive(Parser, Debug)]
#[command(name = "order-lifecycle", author, version, about, long_about = None)]
pub struct Cli {
    /// Log filter (trace, debug, info, warn, error or a directive list).
    /// RUST_LOG takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info,order_lifecycle=debug")]
    pub log_level: String,

    #[command(flatten)]
    pub backends: BackendArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one or more lifecycle roles until interrupted
    Run(RunArgs),
    /// Apply the database schema
    Migrate,
    /// Place a single order and publish its Created event
    PlaceOrder(PlaceOrderArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ChannelBackend {
    Redpanda,
    Memory,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Processor,
    Sweeper,
    Notifier,
    All,
}

impl Role {
    pub fn includes(self, other: Role) -> bool {
        self == Role::All || self == other
    }
}

#[derive(Args, Debug)]
pub struct BackendArgs {
    /// Order store backend
    #[arg(long, env = "ORDER_STORE", value_enum, default_value_t = StoreBackend::Postgres)]
    pub store: StoreBackend,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Event channel backend
    #[arg(long, env = "EVENT_CHANNEL", value_enum, default_value_t = ChannelBackend::Redpanda)]
    pub channel: ChannelBackend,

    #[arg(long, env = "REDPANDA_BROKERS", default_value = "127.0.0.1:9092")]
    pub brokers: String,

    /// Base consumer group; each event kind gets its own group under it
    #[arg(long, env = "CONSUMER_GROUP", default_value = "order-lifecycle")]
    pub consumer_group: String,

    #[arg(long, env = "TOPIC_PREFIX", default_value = "orders")]
    pub topic_prefix: String,

    /// Handler attempts per message before it is dead-lettered
    #[arg(long, env = "MAX_DELIVERIES", default_value_t = 5)]
    pub max_deliveries: u32,
}

impl BackendArgs {
    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    pub fn delivery_policy(&self) -> Result<DeliveryPolicy, ConfigError> {
        if self.max_deliveries == 0 {
            return Err(ConfigError::Zero("max deliveries"));
        }

        let defaults = DeliveryPolicy::default();
        Ok(DeliveryPolicy {
            max_deliveries: self.max_deliveries,
            backoff: RetryConfig {
                max_attempts: self.max_deliveries,
                ..defaults.backoff
            },
        })
    }

    pub fn redpanda(&self) -> RedpandaConfig {
        RedpandaConfig {
            brokers: self.brokers.clone(),
            consumer_group: self.consumer_group.clone(),
            topic_prefix: self.topic_prefix.clone(),
            ..RedpandaConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, env = "LIFECYCLE_ROLE", value_enum, default_value_t = Role::All)]
    pub role: Role,

    /// Simulated settlement latency
    #[arg(long, env = "SETTLEMENT_DELAY_MS", default_value_t = 5_000)]
    pub settlement_delay_ms: u64,

    #[arg(long, env = "SETTLEMENT_SUCCESS_PROBABILITY", default_value_t = 0.5)]
    pub success_probability: f64,

    /// Seed for reproducible settlement decisions
    #[arg(long, env = "SETTLEMENT_SEED")]
    pub seed: Option<u64>,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// How long an order may sit in Processing before it expires
    #[arg(long, env = "EXPIRATION_TIMEOUT_SECS", default_value_t = 600)]
    pub expiration_timeout_secs: u64,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,
}

impl RunArgs {
    pub fn settlement(&self) -> Result<SettlementConfig, ConfigError> {
        if !(0.0..=1.0).contains(&self.success_probability) {
            return Err(ConfigError::InvalidProbability(self.success_probability));
        }

        Ok(SettlementConfig {
            delay: Duration::from_millis(self.settlement_delay_ms),
            success_probability: self.success_probability,
            seed: self.seed,
        })
    }

    pub fn sweeper(&self) -> Result<SweeperConfig, ConfigError> {
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Zero("sweep interval"));
        }
        if self.expiration_timeout_secs == 0 {
            return Err(ConfigError::Zero("expiration timeout"));
        }

        Ok(SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            timeout: Duration::from_secs(self.expiration_timeout_secs),
        })
    }

    pub fn health_check_interval(&self) -> Result<Duration, ConfigError> {
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Zero("health check interval"));
        }
        Ok(Duration::from_secs(self.health_check_interval_secs))
    }
}

#[derive(Args, Debug)]
pub struct PlaceOrderArgs {
    #[arg(long)]
    pub user: Uuid,

    /// Order line as <product-uuid>:<quantity>:<unit-price>; repeatable
    #[arg(long = "line", required = true)]
    pub lines: Vec<LineRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("order-lifecycle").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = parse(&["--store", "memory", "--channel", "memory", "run"]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };

        assert_eq!(run.role, Role::All);
        let settlement = run.settlement().unwrap();
        assert_eq!(settlement.delay, Duration::from_secs(5));
        assert_eq!(settlement.success_probability, 0.5);

        let sweeper = run.sweeper().unwrap();
        assert_eq!(sweeper.interval, Duration::from_secs(60));
        assert_eq!(sweeper.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_probability_out_of_range_is_rejected() {
        let cli = parse(&["run", "--success-probability", "1.5"]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };

        assert!(matches!(run.settlement(), Err(ConfigError::InvalidProbability(p)) if p == 1.5));
    }

    #[test]
    fn test_place_order_parses_lines() {
        let user = Uuid::new_v4();
        let product = Uuid::new_v4();
        let line = format!("{product}:2:50.00");
        let user_arg = user.to_string();

        let cli = parse(&["place-order", "--user", &user_arg, "--line", &line]);
        let Command::PlaceOrder(args) = cli.command else {
            panic!("expected place-order");
        };

        assert_eq!(args.user, user);
        assert_eq!(args.lines, vec![LineRequest::new(product, 2, Decimal::new(5000, 2))]);
    }

    #[test]
    fn test_role_includes() {
        assert!(Role::All.includes(Role::Sweeper));
        assert!(Role::Processor.includes(Role::Processor));
        assert!(!Role::Processor.includes(Role::Sweeper));
    }

    #[test]
    fn test_zero_max_deliveries_is_rejected() {
        let cli = parse(&["--max-deliveries", "0", "migrate"]);
        assert!(matches!(cli.backends.delivery_policy(), Err(ConfigError::Zero(_))));
    }
}
