use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_lifecycle::config::{BackendArgs, ChannelBackend, Cli, Command, PlaceOrderArgs, Role, RunArgs, StoreBackend};
use order_lifecycle::domain::order::EventKind;
use order_lifecycle::lifecycle::{
    ExpirationSweeper, LifecycleNotifier, LifecycleProcessor, OrderIntake, RandomSettlement,
};
use order_lifecycle::messaging::{EventChannel, EventHandler, InMemoryChannel, RedpandaChannel};
use order_lifecycle::metrics::{self, LifecycleMetrics};
use order_lifecycle::runtime::{HealthRegistry, Supervisor};
use order_lifecycle::store::{InMemoryNotificationLog, InMemoryOrderStore, NotificationLog, OrderStore, PgStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    match cli.command {
        Command::Migrate => migrate(&cli.backends).await,
        Command::Run(args) => run(&cli.backends, args).await,
        Command::PlaceOrder(args) => place_order(&cli.backends, args).await,
    }
}

struct Backends {
    store: Arc<dyn OrderStore>,
    notifications: Arc<dyn NotificationLog>,
    channel: Arc<dyn EventChannel>,
}

async fn connect(args: &BackendArgs, metrics: Arc<LifecycleMetrics>) -> anyhow::Result<Backends> {
    let (store, notifications): (Arc<dyn OrderStore>, Arc<dyn NotificationLog>) = match args.store {
        StoreBackend::Postgres => {
            let pg = Arc::new(PgStore::connect(args.database_url()?, args.max_connections).await?);
            let store: Arc<dyn OrderStore> = pg.clone();
            let notifications: Arc<dyn NotificationLog> = pg;
            (store, notifications)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory order store, state is lost on exit");
            let store: Arc<dyn OrderStore> = Arc::new(InMemoryOrderStore::new());
            let notifications: Arc<dyn NotificationLog> = Arc::new(InMemoryNotificationLog::new());
            (store, notifications)
        }
    };

    let policy = args.delivery_policy()?;
    let channel: Arc<dyn EventChannel> = match args.channel {
        ChannelBackend::Redpanda => Arc::new(RedpandaChannel::new(args.redpanda(), policy, metrics)?),
        ChannelBackend::Memory => {
            tracing::warn!("Using in-process event channel, events stay inside this process");
            Arc::new(InMemoryChannel::new(policy, metrics))
        }
    };

    Ok(Backends {
        store,
        notifications,
        channel,
    })
}

async fn migrate(args: &BackendArgs) -> anyhow::Result<()> {
    if args.store == StoreBackend::Memory {
        tracing::info!("In-memory store selected, nothing to migrate");
        return Ok(());
    }

    let store = PgStore::connect(args.database_url()?, 1).await?;
    store.migrate().await?;
    Ok(())
}

async fn place_order(backends: &BackendArgs, args: PlaceOrderArgs) -> anyhow::Result<()> {
    let metrics = Arc::new(LifecycleMetrics::new()?);
    let Backends { store, channel, .. } = connect(backends, metrics).await?;

    let order = OrderIntake::new(store, channel)
        .place_order(args.user, args.lines)
        .await?;

    println!("{}", serde_json::to_string_pretty(&order)?);
    Ok(())
}

async fn run(backends: &BackendArgs, args: RunArgs) -> anyhow::Result<()> {
    let settlement = args.settlement()?;
    let sweeper_config = args.sweeper()?;
    let health_interval = args.health_check_interval()?;

    tracing::info!(role = ?args.role, "Starting order lifecycle service");

    let metrics = Arc::new(LifecycleMetrics::new()?);
    tracing::info!(
        "Metrics registry created with {} metrics",
        metrics.registry().gather().len()
    );
    let health = Arc::new(HealthRegistry::new());

    // Metrics HTTP server gets its own thread and actix system
    let registry = metrics.registry().clone();
    let server_health = health.clone();
    let port = args.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(registry, server_health, port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let Backends {
        store,
        notifications,
        channel,
    } = connect(backends, metrics.clone()).await?;

    if backends.channel == ChannelBackend::Memory && args.role != Role::All {
        tracing::warn!(role = ?args.role, "In-process channel only reaches roles running in this process");
    }

    let mut supervisor = Supervisor::new(health.clone());

    if args.role.includes(Role::Processor) {
        let processor = Arc::new(LifecycleProcessor::new(
            store.clone(),
            channel.clone(),
            Arc::new(RandomSettlement::from_config(&settlement)),
            settlement.delay,
            metrics.clone(),
            supervisor.shutdown(),
        ));
        spawn_subscription(&mut supervisor, "processor", channel.clone(), EventKind::Created, processor);
    }

    if args.role.includes(Role::Sweeper) {
        let sweeper = ExpirationSweeper::new(
            store.clone(),
            channel.clone(),
            sweeper_config.clone(),
            metrics.clone(),
            health.clone(),
        );
        let shutdown = supervisor.shutdown();
        supervisor.spawn("sweeper", async move { sweeper.run(shutdown).await });
    }

    if args.role.includes(Role::Notifier) {
        let notifier: Arc<dyn EventHandler> = Arc::new(LifecycleNotifier::new(
            notifications.clone(),
            sweeper_config.timeout_minutes(),
        ));
        for kind in [EventKind::Completed, EventKind::Expired] {
            let name = format!("notifier.{}", kind.topic_suffix());
            spawn_subscription(&mut supervisor, &name, channel.clone(), kind, notifier.clone());
        }
    }

    supervisor.spawn_health_monitor(channel.clone(), health_interval);

    tracing::info!("All roles started, press Ctrl-C to stop");
    supervisor.run_until_ctrl_c(SHUTDOWN_GRACE).await;

    tracing::info!("Order lifecycle service stopped");
    Ok(())
}

fn spawn_subscription(
    supervisor: &mut Supervisor,
    name: &str,
    channel: Arc<dyn EventChannel>,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
) {
    let shutdown = supervisor.shutdown();
    let task = name.to_string();
    supervisor.spawn(name, async move {
        if let Err(e) = channel.subscribe(kind, handler, shutdown).await {
            tracing::error!(task = %task, error = %e, "Subscription failed");
        }
    });
}
