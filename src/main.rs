use anyhow::Context;
use clap::Parser;
use pg_relay::kafka::{DryRunProducer, HashPartitioner, KafkaProducer, Producer};
use pg_relay::postgres::{EventQueue, NotificationListener, PgEventQueue};
use pg_relay::{Config, RelaySettings, Replicator, WakeSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-relay")]
#[command(about = "Relays the PostgreSQL outbound event queue to Kafka", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", env = "PG_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Log intended publishes instead of sending them")]
    dry_run: bool,

    #[arg(long, help = "Provision the event queue schema and triggers before starting")]
    setup: bool,

    #[arg(long, value_name = "DIR", help = "Directory holding migrations.sql and triggers.sql")]
    sql_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-relay");

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    config.relay.dry_run |= args.dry_run;
    config.relay.setup |= args.setup;
    if let Some(dir) = args.sql_dir {
        config.relay.sql_dir = dir;
    }

    info!(
        postgres_url_set = config.postgres.url.is_some(),
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        queue_table = %config.postgres.queue_table,
        kafka_brokers = ?config.kafka.brokers,
        topic_namespace = %config.topic_namespace(),
        dry_run = config.relay.dry_run,
        "Configuration summary"
    );

    if let Err(e) = run(config).await {
        error!("Relay stopped: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let pg_config = config.postgres_connection()?;

    let queue = PgEventQueue::connect(&pg_config, &config.postgres.queue_table)
        .await
        .context("connecting to the event queue")?;
    if config.relay.setup {
        queue
            .provision(&config.relay.sql_dir)
            .await
            .context("provisioning the event queue")?;
    }

    // LISTEN before the first drain so nothing queued in between is missed.
    let (listener, notifications) =
        NotificationListener::connect(&pg_config, &config.postgres.notify_channel)
            .await
            .context("starting the notification listener")?;

    let kafka = Arc::new(KafkaProducer::new(&config.kafka).context("creating the Kafka producer")?);
    let producer: Arc<dyn Producer> = if config.relay.dry_run {
        warn!("Dry run enabled, events will be logged and left unprocessed");
        Arc::new(DryRunProducer) as Arc<dyn Producer>
    } else {
        kafka.clone() as Arc<dyn Producer>
    };
    let partitioner = HashPartitioner::with_timeout(kafka, config.metadata_timeout());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let wake = WakeSource::new(
        notifications,
        listener.pinger(),
        config.keepalive_interval(),
        shutdown,
    );

    let queue = Arc::new(queue);
    let mut replicator = Replicator::new(
        RelaySettings::from_config(&config),
        queue.clone() as Arc<dyn EventQueue>,
        producer,
        partitioner,
    );

    let result = replicator.run(wake).await;
    listener.close();
    drop(replicator);
    if let Ok(queue) = Arc::try_unwrap(queue) {
        queue.close().await?;
    }

    let stats = result?;
    info!(
        events_published = stats.events_published,
        drains = stats.drains,
        "Shutdown complete"
    );
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Shutdown signal received, finishing current page");
    shutdown.cancel();
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
