//! Startup and shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bookingprocessor_infra::config::{BrokerKind, ConsumerConfig};
use bookingprocessor_infra::consumer::{ConsumerPool, PoolReport};
use bookingprocessor_infra::db;
use bookingprocessor_infra::queue::{AmqpQueue, Broker, RedisStreamsQueue};
use bookingprocessor_infra::registration::PgRegistrar;
use bookingprocessor_observability::ConsumerMetrics;

use crate::{http, shutdown};

/// Connect to the broker named by the queue url and check the queue is usable.
async fn open_broker(config: &ConsumerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    match config.broker {
        BrokerKind::Amqp => {
            let queue = AmqpQueue::connect(&config.queue_url, &config.queue_name)
                .await
                .context("failed to connect to amqp broker")?;
            queue
                .ensure_queue()
                .await
                .context("queue is not available")?;
            Ok(Arc::new(queue))
        }
        BrokerKind::Redis => {
            let queue = RedisStreamsQueue::new(&config.queue_url, &config.queue_name)
                .context("invalid queue url")?;
            queue
                .ensure_consumer_group()
                .await
                .context("failed to declare consumer group")?;
            if let Err(e) = queue.prune_idle_consumers().await {
                warn!(error = %e, "failed to prune idle stream consumers");
            }
            Ok(Arc::new(queue))
        }
    }
}

/// Run the consumer until SIGTERM/Ctrl-C or until every worker has stopped.
pub async fn run(config: ConsumerConfig) -> anyhow::Result<PoolReport> {
    let per_pod = config.connections_per_pod();
    info!(
        queue = %config.queue_name,
        broker = ?config.broker,
        workers = config.worker_count(),
        max_batch_size = config.max_batch_size,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "starting booking processor"
    );

    let pool = db::connect(&config.database_url, per_pod)
        .await
        .context("failed to connect to postgres")?;
    let registrar = Arc::new(PgRegistrar::new(pool));

    let queue = open_broker(&config).await?;

    let metrics = Arc::new(ConsumerMetrics::new().context("failed to register metrics")?);

    let stop = CancellationToken::new();
    let server = tokio::spawn(serve_metrics(
        config.metrics_addr,
        Arc::clone(&metrics),
        stop.clone(),
    ));

    let handle =
        ConsumerPool::new(queue, registrar, Arc::clone(&metrics), config.pool_config()).start();
    let pool_token = handle.shutdown_token();

    // Workers all failing to start ends the pool without a signal.
    let signals = tokio::spawn(shutdown::cancel_on_signal(pool_token));
    let report = handle.join().await;
    signals.abort();

    stop.cancel();
    if let Err(e) = server.await {
        warn!(error = %e, "metrics server task failed");
    }

    let snapshot = metrics.snapshot();
    info!(
        processed = snapshot.processed,
        requeued = snapshot.requeued,
        dropped = snapshot.dropped,
        dead_lettered = snapshot.dead_lettered,
        settle_failures = snapshot.settle_failures,
        "booking processor stopped"
    );

    if report.workers.is_empty() {
        anyhow::bail!("no worker could open a delivery channel");
    }
    Ok(report)
}

async fn serve_metrics(addr: SocketAddr, metrics: Arc<ConsumerMetrics>, stop: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind metrics endpoint");
            return;
        }
    };
    info!(%addr, "serving metrics");

    let app = http::router(metrics);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
    {
        error!(error = %e, "metrics endpoint failed");
    }
}
