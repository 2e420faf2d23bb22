//! Run the login anonymization pipeline once: poll the queue, mask every event, replace the table.
use std::path::Path;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use login_common::metrics::{setup_metrics_recorder, write_textfile};
use login_common::queue::{QueueConsumer, SqsQueueClient};
use login_common::record::RecordTransformer;
use login_common::sink::PgTableSink;
use login_worker::config::Config;
use login_worker::worker::RunOrchestrator;

fn setup_tracing(debug: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_layer = if debug {
        fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_filter(filter())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .json()
            .with_filter(filter())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("Invalid configuration")?;

    setup_tracing(config.debug);

    let metrics = match config.metrics_textfile {
        Some(_) => Some(setup_metrics_recorder().context("failed to install metrics recorder")?),
        None => None,
    };

    let queue = SqsQueueClient::from_env(
        &config.queue_url,
        &config.aws_region,
        config.sqs_endpoint_url.as_deref(),
    )
    .await;
    let sink = PgTableSink::new(
        config.table_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await
    .context("failed to connect to the store")?;

    info!(
        queue_url = queue.queue_url(),
        table = sink.table(),
        "starting run"
    );

    let consumer = QueueConsumer::new(&queue, config.receive_options());
    let orchestrator = RunOrchestrator::new(consumer, RecordTransformer::new(), &sink)
        .malformed_record_policy(config.malformed_record_policy)
        .acknowledge(config.acknowledge);

    let result = orchestrator.run().await;

    if let (Some(handle), Some(path)) = (&metrics, &config.metrics_textfile) {
        if let Err(error) = write_textfile(handle, Path::new(path)).await {
            warn!(?error, path = %path, "failed to write metrics textfile");
        }
    }

    result.context("run failed")?;

    Ok(())
}
