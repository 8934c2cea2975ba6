use std::{sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipyard::{config::ServiceConfig, context::ServiceContext};

const SERVICE_NAME: &str = "shipyard-reconciler";

/// Consumes events until the process stops. A failed event is not acknowledged, so the
/// stream hands it out again once its visibility timeout passes.
async fn run_worker(
    worker_id: usize,
    context: Arc<ServiceContext>,
    consumer_id: String,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    tracing::info!("reconciler worker {} starting", worker_id);

    loop {
        let events = context.event_stream.receive(&consumer_id).await?;

        for event in events.iter() {
            match context.reconciler.process(event).await {
                Ok(()) => {
                    context.event_stream.delete(event, &consumer_id).await?;
                }
                Err(err) => {
                    tracing::error!(
                        "worker {} failed to process event {} ({} {}): {:?}",
                        worker_id,
                        event.id,
                        event.model_type,
                        event.event_type.as_str(),
                        err
                    );
                }
            }
        }

        if events.is_empty() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(SERVICE_NAME)
        .install_simple()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let config = ServiceConfig::from_env()?;
    let context = Arc::new(ServiceContext::connect(&config).await?);

    tracing::info!(
        "reconciler: starting {} workers as consumer {}",
        config.worker_count,
        config.consumer_id
    );

    let workers: Vec<_> = (0..config.worker_count)
        .map(|worker_id| {
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&context),
                config.consumer_id.clone(),
                config.poll_interval,
            ))
        })
        .collect();

    for worker in workers {
        worker.await??;
    }

    Ok(())
}
