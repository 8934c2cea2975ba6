use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shipyard::{config::ServiceConfig, context::ServiceContext, http::http_router};

const SERVICE_NAME: &str = "shipyard-api";

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

    let addr: SocketAddr = config.endpoint.parse()?;

    tracing::info!("http api listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(http_router(context).into_make_service())
        .await?;

    Ok(())
}
