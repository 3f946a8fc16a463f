use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use meter_sink::admin::{admin_routes, serve, with_metrics};
use meter_sink::config::Config;
use meter_sink::health::HealthRegistry;
use meter_sink::service::SinkService;

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_layer = if json {
        fmt::layer().json().with_filter(filter).boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router = with_metrics(admin_routes(liveness))
        .context("Failed to install the prometheus recorder")?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("admin server stopped: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!(
        group = %config.kafka_consumer_group,
        pattern = %config.namespace_topic_regexp,
        clickhouse = %config.clickhouse_url,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started admin server on {}", config.bind_address());

    let service =
        SinkService::new(config, liveness).context("Failed to create meter sink service")?;
    let result = service.run().await;

    server_handle.abort();
    result
}
