//! Consume partition streams with a bounded worker pool, logging every JSON record.
use axum::http::StatusCode;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use serde_json::Value;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use partition_supervisor::decode::JsonDecoder;
use partition_supervisor::kafka::KafkaConnector;
use partition_supervisor::{for_each_record, LifecycleState, Supervisor};

use crate::config::Config;
use crate::metrics::{add_metrics_route, serve};

mod config;
mod metrics;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

/// Liveness and readiness both follow the consumer: healthy only while it runs.
fn probe(state: LifecycleState) -> (StatusCode, String) {
    match state {
        LifecycleState::Running => (StatusCode::OK, state.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, state.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let handler = for_each_record(|topic: &str, record: Value| {
        debug!(topic, %record, "received record");
        ::metrics::counter!("partition_consumer_records_total", "topic" => topic.to_owned())
            .increment(1);
        Ok(())
    });

    let supervisor = Supervisor::new(
        config.client.clone(),
        KafkaConnector::new(),
        JsonDecoder::<Value>::new(),
        handler,
    );

    let liveness = supervisor.clone();
    let readiness = supervisor.clone();
    let mut router = Router::new()
        .route(
            "/_liveness",
            get(move || std::future::ready(probe(liveness.state()))),
        )
        .route(
            "/_readiness",
            get(move || std::future::ready(probe(readiness.state()))),
        );
    if config.export_prometheus {
        router = add_metrics_route(router)?;
    }

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve probes and metrics: {}", e);
        }
    });

    supervisor.start().await?;

    tokio::select! {
        _ = shutdown() => {},
        _ = supervisor.stopped() => warn!("consumer stopped after a failure"),
    };

    supervisor.stop().await;

    Ok(())
}
