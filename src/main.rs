//! Gateway process: wires the components together, serves HTTP/WebSocket
//! traffic, and supervises the background tasks.
//!
//! Boot order follows the dependency chain (ledger, hub, producer,
//! dispatcher, router, consumer, HTTP); shutdown drains the same chain in
//! reverse once a termination signal lands. Exit code is 0 on a clean
//! shutdown and 1 when startup fails.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use velivolant_gateway::auth::JwtVerifier;
use velivolant_gateway::config::GatewayConfig;
use velivolant_gateway::consumer::ResultConsumer;
use velivolant_gateway::dispatcher::Dispatcher;
use velivolant_gateway::http::{self, AppState};
use velivolant_gateway::hub::Hub;
use velivolant_gateway::ledger::ResultLedger;
use velivolant_gateway::producer::RequestProducer;
use velivolant_gateway::registry::SchemaRegistry;
use velivolant_gateway::router::ResultRouter;
use velivolant_gateway::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    match run().await {
        Ok(()) => {
            info!("Gateway shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load()?;

    let ledger = ResultLedger::connect(&config.postgres).await?;
    let hub = Arc::new(Hub::new(JwtVerifier::new(&config.auth.jwt_secret)));
    let registry = SchemaRegistry::new(&config.registry);
    let producer = Arc::new(RequestProducer::new(config.kafka.clone(), registry));
    let dispatcher = Arc::new(Dispatcher::new(producer));
    let router = Arc::new(ResultRouter::new(
        ledger.clone(),
        dispatcher.clone(),
        hub.clone(),
    ));

    let shutdown = ShutdownSignal::new();
    let consumer = ResultConsumer::new(config.kafka.clone(), router);
    let consumer_task = consumer.start(&shutdown)?;
    let maintenance_task = dispatcher.spawn_maintenance(&shutdown);
    let heartbeat_task = hub.spawn_heartbeat(&shutdown);

    let state = Arc::new(AppState {
        dispatcher,
        ledger,
        hub,
        verifier: JwtVerifier::new(&config.auth.jwt_secret),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Gateway listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, http::app(state))
        .with_graceful_shutdown(async move { serve_shutdown.listen().await })
        .await?;

    // Intake is closed; drain the rest in reverse dependency order. The
    // consumer finishes its in-flight record before exiting.
    info!("HTTP server stopped, draining background tasks");
    consumer_task.await?;
    maintenance_task.await?;
    heartbeat_task.await?;

    Ok(())
}
