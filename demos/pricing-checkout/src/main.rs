//! Pricing & Checkout Demo
//!
//! Two scenarios against in-process services:
//!
//! 1. A pricing service that fails its first calls. The circuit opens,
//!    further calls fast-fail, and after the reset timeout two trial calls
//!    close it again.
//! 2. A checkout saga (reserve → charge → ship) whose shipping step fails.
//!    Payment is refunded and inventory released, in that order, and every
//!    step is published to the `sagas` topic.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info cargo run -p pricing-checkout
//! ```
//!
//! Every `MESH_*` variable understood by `MeshConfig::from_env` applies; the
//! demo shortens the reset timeout to 2s unless `MESH_RESET_TIMEOUT_SECS` is set.

#![allow(missing_docs)]

use futures::StreamExt;
use guarded_mesh_core::{Broker, Metadata, ServiceCall, SystemClock, TransportError};
use guarded_mesh_runtime::{InProcessTransport, Mesh, MeshConfig, MetricsServer, Saga, Step};
use serde_json::{Value, json};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRICING: &str = "pricing-service";
const PRICING_OUTAGE_CALLS: usize = 5;

fn demo_default(key: &str) -> Option<String> {
    match key {
        "MESH_RESET_TIMEOUT_SECS" => Some("2".to_string()),
        "MESH_CALL_TIMEOUT_MS" => Some("500".to_string()),
        _ => None,
    }
}

fn services() -> InProcessTransport {
    let transport = InProcessTransport::new();

    let calls = Arc::new(AtomicUsize::new(0));
    transport.handle(PRICING, "quote", move |params: Value| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < PRICING_OUTAGE_CALLS {
                return Err(TransportError::Remote("pricing database unavailable".to_string()));
            }
            Ok(json!({ "sku": params["sku"], "price_cents": 1999 }))
        }
    });

    transport.handle("inventory", "reserve", |params: Value| async move {
        Ok(json!({ "reservation": "r-42", "sku": params["sku"], "qty": params["qty"] }))
    });
    transport.handle("inventory", "release", |params: Value| async move {
        Ok(json!({ "released": params["reservation"] }))
    });
    transport.handle("payments", "charge", |_| async { Ok(json!({ "charge_id": "ch-7" })) });
    transport.handle("payments", "refund", |params: Value| async move {
        Ok(json!({ "refunded": params["charge_id"] }))
    });
    transport.handle("shipping", "create", |_| async {
        Err(TransportError::Unreachable {
            address: "carrier.example:443".to_string(),
            reason: "connection refused".to_string(),
        })
    });

    transport
}

async fn pricing_scenario(mesh: &Mesh) {
    tracing::info!("--- Scenario 1: pricing outage ---");
    let client = mesh.client();
    let breaker = mesh.breaker();

    for attempt in 1..=PRICING_OUTAGE_CALLS + 2 {
        match client.call(PRICING, "quote", json!({ "sku": "A-1" })).await {
            Ok(quote) => tracing::info!(attempt, %quote, "Quote received"),
            Err(error) => tracing::info!(
                attempt,
                %error,
                fast_fail = error.is_fast_fail(),
                state = %breaker.state(PRICING),
                "Quote failed"
            ),
        }
    }

    let wait = mesh.config().breaker.reset_timeout;
    tracing::info!(wait_secs = wait.as_secs_f64(), "Waiting for reset timeout");
    tokio::time::sleep(wait).await;

    for attempt in 1..=2 {
        match client.call(PRICING, "quote", json!({ "sku": "A-1" })).await {
            Ok(quote) => tracing::info!(
                attempt,
                %quote,
                state = %breaker.state(PRICING),
                "Trial call succeeded"
            ),
            Err(error) => tracing::warn!(attempt, %error, "Trial call failed"),
        }
    }

    let stats = breaker.statistics(PRICING);
    tracing::info!(
        state = %stats.state,
        successes = stats.total_successes,
        failures = stats.total_failures,
        rejections = stats.total_rejections,
        failure_rate = stats.failure_rate,
        "Pricing circuit statistics"
    );
}

async fn checkout_scenario(mesh: &Mesh) {
    tracing::info!("--- Scenario 2: checkout saga ---");

    let saga = Saga::new("checkout")
        .step(
            Step::new(
                "reserve",
                ServiceCall::new("inventory", "reserve", json!({ "sku": "A-1", "qty": 2 })),
            )
            .compensate_from(|reservation| {
                ServiceCall::new("inventory", "release", reservation.clone())
            }),
        )
        .step(
            Step::new("charge", ServiceCall::new("payments", "charge", json!({ "cents": 3998 })))
                .compensate_from(|charge| ServiceCall::new("payments", "refund", charge.clone())),
        )
        .step(Step::new(
            "ship",
            ServiceCall::new("shipping", "create", json!({ "sku": "A-1" })),
        ));

    match mesh.orchestrator("sagas").execute(&saga).await {
        Ok(outcome) => tracing::info!(steps = outcome.results.len(), "Checkout completed"),
        Err(error) => {
            tracing::warn!(%error, "Checkout failed");
            for compensation in error.compensations() {
                tracing::info!(
                    step = %compensation.step_name,
                    succeeded = compensation.succeeded(),
                    "Compensation"
                );
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,guarded_mesh_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config =
        MeshConfig::from_lookup(|key| env::var(key).ok().or_else(|| demo_default(key)));

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start()?;
    }

    let mesh = Mesh::new(config, Arc::new(services()), Arc::new(SystemClock))?;
    for service in [PRICING, "inventory", "payments", "shipping"] {
        mesh.registry()
            .register(service, "in-process", Metadata::new())
            .await;
    }
    let heartbeat = mesh.spawn_heartbeat_monitor();

    let mut progress = mesh.broker().subscribe(&["sagas"]).await?;
    let listener = tokio::spawn(async move {
        while let Some(message) = progress.next().await {
            match message {
                Ok(message) => tracing::info!(kind = %message.kind, payload = %message.payload, "Saga progress"),
                Err(error) => tracing::warn!(%error, "Saga progress stream error"),
            }
        }
    });

    pricing_scenario(&mesh).await;
    checkout_scenario(&mesh).await;

    // Let the listener drain before exiting
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    listener.abort();
    heartbeat.abort();

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        println!("{rendered}");
    }

    Ok(())
}
