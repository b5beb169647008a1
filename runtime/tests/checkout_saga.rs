//! Integration tests for saga orchestration over in-process services
//!
//! Builds a full [`Mesh`] from configuration, serves inventory, payments and
//! shipping from an [`InProcessTransport`], and observes saga progress on the
//! broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::StreamExt;
use guarded_mesh_core::{
    Broker, Metadata, OrchestrationError, ServiceCall, ServiceError, SystemClock, TransportError,
};
use guarded_mesh_runtime::orchestrator::kinds;
use guarded_mesh_runtime::{InProcessTransport, Mesh, MeshConfig, Saga, Step};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Fixtures
// ============================================================================

/// Shared stock level plus a journal of every handled call.
#[derive(Clone, Default)]
struct Warehouse {
    stock: Arc<Mutex<i64>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Warehouse {
    fn note(&self, entry: &str) {
        self.journal.lock().unwrap().push(entry.to_string());
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

fn transport(warehouse: &Warehouse, shipping_up: bool) -> InProcessTransport {
    let transport = InProcessTransport::new();

    let w = warehouse.clone();
    transport.handle("inventory", "reserve", move |params: Value| {
        let w = w.clone();
        async move {
            let qty = params["qty"].as_i64().unwrap_or(1);
            *w.stock.lock().unwrap() -= qty;
            w.note("reserve");
            Ok(json!({ "reservation": "r-1", "qty": qty }))
        }
    });

    let w = warehouse.clone();
    transport.handle("inventory", "release", move |params: Value| {
        let w = w.clone();
        async move {
            let qty = params["qty"].as_i64().unwrap_or(0);
            *w.stock.lock().unwrap() += qty;
            w.note("release");
            Ok(json!({ "released": params["reservation"] }))
        }
    });

    let w = warehouse.clone();
    transport.handle("payments", "charge", move |_| {
        let w = w.clone();
        async move {
            w.note("charge");
            Ok(json!({ "charge_id": "c-9" }))
        }
    });

    let w = warehouse.clone();
    transport.handle("payments", "refund", move |_| {
        let w = w.clone();
        async move {
            w.note("refund");
            Ok(json!({ "refunded": true }))
        }
    });

    let w = warehouse.clone();
    transport.handle("shipping", "create", move |_| {
        let w = w.clone();
        async move {
            w.note("ship");
            if shipping_up {
                Ok(json!({ "tracking": "T-1" }))
            } else {
                Err(TransportError::Remote("carrier unavailable".to_string()))
            }
        }
    });

    transport
}

async fn mesh(transport: InProcessTransport) -> Mesh {
    let mesh = Mesh::new(
        MeshConfig::default(),
        Arc::new(transport),
        Arc::new(SystemClock),
    )
    .unwrap();
    for service in ["inventory", "payments", "shipping"] {
        mesh.registry()
            .register(service, "in-process", Metadata::new())
            .await;
    }
    mesh
}

fn checkout(qty: i64) -> Saga {
    Saga::new("checkout")
        .step(
            Step::new(
                "reserve",
                ServiceCall::new("inventory", "reserve", json!({ "qty": qty })),
            )
            .compensate_from(|reservation| {
                ServiceCall::new("inventory", "release", reservation.clone())
            }),
        )
        .step(
            Step::new("charge", ServiceCall::new("payments", "charge", json!({ "cents": 1999 })))
                .compensate_with(ServiceCall::new("payments", "refund", json!({ "charge_id": "c-9" }))),
        )
        .step(Step::new(
            "ship",
            ServiceCall::new("shipping", "create", json!({})),
        ))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_checkout_completes() {
    let warehouse = Warehouse::default();
    *warehouse.stock.lock().unwrap() = 10;
    let mesh = mesh(transport(&warehouse, true)).await;

    let outcome = mesh.orchestrator("sagas").execute(&checkout(3)).await.unwrap();

    assert_eq!(outcome.value("ship"), Some(&json!({ "tracking": "T-1" })));
    assert_eq!(*warehouse.stock.lock().unwrap(), 7);
    assert_eq!(warehouse.journal(), vec!["reserve", "charge", "ship"]);
}

#[tokio::test]
async fn test_shipping_failure_rolls_back_payment_then_inventory() {
    let warehouse = Warehouse::default();
    *warehouse.stock.lock().unwrap() = 10;
    let mesh = mesh(transport(&warehouse, false)).await;

    let err = mesh
        .orchestrator("sagas")
        .execute(&checkout(3))
        .await
        .unwrap_err();

    let OrchestrationError::Failed {
        failed_step_index,
        failed_step,
        cause,
        compensations,
        ..
    } = err;
    assert_eq!(failed_step_index, 2);
    assert_eq!(failed_step, "ship");
    assert!(matches!(cause, ServiceError::ServiceCallFailed { .. }));
    assert_eq!(
        compensations.iter().map(|c| c.step_name.as_str()).collect::<Vec<_>>(),
        vec!["charge", "reserve"]
    );
    assert_eq!(
        warehouse.journal(),
        vec!["reserve", "charge", "ship", "refund", "release"]
    );
    // Stock restored from the reserve result
    assert_eq!(*warehouse.stock.lock().unwrap(), 10);
}

#[tokio::test]
async fn test_progress_reaches_subscribers() {
    let warehouse = Warehouse::default();
    let mesh = mesh(transport(&warehouse, true)).await;
    let mut stream = mesh.broker().subscribe(&["sagas"]).await.unwrap();

    mesh.orchestrator("sagas").execute(&checkout(1)).await.unwrap();

    let kinds_seen: Vec<String> = stream
        .by_ref()
        .take(5)
        .map(|message| message.unwrap().kind)
        .collect()
        .await;
    assert_eq!(
        kinds_seen,
        vec![
            kinds::SAGA_STARTED,
            kinds::STEP_COMPLETED,
            kinds::STEP_COMPLETED,
            kinds::STEP_COMPLETED,
            kinds::SAGA_COMPLETED,
        ]
    );
}

#[tokio::test]
async fn test_concurrent_sagas_are_independent() {
    let warehouse = Warehouse::default();
    *warehouse.stock.lock().unwrap() = 100;
    let mesh = mesh(transport(&warehouse, true)).await;
    let orchestrator = mesh.orchestrator("sagas");

    let runs = (0..10).map(|_| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.execute(&checkout(2)).await })
    });
    for run in futures::future::join_all(runs).await {
        assert!(run.unwrap().is_ok());
    }

    assert_eq!(*warehouse.stock.lock().unwrap(), 80);
    assert_eq!(mesh.breaker().statistics("inventory").total_successes, 10);
}
