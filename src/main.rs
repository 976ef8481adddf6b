//! Demo of commit coordination across in-process participants

use proven_commit::common::{ParticipantId, SessionId, StatementId, TransactionKey};
use proven_commit::coordinator::{
    CoordinatorConfig, CoordinatorService, DocumentStore, MemoryDocumentStore,
};
use proven_commit::engine::MockNetwork;
use proven_commit::protocol::{StatementRequest, TransactionPhase};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type DemoResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> DemoResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Cross-Partition Commit Demo ===\n");

    let network = Arc::new(MockNetwork::with_participants(["orders", "inventory"])?);
    let store = Arc::new(MemoryDocumentStore::new());
    let local = ParticipantId::new("orders");
    let service = CoordinatorService::new(CoordinatorConfig::default(), store.clone(), network.clone())
        .with_local_participant(local.clone(), network.participant(&local)?);
    service.step_up(1)?;

    demo_commit(&network, &service).await?;
    demo_abort(&network, &service).await?;
    demo_handover(&network, &store, &service).await?;

    let metrics = service.metrics();
    println!(
        "\n  ✓ Coordinators created: {}, committed: {}, aborted: {}",
        metrics.total_created,
        metrics.total_committed_two_phase_commit,
        metrics.total_aborted_two_phase_commit
    );

    println!("\n=== All demos completed successfully! ===");
    Ok(())
}

fn participants() -> Vec<ParticipantId> {
    vec![ParticipantId::new("orders"), ParticipantId::new("inventory")]
}

fn write(network: &MockNetwork, key: TransactionKey, participant: &str) -> DemoResult<()> {
    let statement = json!({ "insert": participant, "txn": key.to_string() });
    network.execute(
        &ParticipantId::new(participant),
        &StatementRequest::start(key, StatementId(0), statement),
    )?;
    Ok(())
}

async fn demo_commit(network: &MockNetwork, service: &CoordinatorService) -> DemoResult<()> {
    println!("--- Demo 1: Commit ---");
    let key = TransactionKey::new(SessionId::new(), 1);
    write(network, key, "orders")?;
    write(network, key, "inventory")?;

    let decision = service.coordinate_commit(key, Some(participants())).await?;
    service.join_all().await;
    println!("  ✓ {} decided: {}", key, decision);
    Ok(())
}

async fn demo_abort(network: &MockNetwork, service: &CoordinatorService) -> DemoResult<()> {
    println!("\n--- Demo 2: Refused Prepare ---");
    let key = TransactionKey::new(SessionId::new(), 1);
    // inventory never sees the transaction and refuses to prepare
    write(network, key, "orders")?;

    let decision = service.coordinate_commit(key, Some(participants())).await?;
    service.join_all().await;
    println!("  ✓ {} decided: {}", key, decision);
    Ok(())
}

async fn demo_handover(
    network: &Arc<MockNetwork>,
    store: &Arc<MemoryDocumentStore>,
    service: &CoordinatorService,
) -> DemoResult<()> {
    println!("\n--- Demo 3: Coordinator Handover ---");
    let key = TransactionKey::new(SessionId::new(), 1);
    write(network, key, "orders")?;
    write(network, key, "inventory")?;

    let inventory = ParticipantId::new("inventory");
    network.drop_phase(&inventory, TransactionPhase::Commit);
    let decision = service.coordinate_commit(key, Some(participants())).await?;
    println!("  ✓ {} decided: {}", key, decision);

    service.step_down().await;
    println!(
        "  ✓ Stepped down with {} document(s) left for a successor",
        store.len()
    );

    network.heal(&inventory);
    let local = ParticipantId::new("orders");
    let successor =
        CoordinatorService::new(CoordinatorConfig::default(), store.clone(), network.clone())
            .with_local_participant(local.clone(), network.participant(&local)?);
    let resumed = successor.step_up(2)?;
    let recovered = successor.coordinate_commit(key, None).await?;
    successor.join_all().await;

    println!("  ✓ Successor resumed {} coordinator(s), decision {}", resumed, recovered);
    println!(
        "  ✓ inventory received {} commit(s), document present: {}",
        network.delivered(&inventory, TransactionPhase::Commit).len(),
        store.get(&key)?.is_some()
    );
    Ok(())
}
