//! Scripted walk through one capital call against the seeded in-memory
//! accounting service.

use capital_call_agent::{
    agent::Orchestrator,
    config::AppConfig,
    interpreter::build_interpreter,
    models::{UserContext, PERMISSION_CREATE_CAPITAL_CALL},
    services::{InMemoryAccountingService, RetryingAccountingService},
    state::{InMemoryCheckpointStore, WorkflowSnapshot},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SCRIPT: &[&str] = &[
    "Find Evergreen Growth Fund III",
    "The amount is $2.5m, submit date 2025-03-01, posting date 2025-03-15",
    "Use GL 4000",
];

fn print_snapshot(snapshot: &WorkflowSnapshot) {
    for reply in &snapshot.replies {
        println!("agent> {}\n", reply);
    }
    println!("[status: {}]\n", snapshot.status);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = AppConfig::from_env()?;
    let services = Arc::new(RetryingAccountingService::new(
        Arc::new(InMemoryAccountingService::seeded()),
        config.retry.clone(),
    ));
    let orchestrator = Orchestrator::new(
        services,
        build_interpreter(config.gemini_api_key.as_deref()),
        Arc::new(InMemoryCheckpointStore::new()),
        config.workflow.clone(),
    );

    let user = UserContext::new("demo-user", "Demo").with_permission(PERMISSION_CREATE_CAPITAL_CALL);
    let started = orchestrator.start_thread(None, user).await?;
    let thread_id = started.thread_id.clone();
    info!(thread_id = %thread_id, "Demo thread started");
    print_snapshot(&started);

    let mut last = started;
    for message in SCRIPT {
        println!("user> {}\n", message);
        last = orchestrator.send_message(&thread_id, message).await?;
        print_snapshot(&last);
    }

    if last.pending_confirmation.is_some() {
        println!("user> confirm\n");
        last = orchestrator.send_message(&thread_id, "confirm").await?;
        print_snapshot(&last);
    }

    println!("=== AUDIT TRAIL ===");
    for record in orchestrator.history(&thread_id).await? {
        let step = record.step.map(|s| s.to_string()).unwrap_or_else(|| "start".into());
        let hash = record.state_hash.get(..12).unwrap_or(&record.state_hash);
        println!("{:>3}  {:<16} {:<22} {}", record.sequence, step, record.status.to_string(), hash);
    }

    if let Some(error) = last.error {
        eprintln!("Workflow failed: {}", error);
    }

    Ok(())
}
