use aws_sdk_dynamodb::Client as DynamoClient;
use homeschool_shared::backfill::{backfill_families, reverse_backfill, BackfillReport};
use homeschool_shared::store::dynamo::DynamoStore;
use homeschool_shared::store::Store;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Invocation payload. An empty object runs the forward migration.
#[derive(Debug, Default, Deserialize)]
struct BackfillEvent {
    #[serde(default)]
    reverse: bool,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "direction", rename_all = "lowercase")]
enum BackfillOutcome {
    Forward(BackfillReport),
    Reverse { records_cleared: usize },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = aws_config::load_from_env().await;
    let table_name = std::env::var("TABLE_NAME").unwrap_or_else(|_| "homeschool-hub".to_string());
    let store: Arc<dyn Store> = Arc::new(DynamoStore::new(DynamoClient::new(&config), table_name));

    run(service_fn(move |event: LambdaEvent<BackfillEvent>| {
        let store = Arc::clone(&store);
        async move { function_handler(store.as_ref(), event.payload).await }
    }))
    .await
}

async fn function_handler(store: &dyn Store, event: BackfillEvent) -> Result<BackfillOutcome, Error> {
    if event.reverse {
        tracing::info!("Clearing family ownership from all records");
        let records_cleared = reverse_backfill(store).await?;
        tracing::info!("Reverse backfill cleared {} records", records_cleared);
        return Ok(BackfillOutcome::Reverse { records_cleared });
    }

    tracing::info!("Backfilling families for record owners");
    let report = backfill_families(store).await?;
    tracing::info!(
        "Backfill done: {} owners, {} families created, {} records updated",
        report.owners,
        report.families_created,
        report.records_updated
    );
    Ok(BackfillOutcome::Forward(report))
}
