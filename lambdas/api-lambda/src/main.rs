use aws_sdk_dynamodb::Client as DynamoClient;
use aws_sdk_sesv2::Client as SesClient;
use homeschool_shared::config::AppConfig;
use homeschool_shared::email::SesMailer;
use homeschool_shared::store::dynamo::DynamoStore;
use homeschool_shared::AppState;
use lambda_http::{run, service_fn, tracing, Error, Request};
use std::sync::Arc;

mod http_handler;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing::init_default_subscriber();

    let app_config = AppConfig::from_env()?;

    // Initialize AWS clients once at startup
    let config = aws_config::load_from_env().await;
    let store = DynamoStore::new(DynamoClient::new(&config), app_config.table_name.clone());
    let mailer = SesMailer::new(SesClient::new(&config), app_config.from_email.clone());

    tracing::info!("Serving family API from table {}", app_config.table_name);
    let state = AppState::new(Arc::new(store), Arc::new(mailer), app_config);

    run(service_fn(move |event: Request| {
        let state = Arc::clone(&state);
        async move { http_handler::function_handler(event, state).await }
    }))
    .await
}
