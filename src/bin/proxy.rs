use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use azure_openai_proxy::config::LoggingConfig;
use azure_openai_proxy::{
    AppState, Dispatcher, HealthSweeper, InstanceManager, Loader, RedisStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut config_dir = "configs".to_string();
    let mut port_override: Option<u16> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-config" | "--config" => {
                config_dir = args.next().ok_or("missing value for -config")?;
            }
            "-port" | "--port" => {
                let raw = args.next().ok_or("missing value for -port")?;
                port_override = Some(raw.parse().map_err(|_| format!("invalid port: {raw}"))?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let mut config = Loader::new()
        .load(&config_dir)
        .map_err(|err| format!("failed to load configuration: {err}"))?;
    if let Some(port) = port_override {
        config.port = port;
    }

    init_tracing(&config.logging);

    let store = Arc::new(RedisStore::new(
        &config.storage.redis_url,
        &config.storage.redis_password,
    )?);
    tokio::time::timeout(Duration::from_secs(5), store.ping())
        .await
        .map_err(|_| "timed out connecting to Redis")?
        .map_err(|err| format!("failed to connect to Redis: {err}"))?;

    let manager = Arc::new(InstanceManager::new(
        config.instances.clone(),
        config.routing.strategy,
        store.clone(),
        store,
    ));
    let dispatcher = Arc::new(
        Dispatcher::new(manager.clone(), &config.instances)
            .map_err(|err| format!("failed to initialize upstream clients: {err}"))?,
    );

    HealthSweeper::new(manager.clone(), dispatcher.clone()).spawn();

    let mut state = AppState::new(manager, dispatcher);
    if let Ok(token) = std::env::var("ADMIN_TOKEN") {
        if !token.is_empty() {
            state = state.with_admin_token(token);
        }
    }

    let app = azure_openai_proxy::router(state);
    let address = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(address = %address, "starting Azure OpenAI proxy");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.to_lowercase()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.file.is_empty() {
        builder.init();
        return;
    }

    if let Some(parent) = Path::new(&config.file).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)
    {
        Ok(file) => builder.with_writer(Arc::new(file)).init(),
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", config.file);
            builder.init();
        }
    }
}
