use kobo_relay::{
    build_router,
    config::Config,
    database::pool::{create_pool, run_migrations},
    services::{eventstream_client::HttpEventStreamClient, kobo_service::KoboClient},
    Adapters, AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kobo_relay=debug"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let sink = Arc::new(HttpEventStreamClient::with_default_client()?);
    let source = Arc::new(KoboClient::with_default_client()?);

    let adapters = match config.database_url.as_deref() {
        Some(url) => {
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Using PostgreSQL storage");
            Adapters::postgres(pool, sink, source)
        }
        None => {
            info!(
                checkpoints = %config.checkpoint_path.display(),
                "DATABASE_URL not set, using in-memory storage"
            );
            Adapters::in_memory(&config, sink, source)
        }
    };

    let addr: SocketAddr = config.server_address.parse()?;
    let webhook_url = config.webhook_url();
    let state = AppState::new(config, adapters).await?;
    let app = build_router(state);

    info!("KoboToolbox webhook endpoint: {}", webhook_url);
    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
