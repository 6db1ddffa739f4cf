use axum::extract::DefaultBodyLimit;
use brandforge::api;
use brandforge::clock::SystemClock;
use brandforge::config::AppConfig;
use brandforge::generator::HttpGenerator;
use brandforge::service::BrandService;
use brandforge::storage::{KeyValueStore, MemoryStore, SqliteStore};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Parser)]
#[command(name = "brandforge", about = "Brand kit generation gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brandforge=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(Some(&cli.config))?;

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        endpoint = %config.generator.endpoint_url,
        "starting brandforge"
    );

    let store: Arc<dyn KeyValueStore> = match &config.database.path {
        Some(path) => {
            let store = SqliteStore::open(path).await?;
            tracing::info!(db = %path.display(), "durable cache initialized");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no database.path configured, cached results will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let generator = Arc::new(HttpGenerator::new(&config.generator));
    let service = Arc::new(BrandService::new(
        &config,
        store,
        generator,
        SystemClock::shared(),
    ));
    let sweepers = service.start_sweepers();

    let governor_conf = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_second(config.rate_limit.per_second)
        .burst_size(config.rate_limit.burst_size)
        .finish()
        .ok_or("invalid rate_limit.per_second / burst_size")?;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static(api::USER_ID_HEADER),
            axum::http::HeaderName::from_static(api::PLAN_HEADER),
        ]);

    let app = api::router(service)
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(GovernorLayer::new(governor_conf))
        .layer(cors);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for sweeper in sweepers {
        sweeper.shutdown();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}
