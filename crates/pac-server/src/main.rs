use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pac_core::db::{create_pool, run_migrations};
use pac_core::providers::{ForgeProviderFactory, GitHubAppAuth, http_client};
use pac_server::worker::{reconcile_channel, recover_unfinalized, start_reconciler};
use pac_server::{AdminAuthConfig, AppState, ServerConfig, routes};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pac_server=info,pac_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or_default() {
        Commands::Run => run(cli.listen, cli.database_url).await,
    }
}

async fn run(listen: Option<String>, database_url: Option<String>) -> Result<()> {
    let mut config = ServerConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if let Some(database_url) = database_url {
        config.database_url = database_url;
    }
    let admin_auth_config = AdminAuthConfig::from_env();
    if admin_auth_config.admin_token.is_none() {
        tracing::warn!("PAC_ADMIN_TOKEN is not set, the management API is disabled");
    }

    let db = create_pool(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    run_migrations(&db).await.context("Failed to run migrations")?;

    let github_app = match (&config.github_app_id, &config.github_private_key_path) {
        (Some(app_id), Some(key_path)) => {
            tracing::info!("GitHub App {} configured", app_id);
            Some(Arc::new(GitHubAppAuth::from_key_file(app_id.clone(), key_path)?))
        }
        _ => None,
    };
    let providers = Arc::new(ForgeProviderFactory::new(db.clone(), github_app)?);

    let (reconcile_tx, reconcile_rx) = reconcile_channel();
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(
        db.clone(),
        config,
        providers,
        http_client()?,
        reconcile_tx.clone(),
        admin_auth_config,
    );

    start_reconciler(state.clone(), reconcile_rx);
    recover_unfinalized(&db, &reconcile_tx).await;

    let app = routes::app_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!("Pipelines-as-Code controller listening on http://{}", listen_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Server error")?;
    Ok(())
}
