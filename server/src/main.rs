use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

use rideshare_server::config::{generate_config_template, Config};
use rideshare_server::notifications::retention;
use rideshare_server::{auth, db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "rideshare_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "rideshare_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!(
        "rideshare notification server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let db = db::init_db(&config.data_dir)?;

    // Shared with the external auth service, which signs the tokens we verify
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    let app_state = state::AppState::new(
        db.clone(),
        jwt_secret,
        Duration::from_secs(config.ride_expiry_secs),
    );

    // Pending rides survive restarts: expire overdue ones, re-arm the rest
    app_state.arbiter.restore().await?;

    app_state
        .presence
        .spawn_resync_task(Duration::from_secs(config.presence_resync_secs.max(1)));

    match config.notification_retention_days {
        Some(days) => {
            retention::spawn_retention_cleanup(
                db,
                days,
                config.retention_cleanup_interval_secs.max(1),
            );
            tracing::info!(retention_days = days, "Notification retention enabled");
        }
        None => tracing::info!("Notification retention disabled"),
    }

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
