mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use chrono::{DateTime, Utc};
use codelab_engine::{
    build_service, EngineConfig, InMemoryChallengeRepository, LanguageConfigManager, SubmissionService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: SubmissionService,
    pub languages: LanguageConfigManager,
    pub started_at: DateTime<Utc>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_challenges() -> Result<InMemoryChallengeRepository> {
    let path = std::env::var("CHALLENGES_PATH").ok().map(PathBuf::from);
    match path {
        Some(path) => InMemoryChallengeRepository::from_json_file(&path),
        None => {
            let default_path = Path::new("config/challenges.json");
            if default_path.exists() {
                InMemoryChallengeRepository::from_json_file(default_path)
            } else {
                warn!("No challenge file found, starting with an empty repository");
                Ok(InMemoryChallengeRepository::default())
            }
        }
    }
}

async fn shutdown_signal(service: SubmissionService) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let cancelled = service.scheduler().cancel_all();
    info!(cancelled, "Shutting down, outstanding submissions cancelled");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Codelab API booting...");

    let config = EngineConfig::from_env()?;
    let languages_path = std::env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from);
    let languages = LanguageConfigManager::load_or_builtin(languages_path.as_deref())?;
    let challenges = load_challenges()?;
    info!(
        challenges = challenges.len(),
        languages = ?languages.list_languages(),
        isolation = ?config.isolation,
        max_concurrent = config.max_concurrent_executions,
        "Configuration loaded"
    );

    let service = build_service(&config, &languages, Arc::new(challenges))?;

    let state = Arc::new(AppState {
        service: service.clone(),
        languages,
        started_at: Utc::now(),
    });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await
        .context("Server error")?;

    Ok(())
}
