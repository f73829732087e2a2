use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::{env, sync::Arc, time::Duration};
use taskrelay::{
    background::spawn_cancellable_task,
    cache::CacheClient,
    config::Config,
    events::EventInjector,
    executor::Executor,
    http::{context::AppContext, middleware_auth::JwksVerifier, server::build_router},
    listexecutor::ListExecutor,
    metrics::{Metrics, metrics_router},
    oauth::AccessTokenManager,
    policy::PolicyClient,
    runner::TaskRunner,
    service::{TaskListService, TaskService},
    storage::PostgresStorage,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

/// Shared HTTP client timeouts for policy, cache and task HTTP calls.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TOTAL_TIMEOUT: Duration = Duration::from_secs(20);
const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the API server may keep draining connections after shutdown is
/// requested.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> Result<()> {
    let version = taskrelay::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let config = Config::new()?;

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("taskrelay={},tower_http=info,sqlx=warn", config.log_level)),
    );

    let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!(version = %version, "Starting taskrelay");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let storage = Arc::new(PostgresStorage::new(pool));

    let http_client = reqwest::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(HTTP_TOTAL_TIMEOUT)
        .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
        .user_agent(format!("taskrelay/{version}"))
        .build()?;

    // OAuth2 client credentials for outbound policy and cache calls.
    let token_manager = match &config.oauth {
        Some(oauth) => {
            let manager = Arc::new(AccessTokenManager::new(
                http_client.clone(),
                oauth.token_url.clone(),
                oauth.client_id.clone(),
                oauth.client_secret.clone(),
            ));
            if let Err(e) = manager.init().await {
                tracing::error!(error = ?e, "Failed to obtain initial access token");
                std::process::exit(1);
            }
            tracing::info!("Outbound OAuth2 client credentials configured");
            Some(manager)
        }
        None => {
            tracing::info!("Outbound OAuth2 not configured");
            None
        }
    };

    let policy = Arc::new(PolicyClient::new(
        config.policy.addr.clone(),
        http_client.clone(),
        token_manager.clone(),
    ));
    let cache = Arc::new(CacheClient::new(
        config.cache.addr.clone(),
        http_client.clone(),
        token_manager,
    ));
    let runner = Arc::new(TaskRunner::new(policy, http_client.clone()));

    let metrics = Arc::new(Metrics::new());

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // Task executor.
    {
        let executor = Executor::new(
            storage.clone(),
            storage.clone(),
            cache.clone(),
            runner.clone(),
            config.executor.workers,
            config.executor.poll_interval,
            config.executor.max_task_retries,
            config.executor.claim_timeout,
            metrics.clone(),
        );
        spawn_cancellable_task(&tracker, token.clone(), "task-executor", |cancel_token| {
            executor.run(cancel_token)
        });
    }

    // Task-list executor.
    {
        let list_executor = Arc::new(ListExecutor::new(
            storage.clone(),
            storage.clone(),
            cache.clone(),
            runner.clone(),
            config.list_executor.workers,
            config.list_executor.poll_interval,
            metrics.clone(),
        ));
        spawn_cancellable_task(
            &tracker,
            token.clone(),
            "task-list-executor",
            |cancel_token| list_executor.run(cancel_token),
        );
    }

    // Event injector, when an event bus is configured.
    match &config.events.addr {
        Some(addr) => {
            let injector = EventInjector::connect(
                addr,
                &config.events.queue,
                storage.clone(),
                storage.clone(),
                metrics.clone(),
            )
            .await?;
            spawn_cancellable_task(&tracker, token.clone(), "event-injector", |cancel_token| {
                injector.run(cancel_token)
            });
        }
        None => {
            tracing::info!("Event bus not configured; event injector disabled");
        }
    }

    // Inbound JWT authentication.
    let verifier = if config.auth.enabled {
        let verifier = Arc::new(JwksVerifier::new(
            config.auth.jwk_url.clone(),
            http_client.clone(),
        ));
        if let Err(e) = verifier.refresh().await {
            tracing::error!(error = %e, "Failed to fetch initial JWKS key set");
            std::process::exit(1);
        }
        let refresh_interval = config.auth.refresh_interval;
        let refresher = verifier.clone();
        spawn_cancellable_task(&tracker, token.clone(), "jwks-refresh", move |cancel_token| async move {
            refresher.run_refresh(refresh_interval, cancel_token).await;
            Ok(())
        });
        Some(verifier)
    } else {
        tracing::info!("Authentication disabled");
        None
    };

    let context = AppContext::new(
        config.clone(),
        TaskService::new(storage.clone(), storage.clone(), cache.clone()),
        TaskListService::new(storage.clone(), storage.clone(), cache.clone()),
        verifier,
        metrics.clone(),
    );

    // Metrics listener.
    {
        let metrics_addr = config.metrics.addr.clone();
        let router = metrics_router(metrics.clone());
        spawn_cancellable_task(&tracker, token.clone(), "metrics-server", |cancel_token| async move {
            let listener = TcpListener::bind(&metrics_addr)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind metrics listener {metrics_addr}: {e}"))?;
            tracing::info!(addr = %metrics_addr, "Metrics server listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { cancel_token.cancelled().await })
                .await
                .map_err(|e| anyhow::anyhow!("Metrics server error: {e}"))
        });
    }

    // API listener.
    {
        let bind_addr = config.http.bind_addr();
        let router = build_router(context);
        spawn_cancellable_task(&tracker, token.clone(), "http-server", |cancel_token| async move {
            let listener = TcpListener::bind(&bind_addr)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind {bind_addr}: {e}"))?;
            tracing::info!(addr = %bind_addr, "HTTP server listening");

            let shutdown_token = cancel_token.clone();
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown_token.cancelled().await });

            tokio::select! {
                result = serve => result.map_err(|e| anyhow::anyhow!("HTTP server error: {e}")),
                () = async {
                    cancel_token.cancelled().await;
                    tokio::time::sleep(HTTP_SHUTDOWN_GRACE).await;
                } => {
                    tracing::warn!("HTTP server exceeded shutdown grace period");
                    Ok(())
                }
            }
        });
    }

    // Signal handler: SIGINT/SIGTERM cancel the lifecycle token.
    {
        let signal_tracker = tracker.clone();
        let signal_token = token.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                signal::ctrl_c()
                    .await
                    .expect("failed to install Ctrl+C handler");
            };

            #[cfg(unix)]
            let terminate = async {
                signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install signal handler")
                    .recv()
                    .await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {}
                _ = terminate => {
                    tracing::info!("Received SIGTERM, initiating shutdown");
                }
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C, initiating shutdown");
                }
            }

            signal_tracker.close();
            signal_token.cancel();
        });
    }

    tracker.wait().await;
    tracing::info!("All tasks completed, shutting down");

    Ok(())
}
