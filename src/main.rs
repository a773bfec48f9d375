use std::{future::IntoFuture, process, sync::Arc};

use dashcache::{
    application::{
        dashboard::DashboardService, error::AppError, registry::QueryRegistry,
        repos::QueryExecutor,
    },
    cache::{CacheStore, Clock, RefreshConfig, RefreshHandle, RefreshScheduler, SystemClock},
    config,
    infra::{
        db::{ConnectionManager, MssqlConnector, PoolOptions},
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use dashcache_api_types::{QuerySummaryDto, StatusResponse};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(args) => run_refresh(settings, args).await,
        config::Command::Queries => run_queries(settings),
    }
}

/// Long-lived pieces shared by the serve and refresh commands.
struct Runtime {
    pool: ConnectionManager,
    scheduler: RefreshScheduler,
}

impl Runtime {
    async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.pool.close();
    }
}

fn build_runtime(settings: &config::Settings) -> Result<Runtime, AppError> {
    let registry = Arc::new(QueryRegistry::from_definitions(settings.queries.clone())?);

    let url = settings
        .database
        .connection_string()
        .map_err(|err| InfraError::configuration(err.to_string()))?;
    let connector = Arc::new(MssqlConnector::from_ado_string(url)?);
    let pool = ConnectionManager::new(connector, PoolOptions::from(&settings.database));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(CacheStore::new(&registry, Arc::clone(&clock)));
    let executor: Arc<dyn QueryExecutor> = Arc::new(pool.clone());
    let scheduler = RefreshScheduler::new(
        registry,
        store,
        executor,
        clock,
        RefreshConfig::from(&settings.refresh),
    );

    info!(
        target = "dashcache::startup",
        queries = scheduler.registry().len(),
        max_connections = pool.options().max_connections.get(),
        "Refresh runtime ready"
    );

    Ok(Runtime { pool, scheduler })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let runtime = build_runtime(&settings)?;

    if settings.refresh.warm_on_startup {
        runtime.scheduler.warm_up();
    }

    let periodic = {
        let scheduler = runtime.scheduler.clone();
        tokio::spawn(async move { scheduler.run_periodic().await })
    };

    let state = HttpState {
        dashboard: DashboardService::new(runtime.scheduler.clone()),
    };
    let result = serve_http(&settings, state).await;

    runtime.shutdown().await;
    join_background("periodic refresh loop", periodic).await;

    result
}

/// Wait for a background task, logging a panic or cancellation instead of dropping it.
async fn join_background(task: &'static str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(err) => {
            error!(
                target = "dashcache::shutdown",
                task,
                panicked = err.is_panic(),
                error = %err,
                "Background task ended abnormally"
            );
            false
        }
    }
}

async fn run_refresh(settings: config::Settings, args: config::RefreshArgs) -> Result<(), AppError> {
    let runtime = build_runtime(&settings)?;
    let scheduler = &runtime.scheduler;

    let names: Vec<String> = if args.queries.is_empty() {
        scheduler.registry().names().map(str::to_string).collect()
    } else {
        args.queries
    };

    let handles = names
        .iter()
        .map(|name| scheduler.request_refresh(name))
        .collect::<Result<Vec<_>, _>>()?;
    let outcomes = join_all(handles.into_iter().map(RefreshHandle::outcome)).await;

    let status = DashboardService::new(scheduler.clone()).status();
    let rendered = serde_json::to_string_pretty(&StatusResponse::from(&status))
        .map_err(|err| AppError::unexpected(format!("failed to encode status: {err}")))?;
    println!("{rendered}");

    runtime.shutdown().await;

    let failed: Vec<&str> = names
        .iter()
        .zip(&outcomes)
        .filter(|(_, outcome)| !outcome.is_refreshed())
        .map(|(name, _)| name.as_str())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "refresh did not complete for: {}",
            failed.join(", ")
        )))
    }
}

fn run_queries(settings: config::Settings) -> Result<(), AppError> {
    let registry = QueryRegistry::from_definitions(settings.queries)?;
    let summaries: Vec<QuerySummaryDto> =
        registry.definitions().map(QuerySummaryDto::from).collect();
    let rendered = serde_json::to_string_pretty(&summaries)
        .map_err(|err| AppError::unexpected(format!("failed to encode queries: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let addr = settings.server.addr;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::from(InfraError::bind(addr, err)))?;
    info!(target = "dashcache::startup", %addr, "Dashboard HTTP listening");

    let stop = CancellationToken::new();
    let signal = {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.cancel();
        })
    };

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .into_future();
    let grace = settings.server.graceful_shutdown;

    let result = tokio::select! {
        result = server => result
            .map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        _ = async {
            stop.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                target = "dashcache::shutdown",
                grace_seconds = grace.as_secs(),
                "Graceful shutdown timed out; dropping open connections"
            );
            Ok(())
        }
    };

    signal.abort();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "dashcache::shutdown", error = %err, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "dashcache::shutdown", error = %err, "SIGTERM handler failed");
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
    info!(target = "dashcache::shutdown", "Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_panics_are_reported() {
        let clean = tokio::spawn(async {});
        assert!(join_background("clean", clean).await);

        let panicking = tokio::spawn(async { panic!("tick failed") });
        assert!(!join_background("panicking", panicking).await);
    }
}
