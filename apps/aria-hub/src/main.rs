use std::process::ExitCode;

use tracing::{error, info};

mod api;
mod app_state;
mod bootstrap;
mod capability;
pub mod config;
mod discovery;
mod hub;
mod ml;
mod modules;
mod organic_discovery;
mod pipeline;
mod responses;
mod router;
mod shadow;
mod shadow_module;
mod tasks;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    aria_otel::init();
    let config = config::load();
    let addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    let grace = config.shutdown_grace();

    let bootstrap::BootstrapOutput { router, state } = match bootstrap::build(config, None).await {
        Ok(out) => out,
        Err(err) => {
            error!("bootstrap failed: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let hub = state.hub().clone();
    let app = bootstrap::attach_layers(router, state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, "bind server socket: {err}");
            hub.shutdown(grace).await;
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "aria hub listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    hub.shutdown(grace).await;
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!("install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
