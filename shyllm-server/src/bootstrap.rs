//! Server bootstrap: pick a port, bind, serve, report.
//!
//! The probe in [`crate::ports`] and the bind here are two separate checks.
//! Another process can grab the port in between; that case surfaces as
//! [`BootstrapError::PortTaken`].

use axum::Router;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::ports::PortSource;
use crate::reload;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Unable to choose a free port.")]
    PortTaken {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Server startup failed: {0}")]
    Startup(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Poll interval for the executable watcher; `None` disables auto-reload.
    pub reload: Option<Duration>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            reload: Some(reload::DEFAULT_POLL_INTERVAL),
        }
    }
}

/// What happened once the server stopped serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeReport {
    pub port: u16,
    pub elapsed: Duration,
    pub reload_requested: bool,
}

/// How the process should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Exit(u8),
    Reload,
}

/// Acquire a port from `ports`, bind the wildcard address on it and serve
/// `app` until `shutdown` resolves (or the executable changes, when
/// auto-reload is on).
pub async fn run_server<S, F>(
    app: Router,
    ports: &mut S,
    options: &ServeOptions,
    shutdown: F,
) -> Result<ServeReport, BootstrapError>
where
    S: PortSource + ?Sized,
    F: Future<Output = ()> + Send + 'static,
{
    let start_time = Instant::now();
    let port = ports.acquire();
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            return Err(BootstrapError::PortTaken { port, source: e });
        }
        Err(e) => return Err(BootstrapError::Startup(e)),
    };
    info!("Starting server on {}", addr);

    let reload_requested = Arc::new(AtomicBool::new(false));
    let signal = {
        let reload_requested = Arc::clone(&reload_requested);
        let reload_poll = options.reload;
        async move {
            match reload_poll {
                Some(poll) => tokio::select! {
                    _ = shutdown => {}
                    _ = reload::executable_changed(poll) => {
                        reload_requested.store(true, Ordering::SeqCst);
                    }
                },
                None => shutdown.await,
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await?;

    Ok(ServeReport {
        port,
        elapsed: start_time.elapsed(),
        reload_requested: reload_requested.load(Ordering::SeqCst),
    })
}

/// Turn the bootstrap outcome into a process ending.
///
/// A port lost between probe and bind prints a diagnostic and exits with
/// status 1. Every other startup error is returned to the caller.
pub fn conclude(outcome: Result<ServeReport, BootstrapError>) -> anyhow::Result<Conclusion> {
    match outcome {
        Ok(report) => {
            info!(
                "Server was serving on port: {}. Server ran for {:.3} seconds since startup",
                report.port,
                report.elapsed.as_secs_f64()
            );
            if report.reload_requested {
                Ok(Conclusion::Reload)
            } else {
                Ok(Conclusion::Exit(0))
            }
        }
        Err(e @ BootstrapError::PortTaken { .. }) => {
            if let BootstrapError::PortTaken { port, source } = &e {
                error!("Port {} was claimed before the server could bind it: {}", port, source);
            }
            eprintln!("{}", e);
            Ok(Conclusion::Exit(1))
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
