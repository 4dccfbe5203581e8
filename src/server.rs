//! Server lifecycle
//!
//! Startup happens in two phases so the caller learns the port without
//! waiting for the serve loop:
//!
//! 1. [`IntrospectionServer::bind`] binds the socket synchronously and opens
//!    the failure log. Bind failures surface here.
//! 2. [`IntrospectionServer::start`] spawns the serve loop on the current
//!    Tokio runtime, or [`IntrospectionServer::start_detached`] runs it on a
//!    dedicated thread for callers without one.
//!
//! The returned handles expose the port immediately. Readiness of the serve
//! loop is a separate, optional wait.

use std::{net::TcpListener as StdTcpListener, sync::Arc, thread};

use axum::{extract::DefaultBodyLimit, Router};
use tokio::{sync::oneshot, task::JoinHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::{create_router, AppState},
    config::ServerConfig,
    error::{MiradorError, Result},
    failure_log::FailureLog,
    gateway::{ForwardPass, Inference, InferenceGateway},
    hyperparams::Hyperparameters,
};

/// Bound, not yet serving, introspection server
pub struct IntrospectionServer {
    listener: StdTcpListener,
    port: u16,
    app: Router,
    failure_log: Arc<FailureLog>,
}

impl IntrospectionServer {
    /// Bind the listener and open the failure log
    ///
    /// # Errors
    ///
    /// Returns [`MiradorError::Bind`] if the address cannot be bound, or an
    /// I/O error if the failure log cannot be opened
    pub fn bind(
        config: &ServerConfig,
        hyper: Hyperparameters,
        inference: Arc<dyn Inference>,
    ) -> Result<Self> {
        let addr = config.bind_address();
        let listener = StdTcpListener::bind(&addr).map_err(|source| MiradorError::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let failure_log = Arc::new(FailureLog::open(&config.failure_log)?);
        let state = AppState::new(hyper, inference, Arc::clone(&failure_log));
        let app = create_router(state)
            .layer(DefaultBodyLimit::max(config.max_body_bytes))
            .layer(TraceLayer::new_for_http());
        let app = if config.cors {
            app.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            app
        };

        tracing::info!(
            %addr,
            port,
            failure_log = %config.failure_log.display(),
            "bound introspection server"
        );
        Ok(Self {
            listener,
            port,
            app,
            failure_log,
        })
    }

    /// Bind a server around a forward pass, its parameters and a seed
    ///
    /// # Errors
    ///
    /// Same as [`IntrospectionServer::bind`]
    pub fn with_model<F: ForwardPass>(
        config: &ServerConfig,
        hyper: Hyperparameters,
        forward: F,
        params: F::Params,
        seed: u64,
    ) -> Result<Self> {
        let gateway = InferenceGateway::new(forward, params, seed);
        Self::bind(config, hyper, Arc::new(gateway))
    }

    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Spawn the serve loop on the current Tokio runtime
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be registered with the runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    pub fn start(self) -> Result<ServerHandle> {
        let Self {
            listener,
            port,
            app,
            failure_log,
        } = self;
        let listener = tokio::net::TcpListener::from_std(listener)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            tracing::info!(port, "introspection server listening");
            let _ = ready_tx.send(());
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    // Only an explicit shutdown stops serving, not a dropped handle
                    if shutdown_rx.await.is_err() {
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            match served {
                Ok(()) => tracing::info!(port, "introspection server stopped"),
                Err(e) => tracing::error!(port, error = %e, "introspection server failed"),
            }
        });

        Ok(ServerHandle {
            port,
            ready: Some(ready_rx),
            shutdown: Some(shutdown_tx),
            task,
            failure_log,
        })
    }

    /// Serve on a dedicated thread with its own runtime
    ///
    /// Returns as soon as the thread is spawned. Dropping the returned handle
    /// stops the server.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start_detached(self) -> Result<DetachedServer> {
        let port = self.port;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("mirador-{port}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build server runtime");
                        return;
                    },
                };
                runtime.block_on(async move {
                    let handle = match self.start() {
                        Ok(handle) => handle,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to start server");
                            return;
                        },
                    };
                    // A dropped sender means the owner went away
                    let _ = shutdown_rx.await;
                    if let Err(e) = handle.shutdown().await {
                        tracing::error!(error = %e, "server shutdown failed");
                    }
                });
            })?;

        Ok(DetachedServer {
            port,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

/// Running server on the caller's runtime
///
/// Dropping the handle detaches the server: it keeps serving until the
/// runtime shuts down. Only [`ServerHandle::shutdown`] stops it.
pub struct ServerHandle {
    port: u16,
    ready: Option<oneshot::Receiver<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    failure_log: Arc<FailureLog>,
}

impl ServerHandle {
    /// Bound port, known before the serve loop runs
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until the serve loop has started
    pub async fn ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.await;
        }
    }

    /// Failure log the server writes to
    #[must_use]
    pub fn failure_log(&self) -> &Arc<FailureLog> {
        &self.failure_log
    }

    /// Stop accepting connections, drain in-flight requests and close the
    /// failure log
    ///
    /// # Errors
    ///
    /// Returns error if the serve task panicked
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let joined = (&mut self.task).await;
        self.failure_log.close();
        joined.map_err(|e| {
            MiradorError::Io(std::io::Error::other(format!("server task failed: {e}")))
        })
    }
}

/// Server running on its own thread
pub struct DetachedServer {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DetachedServer {
    /// Bound port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the server and wait for its thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(port = self.port, "server thread panicked");
            }
        }
    }
}

impl Drop for DetachedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{forward_fn, InferenceResult};

    fn config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig::default().with_failure_log(dir.path().join("failures.log"))
    }

    fn noop() -> Arc<dyn Inference> {
        let forward = forward_fn(|_: &(), _, _| Ok(InferenceResult::default()));
        Arc::new(InferenceGateway::new(forward, (), 0))
    }

    #[test]
    fn test_bind_port_zero_picks_port() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            IntrospectionServer::bind(&config(&dir), Hyperparameters::demo(), noop()).unwrap();
        assert_ne!(server.port(), 0);
        assert!(dir.path().join("failures.log").exists());
    }

    #[test]
    fn test_bind_conflict_reported() {
        let dir = tempfile::tempdir().unwrap();
        let first =
            IntrospectionServer::bind(&config(&dir), Hyperparameters::demo(), noop()).unwrap();

        let taken = config(&dir).with_port(first.port());
        let err = IntrospectionServer::bind(&taken, Hyperparameters::demo(), noop())
            .err()
            .unwrap();
        assert!(matches!(err, MiradorError::Bind { .. }));
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn test_bad_failure_log_path_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cfg =
            ServerConfig::default().with_failure_log(dir.path().join("missing").join("f.log"));
        assert!(IntrospectionServer::bind(&cfg, Hyperparameters::demo(), noop()).is_err());
    }

    #[tokio::test]
    async fn test_start_ready_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            IntrospectionServer::bind(&config(&dir), Hyperparameters::demo(), noop()).unwrap();
        let port = server.port();

        let mut handle = server.start().unwrap();
        assert_eq!(handle.port(), port);
        handle.ready().await;
        handle.ready().await;
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_detached_returns_port_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            IntrospectionServer::bind(&config(&dir), Hyperparameters::demo(), noop()).unwrap();
        let port = server.port();

        let detached = server.start_detached().unwrap();
        assert_eq!(detached.port(), port);
        detached.shutdown();
    }
}
