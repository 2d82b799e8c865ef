//! # RPC Server
//!
//! Accepts connections on one string binding and serves each on its own task.
//! Interfaces are registered through [`RpcServer::register`] before or while
//! the server runs; associations look them up at bind time.
//!
//! ## Shutdown
//! [`RpcServer::serve`] stops on CTRL+C; [`RpcServer::serve_with_shutdown`]
//! stops when its channel yields. Either way the listener closes first, every
//! association finishes its in-flight calls and sends a shutdown notice, and
//! the server waits up to `shutdown_timeout` for them to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{RpcConfig, ServerConfig};
use crate::error::Result;
use crate::protocol::dispatcher::{DispatchTable, Interface, InterfaceRegistry};
use crate::protocol::{serve_association, AssociationSettings};
use crate::security::MechanismProvider;
use crate::transport::{Listener, StringBinding};
use crate::utils::metrics::global_metrics;

/// Server configuration plus the mechanisms it accepts.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub config: ServerConfig,
    pub providers: Vec<Arc<dyn MechanismProvider>>,
}

impl ServerOptions {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(config.server.clone())
    }

    pub fn with_provider(mut self, provider: Arc<dyn MechanismProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

/// A bound RPC server.
pub struct RpcServer {
    listener: Listener,
    settings: Arc<AssociationSettings>,
    active: Arc<AtomicUsize>,
}

impl RpcServer {
    /// Bind the listener named by the configured string binding.
    #[instrument(skip(options), fields(binding = %options.config.binding))]
    pub async fn bind(options: ServerOptions) -> Result<Self> {
        let binding: StringBinding = options.config.binding.parse()?;
        let listener = Listener::bind(&binding).await?;
        let secondary_address = listener.secondary_address();
        info!(
            binding = %listener.local_binding(),
            mechanisms = ?options.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "RPC server bound"
        );

        Ok(Self {
            listener,
            settings: Arc::new(AssociationSettings::new(
                options.config,
                InterfaceRegistry::new(),
                options.providers,
                secondary_address,
            )),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Serve a dispatch table's interface.
    pub fn register(&self, table: DispatchTable) -> Result<()> {
        self.settings.registry.register(table)
    }

    /// Build a table from an interface implementation and serve it.
    pub fn register_interface<I: Interface>(&self, implementation: I) -> Result<()> {
        self.register(DispatchTable::for_interface(implementation))
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.settings.registry
    }

    /// Where clients can reach this server; resolves an ephemeral port.
    pub fn local_binding(&self) -> StringBinding {
        self.listener.local_binding()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Serve until CTRL+C.
    pub async fn serve(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });

        self.serve_with_shutdown(shutdown_rx).await
    }

    /// Serve until `shutdown_rx` yields or its senders are dropped.
    #[instrument(skip_all, fields(binding = %self.listener.local_binding()))]
    pub async fn serve_with_shutdown(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let max_connections = self.settings.config.max_connections;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Waiting for associations to close...");
                    let _ = stop_tx.send(true);
                    self.wait_for_drain().await;
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            continue;
                        }
                    };
                    if self.active.load(Ordering::Relaxed) >= max_connections {
                        warn!(%peer, max_connections, "Connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }

                    self.active.fetch_add(1, Ordering::Relaxed);
                    let active = Arc::clone(&self.active);
                    let settings = Arc::clone(&self.settings);
                    let stop = stop_rx.clone();
                    debug!(%peer, "Accepted connection");

                    tokio::spawn(async move {
                        if let Err(e) = serve_association(stream, peer.clone(), settings, stop).await {
                            debug!(%peer, error = %e, "Association failed");
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }

    async fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.settings.config.shutdown_timeout;
        loop {
            let connections = self.active.load(Ordering::Relaxed);
            if connections == 0 {
                info!("All associations closed, shutting down");
                break;
            }
            if Instant::now() >= deadline {
                warn!(connections, "Shutdown timeout reached, forcing exit");
                break;
            }
            debug!(connections, "Waiting for associations to close");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        global_metrics().log_metrics();
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("binding", &self.listener.local_binding())
            .field("registry", &self.settings.registry)
            .field("active", &self.active_connections())
            .finish()
    }
}
