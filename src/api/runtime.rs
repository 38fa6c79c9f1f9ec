//! Start-up and shutdown of a proxy instance

use super::admin_http;
use super::control::ProxyControl;
use crate::config::ProxyConfig;
use crate::filter::{BlocklistIndex, RequestInterceptor};
use crate::proxy::{ProxyServer, ServerSettings, TcpConnector, UpstreamConnector};
use crate::stats::ProxyStats;
use crate::storage::HistoryStore;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running proxy. Dropping the handle leaves the listeners running; call
/// [`ServerHandle::shutdown`] to stop them.
pub struct ServerHandle {
    control: ProxyControl,
    proxy_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl ServerHandle {
    pub fn control(&self) -> &ProxyControl {
        &self.control
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Stop accepting connections and wait for the listener tasks to exit.
    /// Connections already in flight finish on their own.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        tracing::info!("Stopping proxy");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await??;
        }
        Ok(())
    }
}

pub async fn start_proxy(config: &ProxyConfig) -> anyhow::Result<ServerHandle> {
    start_proxy_with(config, Arc::new(TcpConnector)).await
}

/// Start with a custom upstream connector.
pub async fn start_proxy_with(
    config: &ProxyConfig,
    connector: Arc<dyn UpstreamConnector>,
) -> anyhow::Result<ServerHandle> {
    let stats = Arc::new(ProxyStats::new());

    let blocklist = match BlocklistIndex::load(&config.blocklist_path) {
        Ok(index) => index,
        Err(err) => {
            tracing::warn!("{err}; starting with an empty blocklist");
            BlocklistIndex::empty()
        }
    };
    tracing::info!("Blocklist ready with {} hosts", blocklist.len());
    let interceptor = Arc::new(RequestInterceptor::new(
        Arc::new(blocklist),
        config.blocking_enabled,
        stats.clone(),
    ));

    let history = Arc::new(HistoryStore::open(&config.history_path)?);
    history.set_private_mode(config.private_mode);

    let control = ProxyControl::new(
        interceptor.clone(),
        history.clone(),
        stats.clone(),
        config.blocklist_path.clone(),
    );

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding proxy listener on {listen_addr}"))?;
    let proxy_addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(
        interceptor,
        history,
        stats,
        connector,
        ServerSettings::from_config(config),
    );
    let mut tasks = vec![tokio::spawn(server.serve(listener, shutdown_rx.clone()))];

    let admin_addr = match config.admin_port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .with_context(|| format!("binding admin listener on 127.0.0.1:{port}"))?;
            let addr = listener.local_addr()?;
            tasks.push(tokio::spawn(admin_http::serve(
                listener,
                control.clone(),
                shutdown_rx,
            )));
            Some(addr)
        }
        None => None,
    };

    tracing::info!(
        blocking = config.blocking_enabled,
        private_mode = config.private_mode,
        "Proxy started on {}",
        proxy_addr
    );

    Ok(ServerHandle {
        control,
        proxy_addr,
        admin_addr,
        shutdown: shutdown_tx,
        tasks,
    })
}
