//! TCP listener
//!
//! Accepts client connections and spawns one task per connection: the
//! handshake, and the session it may turn into, run on that task for
//! the connection's whole life. A failing connection only ever takes
//! itself down.

use super::handshake::{self, ExportContext};
use crate::registry::BindingRegistry;
use crate::usb::backend::UsbBackend;
use crate::usb::claims::ClaimTable;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// USB/IP export server
pub struct UsbIpServer<B: UsbBackend> {
    listener: TcpListener,
    ctx: ExportContext<B>,
}

impl<B: UsbBackend> UsbIpServer<B> {
    /// Bind the listening socket
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<B>,
        registry: Arc<BindingRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            ctx: ExportContext {
                backend,
                registry,
                claims: ClaimTable::new(),
            },
        })
    }

    /// The actual bound address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    /// Accept connections until the process is stopped
    pub async fn run(self) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            debug!("Connection from {}", peer);
            let _ = stream.set_nodelay(true);

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handshake::handle_connection(stream, ctx).await {
                    debug!("Connection from {} ended: {:#}", peer, e);
                }
            });
        }
    }
}
