//! TCP transport (`ncacn_ip_tcp`).

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument};

use crate::error::Result;

/// Dial `host:port` with Nagle disabled; fragments are written whole.
#[instrument]
pub async fn connect(host: &str, port: u16) -> Result<(TcpStream, String)> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?.to_string();
    Ok((stream, peer))
}

pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Port 0 picks an ephemeral port; see [`TcpAcceptor::port`].
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening on TCP");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub async fn accept(&self) -> Result<(TcpStream, String)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}
