//! # Windows Named Pipes Transport
//!
//! Local named pipes for `ncacn_np` and `ncalrpc` on Windows.
//!
//! A pipe server instance serves exactly one client, so the acceptor keeps
//! one unconnected instance ready and creates the next one as soon as a
//! client attaches.

use std::time::Duration;

use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};
use tracing::{debug, info, instrument};

use crate::error::Result;

/// Windows error code for "all pipe instances are busy".
const ERROR_PIPE_BUSY: i32 = 231;

/// Turn a binding endpoint into a `\pipe\...` suffix.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_start_matches('\\');
    if trimmed.len() >= 5 && trimmed[..5].eq_ignore_ascii_case("pipe\\") {
        format!(r"\{trimmed}")
    } else {
        format!(r"\pipe\{trimmed}")
    }
}

/// Connect to a local pipe, retrying briefly while every instance is busy.
#[instrument]
pub async fn connect(pipe_name: &str) -> Result<NamedPipeClient> {
    loop {
        match ClientOptions::new().open(pipe_name) {
            Ok(client) => {
                debug!("Connected to named pipe");
                return Ok(client);
            }
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub struct PipeAcceptor {
    name: String,
    next: NamedPipeServer,
}

impl PipeAcceptor {
    pub fn bind(pipe_name: &str) -> Result<Self> {
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(pipe_name)?;
        info!(pipe = %pipe_name, "Listening on named pipe");
        Ok(Self {
            name: pipe_name.to_string(),
            next,
        })
    }

    pub async fn accept(&mut self) -> Result<(NamedPipeServer, String)> {
        self.next.connect().await?;
        let fresh = ServerOptions::new().create(&self.name)?;
        let connected = std::mem::replace(&mut self.next, fresh);
        Ok((connected, self.name.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `\pipe\...` part of the name.
    pub fn endpoint(&self) -> &str {
        self.name.strip_prefix(r"\\.").unwrap_or(&self.name)
    }
}
