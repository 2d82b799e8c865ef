//! Local transport (`ncalrpc`).
//!
//! On Unix the endpoint is a socket path. On Windows it names a local pipe
//! and the work is delegated to [`crate::transport::windows_pipe`].

#[cfg(unix)]
use std::path::{Path, PathBuf};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use tracing::{error, info};

use crate::error::Result;
use crate::transport::BoxedStream;

/// Connect to a local endpoint.
#[cfg(unix)]
pub async fn connect(endpoint: &str) -> Result<(BoxedStream, String)> {
    let stream = UnixStream::connect(endpoint).await?;
    Ok((Box::new(stream), endpoint.to_string()))
}

#[cfg(windows)]
pub async fn connect(endpoint: &str) -> Result<(BoxedStream, String)> {
    use crate::transport::windows_pipe;

    let name = format!(r"\\.{}", windows_pipe::normalize_endpoint(endpoint));
    let client = windows_pipe::connect(&name).await?;
    Ok((Box::new(client), name))
}

/// Unix socket listener that removes its socket file when dropped.
#[cfg(unix)]
pub struct LocalAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl LocalAcceptor {
    /// Bind `path`, replacing a stale socket file left by an earlier run.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path).ok();
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Listening on unix socket");
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<(UnixStream, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((stream, self.path.display().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
impl Drop for LocalAcceptor {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                error!(error = %e, path = %self.path.display(), "Failed to remove socket file");
            } else {
                info!(path = %self.path.display(), "Removed socket file");
            }
        }
    }
}
