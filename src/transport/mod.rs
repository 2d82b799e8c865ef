//! # Transport Layer
//!
//! Byte-stream transports addressed by string bindings.
//!
//! The engine only needs ordered, reliable delivery; every dialer and listener
//! here hands back a [`BoxedStream`] so the connection and association code
//! never learn which transport they run on.
//!
//! ## String Bindings
//! ```text
//! [object-uuid@]protseq:[network-address][endpoint,option=value,...]
//!
//! ncacn_ip_tcp:127.0.0.1[135]
//! ncacn_np:fileserver[\pipe\lsarpc]
//! ncalrpc:[/tmp/rpc.sock]
//! ```
//!
//! ## Supported Transports
//! - **TCP** (`ncacn_ip_tcp`): all platforms
//! - **Local** (`ncalrpc`): Unix domain sockets on Unix, named pipes on Windows
//! - **Named pipes** (`ncacn_np`): local Windows pipes only; remote pipes need
//!   an SMB session layer supplied by the caller

pub mod local;
pub mod tcp;
#[cfg(windows)]
pub mod windows_pipe;

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::core::syntax::Uuid;
use crate::error::{ProtocolError, Result};

/// Any ordered, reliable byte stream.
pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn RpcStream>;

/// Protocol sequences the engine can dial or listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSequence {
    /// Connection-oriented TCP/IP.
    Tcp,
    /// Named pipes over the session layer.
    NamedPipe,
    /// Local inter-process communication.
    Local,
}

impl ProtocolSequence {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolSequence::Tcp => "ncacn_ip_tcp",
            ProtocolSequence::NamedPipe => "ncacn_np",
            ProtocolSequence::Local => "ncalrpc",
        }
    }
}

impl FromStr for ProtocolSequence {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ncacn_ip_tcp" => Ok(ProtocolSequence::Tcp),
            "ncacn_np" => Ok(ProtocolSequence::NamedPipe),
            "ncalrpc" => Ok(ProtocolSequence::Local),
            other => Err(ProtocolError::TransportError(format!(
                "unsupported protocol sequence '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProtocolSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed string binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringBinding {
    pub object: Option<Uuid>,
    pub protseq: ProtocolSequence,
    pub network_address: String,
    pub endpoint: Option<String>,
    pub options: Vec<(String, String)>,
}

impl StringBinding {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            object: None,
            protseq: ProtocolSequence::Tcp,
            network_address: host.into(),
            endpoint: Some(port.to_string()),
            options: Vec::new(),
        }
    }

    pub fn local(endpoint: impl Into<String>) -> Self {
        Self {
            object: None,
            protseq: ProtocolSequence::Local,
            network_address: String::new(),
            endpoint: Some(endpoint.into()),
            options: Vec::new(),
        }
    }

    /// TCP port of an `ncacn_ip_tcp` binding.
    pub fn port(&self) -> Result<u16> {
        let endpoint = self.require_endpoint()?;
        endpoint.parse::<u16>().map_err(|_| {
            ProtocolError::TransportError(format!("TCP endpoint '{endpoint}' is not a port"))
        })
    }

    pub fn require_endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                ProtocolError::TransportError(format!(
                    "binding '{self}' has no endpoint; resolve it first"
                ))
            })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

impl FromStr for StringBinding {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| ProtocolError::TransportError(format!("invalid binding '{s}': {why}"));

        let (object, rest) = match s.split_once('@') {
            Some((uuid, rest)) if !uuid.contains(':') => (Some(uuid.trim().parse::<Uuid>()?), rest),
            _ => (None, s),
        };

        let (protseq, rest) = rest
            .split_once(':')
            .ok_or_else(|| invalid("missing protocol sequence"))?;
        let protseq = protseq.trim().parse::<ProtocolSequence>()?;

        let (network_address, bracket) = match rest.find('[') {
            Some(open) => {
                if !rest.ends_with(']') {
                    return Err(invalid("unterminated endpoint"));
                }
                (&rest[..open], Some(&rest[open + 1..rest.len() - 1]))
            }
            None => (rest, None),
        };
        if network_address.contains(']') {
            return Err(invalid("stray ']'"));
        }

        let mut endpoint = None;
        let mut options = Vec::new();
        if let Some(inner) = bracket {
            for (i, part) in inner.split(',').enumerate() {
                let part = part.trim();
                match part.split_once('=') {
                    Some((k, v)) if k.trim().eq_ignore_ascii_case("endpoint") => {
                        endpoint = Some(v.trim().to_string());
                    }
                    Some((k, v)) => options.push((k.trim().to_string(), v.trim().to_string())),
                    None if i == 0 => {
                        if !part.is_empty() {
                            endpoint = Some(part.to_string());
                        }
                    }
                    None => return Err(invalid("option without a value")),
                }
            }
        }

        let binding = Self {
            object,
            protseq,
            network_address: network_address.trim().to_string(),
            endpoint,
            options,
        };
        if protseq == ProtocolSequence::Tcp && binding.endpoint.is_some() {
            binding.port()?;
        }
        Ok(binding)
    }
}

impl fmt::Display for StringBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(object) = &self.object {
            write!(f, "{object}@")?;
        }
        write!(f, "{}:{}", self.protseq, self.network_address)?;
        if self.endpoint.is_none() && self.options.is_empty() {
            return Ok(());
        }
        f.write_str("[")?;
        if let Some(endpoint) = &self.endpoint {
            f.write_str(endpoint)?;
        }
        for (k, v) in &self.options {
            write!(f, ",{k}={v}")?;
        }
        f.write_str("]")
    }
}

/// Dial `binding`; returns the stream and a printable peer identity.
#[instrument(skip(binding), fields(binding = %binding))]
pub async fn connect(binding: &StringBinding) -> Result<(BoxedStream, String)> {
    let dialed = match binding.protseq {
        ProtocolSequence::Tcp => {
            let host = if binding.network_address.is_empty() {
                "127.0.0.1"
            } else {
                binding.network_address.as_str()
            };
            let (stream, peer) = tcp::connect(host, binding.port()?).await?;
            (Box::new(stream) as BoxedStream, peer)
        }
        ProtocolSequence::Local => local::connect(binding.require_endpoint()?).await?,
        ProtocolSequence::NamedPipe => named_pipe_connect(binding).await?,
    };
    debug!(peer = %dialed.1, "Transport connected");
    Ok(dialed)
}

#[cfg(windows)]
async fn named_pipe_connect(binding: &StringBinding) -> Result<(BoxedStream, String)> {
    let host = match binding.network_address.as_str() {
        "" | "." | "localhost" | "127.0.0.1" => ".",
        _ => {
            return Err(ProtocolError::TransportError(
                "remote named pipes need an SMB session layer".into(),
            ))
        }
    };
    let endpoint = binding.require_endpoint()?;
    let name = format!(r"\\{host}{}", windows_pipe::normalize_endpoint(endpoint));
    let client = windows_pipe::connect(&name).await?;
    Ok((Box::new(client), name))
}

#[cfg(not(windows))]
async fn named_pipe_connect(binding: &StringBinding) -> Result<(BoxedStream, String)> {
    Err(ProtocolError::TransportError(format!(
        "{} needs an SMB session layer on this platform",
        binding.protseq
    )))
}

/// A bound listener for any supported protocol sequence.
pub enum Listener {
    Tcp(tcp::TcpAcceptor),
    #[cfg(unix)]
    Local(local::LocalAcceptor),
    #[cfg(windows)]
    Pipe(windows_pipe::PipeAcceptor),
}

impl Listener {
    /// Start listening on `binding`.
    pub async fn bind(binding: &StringBinding) -> Result<Self> {
        match binding.protseq {
            ProtocolSequence::Tcp => {
                let host = if binding.network_address.is_empty() {
                    "0.0.0.0"
                } else {
                    binding.network_address.as_str()
                };
                Ok(Listener::Tcp(tcp::TcpAcceptor::bind(host, binding.port()?).await?))
            }
            #[cfg(unix)]
            ProtocolSequence::Local => Ok(Listener::Local(local::LocalAcceptor::bind(
                binding.require_endpoint()?,
            )?)),
            #[cfg(windows)]
            ProtocolSequence::Local | ProtocolSequence::NamedPipe => {
                let name = format!(
                    r"\\.{}",
                    windows_pipe::normalize_endpoint(binding.require_endpoint()?)
                );
                Ok(Listener::Pipe(windows_pipe::PipeAcceptor::bind(&name)?))
            }
            #[cfg(not(windows))]
            ProtocolSequence::NamedPipe => Err(ProtocolError::TransportError(
                "ncacn_np listeners need an SMB session layer on this platform".into(),
            )),
        }
    }

    /// Wait for the next client.
    pub async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(acceptor) => {
                let (stream, peer) = acceptor.accept().await?;
                Ok((Box::new(stream), peer))
            }
            #[cfg(unix)]
            Listener::Local(acceptor) => {
                let (stream, peer) = acceptor.accept().await?;
                Ok((Box::new(stream), peer))
            }
            #[cfg(windows)]
            Listener::Pipe(acceptor) => {
                let (pipe, peer) = acceptor.accept().await?;
                Ok((Box::new(pipe), peer))
            }
        }
    }

    /// Secondary address advertised in bind acknowledgements.
    pub fn secondary_address(&self) -> String {
        match self {
            Listener::Tcp(acceptor) => acceptor.port().to_string(),
            #[cfg(unix)]
            Listener::Local(acceptor) => acceptor.path().display().to_string(),
            #[cfg(windows)]
            Listener::Pipe(acceptor) => acceptor.name().to_string(),
        }
    }

    /// Binding a client can dial to reach this listener.
    pub fn local_binding(&self) -> StringBinding {
        match self {
            Listener::Tcp(acceptor) => {
                let addr = acceptor.local_addr();
                let host = if addr.ip().is_unspecified() {
                    "127.0.0.1".to_string()
                } else {
                    addr.ip().to_string()
                };
                StringBinding::tcp(host, addr.port())
            }
            #[cfg(unix)]
            Listener::Local(acceptor) => {
                StringBinding::local(acceptor.path().display().to_string())
            }
            #[cfg(windows)]
            Listener::Pipe(acceptor) => StringBinding::local(acceptor.endpoint().to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_binding() {
        let b: StringBinding = "ncacn_ip_tcp:10.0.0.5[49664]".parse().unwrap();
        assert_eq!(b.protseq, ProtocolSequence::Tcp);
        assert_eq!(b.network_address, "10.0.0.5");
        assert_eq!(b.port().unwrap(), 49664);
        assert_eq!(b.to_string(), "ncacn_ip_tcp:10.0.0.5[49664]");
    }

    #[test]
    fn test_parse_pipe_binding_with_options() {
        let b: StringBinding = r"ncacn_np:fs01[\pipe\lsarpc,security=impersonation]"
            .parse()
            .unwrap();
        assert_eq!(b.protseq, ProtocolSequence::NamedPipe);
        assert_eq!(b.endpoint.as_deref(), Some(r"\pipe\lsarpc"));
        assert_eq!(b.option("SECURITY"), Some("impersonation"));
    }

    #[test]
    fn test_parse_object_and_local() {
        let b: StringBinding = "12345678-1234-abcd-ef00-0123456789ab@ncalrpc:[/tmp/rpc.sock]"
            .parse()
            .unwrap();
        assert!(b.object.is_some());
        assert_eq!(b.protseq, ProtocolSequence::Local);
        assert!(b.network_address.is_empty());
        assert_eq!(b.require_endpoint().unwrap(), "/tmp/rpc.sock");
    }

    #[test]
    fn test_endpoint_keyword_and_missing_endpoint() {
        let b: StringBinding = "ncacn_ip_tcp:host[endpoint=135]".parse().unwrap();
        assert_eq!(b.port().unwrap(), 135);

        let bare: StringBinding = "ncacn_ip_tcp:host".parse().unwrap();
        assert!(bare.endpoint.is_none());
        assert!(bare.port().is_err());
    }

    #[test]
    fn test_rejects_malformed_bindings() {
        assert!("ncacn_http:host[80]".parse::<StringBinding>().is_err());
        assert!("ncacn_ip_tcp:host[80".parse::<StringBinding>().is_err());
        assert!("ncacn_ip_tcp:host[http]".parse::<StringBinding>().is_err());
        assert!("no-protseq".parse::<StringBinding>().is_err());
        assert!("ncacn_ip_tcp:host[80,flag]".parse::<StringBinding>().is_err());
    }
}
