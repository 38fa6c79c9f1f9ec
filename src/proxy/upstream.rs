//! Upstream connections

use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream to an origin server.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

pub type UpstreamStream = Box<dyn UpstreamIo>;

/// Opens connections to origin servers.
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>>;
}

/// Plain TCP connector used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl UpstreamConnector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, io::Result<UpstreamStream>> {
        let host = host.to_string();
        async move {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as UpstreamStream)
        }
        .boxed()
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connecting to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream {phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },
    #[error("upstream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("invalid upstream response: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Gateway status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
