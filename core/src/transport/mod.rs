//! The rendezvous between the replay engine and the in-service SDK.
//!
//! The engine binds a listener before the service is started and tells the
//! SDK where to find it through two environment variables: a filesystem
//! socket path on platforms that have them, or a loopback TCP port as the
//! fallback. Both carry the same framed envelope stream.

mod frame;

pub use frame::read_frame;
pub use frame::write_frame;

use std::io;
use std::path::PathBuf;

use drift_protocol::Envelope;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::CommunicationType;
use crate::error::DriftError;
use crate::error::Result;

/// Environment variable carrying the filesystem rendezvous path.
pub const MOCK_SOCKET_ENV: &str = "TUSK_MOCK_SOCKET";
/// Environment variable carrying the TCP fallback port.
pub const MOCK_TCP_PORT_ENV: &str = "TUSK_MOCK_TCP_PORT";

/// Where the listener ended up; injected into the service's environment.
#[derive(Clone, Debug, Default)]
pub struct TransportEndpoint {
    pub socket_path: Option<PathBuf>,
    pub tcp_port: Option<u16>,
}

impl TransportEndpoint {
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(path) = &self.socket_path {
            vars.push((MOCK_SOCKET_ENV.to_string(), path.display().to_string()));
        }
        if let Some(port) = self.tcp_port {
            vars.push((MOCK_TCP_PORT_ENV.to_string(), port.to_string()));
        }
        vars
    }
}

pub enum TransportListener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp { listener: TcpListener, port: u16 },
}

impl TransportListener {
    /// Binds the rendezvous. `Auto` prefers the filesystem socket on
    /// platforms that support it.
    pub async fn bind(kind: CommunicationType) -> Result<Self> {
        match kind {
            #[cfg(unix)]
            CommunicationType::Auto | CommunicationType::Unix => Self::bind_unix(),
            #[cfg(not(unix))]
            CommunicationType::Auto => Self::bind_tcp().await,
            #[cfg(not(unix))]
            CommunicationType::Unix => Err(DriftError::Transport(
                "filesystem sockets are not available on this platform".to_string(),
            )),
            CommunicationType::Tcp => Self::bind_tcp().await,
        }
    }

    #[cfg(unix)]
    fn bind_unix() -> Result<Self> {
        use std::sync::atomic::AtomicU64;
        use std::sync::atomic::Ordering;

        // One process may host several engines (tests do); keep paths unique.
        static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);
        let nonce = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "tusk-mock-{}-{nonce}.sock",
            std::process::id()
        ));
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path).map_err(|err| {
            DriftError::Transport(format!(
                "failed to bind rendezvous socket {}: {err}",
                path.display()
            ))
        })?;
        debug!(path = %path.display(), "mock rendezvous bound");
        Ok(Self::Unix { listener, path })
    }

    async fn bind_tcp() -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| DriftError::Transport(format!("failed to bind loopback port: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| DriftError::Transport(err.to_string()))?
            .port();
        debug!(port, "mock rendezvous bound");
        Ok(Self::Tcp { listener, port })
    }

    pub fn endpoint(&self) -> TransportEndpoint {
        match self {
            #[cfg(unix)]
            Self::Unix { path, .. } => TransportEndpoint {
                socket_path: Some(path.clone()),
                tcp_port: None,
            },
            Self::Tcp { port, .. } => TransportEndpoint {
                socket_path: None,
                tcp_port: Some(*port),
            },
        }
    }

    pub async fn accept(&self) -> io::Result<TransportStream> {
        match self {
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(TransportStream::Unix(stream))
            }
            Self::Tcp { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(TransportStream::Tcp(stream))
            }
        }
    }

    /// Removes the filesystem rendezvous, if any. Dropping the listener
    /// closes the socket itself.
    pub fn cleanup(&self) {
        #[cfg(unix)]
        if let Self::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub enum TransportStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl TransportStream {
    /// Connects to a previously published endpoint. Used by tests and by
    /// SDK shims running in-process.
    pub async fn connect(endpoint: &TransportEndpoint) -> io::Result<Self> {
        #[cfg(unix)]
        if let Some(path) = &endpoint.socket_path {
            return Ok(Self::Unix(UnixStream::connect(path).await?));
        }
        match endpoint.tcp_port {
            Some(port) => Ok(Self::Tcp(TcpStream::connect(("127.0.0.1", port)).await?)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "transport endpoint has no usable address",
            )),
        }
    }

    /// Reads one envelope; `None` on clean peer close.
    pub async fn read_envelope(&mut self) -> io::Result<Option<Envelope>> {
        let payload = match self {
            #[cfg(unix)]
            Self::Unix(stream) => read_frame(stream).await?,
            Self::Tcp(stream) => read_frame(stream).await?,
        };
        match payload {
            None => Ok(None),
            Some(payload) => Envelope::decode(&payload)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> io::Result<()> {
        let payload = envelope
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        match self {
            #[cfg(unix)]
            Self::Unix(stream) => write_frame(stream, &payload).await,
            Self::Tcp(stream) => write_frame(stream, &payload).await,
        }
    }
}
