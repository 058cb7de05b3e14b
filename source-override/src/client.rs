use crate::archive::{self, ArchiveError};
use crate::cache::SingleFlight;
use crate::key::{OverrideRule, SourceKey};
use crate::proto::{AuthRequest, Channel, ClientFrame, ResolveRequest, ServerFrame};
use crate::session::{ProtocolError, SessionState};
use crate::Limits;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Errors surfaced by [`ResolveClient::resolve_override`].
///
/// "No override" is not an error; it is the `Ok(None)` result. The variants
/// distinguish a failure reported by the peer from a failure extracting the
/// artifact locally.
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    #[error("client is not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("peer reported failure: {0}")]
    Peer(String),

    #[error("failed to extract artifact: {0}")]
    Extract(Arc<ArchiveError>),
}

impl From<ProtocolError> for ResolveError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(Arc::new(e))
    }
}

impl From<ArchiveError> for ResolveError {
    fn from(e: ArchiveError) -> Self {
        Self::Extract(Arc::new(e))
    }
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

struct Conn {
    channel: Channel<Box<dyn Io>>,
    state: SessionState,
}

/// Controller-side endpoint: dials an override server, authenticates, and
/// resolves source keys to locally extracted override directories.
///
/// Resolutions are memoized per key with single-flight semantics; the
/// extracted directories are owned by this client until [`cleanup`] removes
/// them.
///
/// [`cleanup`]: ResolveClient::cleanup
pub struct ResolveClient {
    session_id: String,
    known: Vec<OverrideRule>,
    limits: Limits,
    tmp_root: PathBuf,
    conn: tokio::sync::Mutex<Option<Conn>>,
    cache: SingleFlight<SourceKey, Option<PathBuf>, ResolveError>,
}

// === impl ResolveClient ===

impl ResolveClient {
    /// Creates a disconnected client with a freshly generated session id.
    pub fn new(limits: Limits) -> Self {
        Self::with_session_id(uuid::Uuid::new_v4().to_string(), limits)
    }

    pub fn with_session_id(session_id: impl Into<String>, limits: Limits) -> Self {
        Self {
            session_id: session_id.into(),
            known: Vec::new(),
            limits,
            tmp_root: std::env::temp_dir(),
            conn: tokio::sync::Mutex::new(None),
            cache: SingleFlight::new(),
        }
    }

    /// Overrides where extracted directories are created.
    pub fn with_tmp_root(mut self, tmp_root: impl Into<PathBuf>) -> Self {
        self.tmp_root = tmp_root.into();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The routing URL advertising this client's session at `host`.
    pub fn build_proxy_url(&self, host: &str) -> Result<Url, url::ParseError> {
        crate::proxy_url(host, &self.session_id)
    }

    /// Registers a rule consulted before any network call: keys matching no
    /// registered rule resolve to "no override" without contacting the peer.
    pub fn add_known_override(&mut self, rule: OverrideRule) {
        self.known.push(rule);
    }

    /// Dials `addr` (a tunnel's local address or a direct target) and
    /// performs the handshake.
    pub async fn connect(&mut self, addr: impl tokio::net::ToSocketAddrs) -> Result<(), ProtocolError> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        self.connect_io(stream).await
    }

    /// Performs the handshake over an already established stream.
    pub async fn connect_io<S>(&mut self, io: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut channel = Channel::new(Box::new(io) as Box<dyn Io>, self.limits.max_frame_size);
        let state = SessionState::Unauthenticated;

        channel
            .send(&ClientFrame {
                auth: Some(AuthRequest {
                    session_id: self.session_id.clone(),
                }),
                request: None,
            })
            .await?;

        let reply: ServerFrame = channel
            .recv()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)?;
        let state = match reply.auth_error {
            None => return Err(ProtocolError::MissingAuthStatus),
            Some(error) if !error.is_empty() => {
                return Err(ProtocolError::HandshakeFailed(error))
            }
            Some(_) => state.authenticate()?,
        };
        tracing::debug!(session.id = %self.session_id, "session authenticated");

        *self.conn.get_mut() = Some(Conn { channel, state });
        Ok(())
    }

    /// Resolves `key` to a local override directory, `Ok(None)` when no
    /// override applies, or an error.
    ///
    /// Concurrent calls for the same key collapse into one resolution;
    /// errors are surfaced to the callers that observed them but never
    /// cached.
    pub async fn resolve_override(
        &self,
        key: &SourceKey,
    ) -> Result<Option<PathBuf>, ResolveError> {
        if !self.known.iter().any(|rule| rule.matches(key)) {
            return Ok(None);
        }
        self.cache
            .get_or_resolve(key, || self.do_resolve(key))
            .await
    }

    async fn do_resolve(&self, key: &SourceKey) -> Result<Option<PathBuf>, ResolveError> {
        let response = self.exchange(key).await?;

        if let Some(error) = response.error {
            return Err(ResolveError::Peer(error));
        }
        let Some(artifact) = response.artifact else {
            tracing::debug!(%key, "peer has no override");
            return Ok(None);
        };

        let dir = tempfile::Builder::new()
            .prefix("source-override-")
            .tempdir_in(&self.tmp_root)
            .map_err(ArchiveError::Io)?;
        let max_extract_size = self.limits.max_extract_size;
        // The tempdir is removed on drop, so a failed extraction leaves
        // nothing behind; only a fully extracted directory is kept.
        let dir = tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir, ArchiveError> {
            archive::unpack(&artifact, dir.path(), max_extract_size)?;
            Ok(dir)
        })
        .await
        .map_err(|e| ArchiveError::Io(std::io::Error::other(e)))??;

        let path = dir.keep();
        tracing::info!(%key, path = %path.display(), "cached source override");
        Ok(Some(path))
    }

    /// Runs one strictly serialized request/response exchange.
    async fn exchange(&self, key: &SourceKey) -> Result<crate::proto::ResolveResponse, ResolveError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ResolveError::NotConnected)?;

        conn.state = conn.state.begin_request()?;
        conn.channel
            .send(&ClientFrame {
                auth: None,
                request: Some(ResolveRequest {
                    source_key: key.to_string(),
                }),
            })
            .await?;
        let frame: ServerFrame = conn
            .channel
            .recv()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)?;
        let response = frame.response.ok_or(ProtocolError::MissingResponse)?;
        conn.state = conn.state.complete_request();
        Ok(response)
    }

    /// Removes every directory this client extracted. Idempotent; intended
    /// to run once at controller shutdown.
    pub async fn cleanup(&self) {
        for path in self.cache.take_ready().into_iter().flatten() {
            if let Err(error) = tokio::fs::remove_dir_all(&path).await {
                tracing::warn!(%error, path = %path.display(), "failed to remove override dir");
            }
        }
    }

    /// Closes the underlying connection.
    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.state = conn.state.close();
            if let Err(error) = conn.channel.close().await {
                tracing::debug!(%error, "error closing session stream");
            }
        }
    }
}
