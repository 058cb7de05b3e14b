use crate::archive;
use crate::key::SourceKey;
use crate::proto::{Channel, ClientFrame, ResolveRequest, ResolveResponse, ServerFrame};
use crate::resolver::Resolver;
use crate::session::{ProtocolError, SessionState};
use crate::Limits;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Workstation-side endpoint: authenticates inbound sessions and serves
/// resolve requests from a [`Resolver`], packaging matched directories as
/// size-capped artifacts.
pub struct OverrideServer<R> {
    session_id: String,
    resolver: Arc<R>,
    limits: Limits,
    tmp_root: PathBuf,
}

// === impl OverrideServer ===

impl<R: Resolver + 'static> OverrideServer<R> {
    /// `session_id` is the id this server accepts; it is the one embedded in
    /// the routing URL handed to the peer.
    pub fn new(session_id: impl Into<String>, resolver: R, limits: Limits) -> Self {
        Self {
            session_id: session_id.into(),
            resolver: Arc::new(resolver),
            limits,
            tmp_root: std::env::temp_dir(),
        }
    }

    /// Overrides where artifact staging files are created.
    pub fn with_tmp_root(mut self, tmp_root: impl Into<PathBuf>) -> Self {
        self.tmp_root = tmp_root.into();
        self
    }

    /// The routing URL advertising this server's session at `host`.
    pub fn proxy_url(&self, host: &str) -> Result<url::Url, url::ParseError> {
        crate::proxy_url(host, &self.session_id)
    }

    /// Serves one session over `io` until the stream closes, the peer
    /// violates the protocol, or transport I/O fails.
    ///
    /// Per-request failures (bad key, resolver error, oversized artifact)
    /// are reported in the response error field and do not end the session.
    pub async fn serve<S>(&self, io: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = Channel::new(io, self.limits.max_frame_size);
        let mut state = SessionState::Unauthenticated;

        // Handshake: the first frame must carry auth and nothing else.
        let first: ClientFrame = channel
            .recv()
            .await?
            .ok_or(ProtocolError::UnexpectedEof)?;
        let refusal = match &first.auth {
            None => Some("first message must carry auth".to_string()),
            Some(_) if first.request.is_some() => {
                Some("handshake frame must not carry a request".to_string())
            }
            Some(auth) if auth.session_id != self.session_id => {
                Some(format!("unknown session id {}", auth.session_id))
            }
            Some(_) => None,
        };
        if let Some(error) = refusal {
            channel
                .send(&ServerFrame {
                    auth_error: Some(error.clone()),
                    response: None,
                })
                .await?;
            return Err(ProtocolError::HandshakeFailed(error));
        }
        channel
            .send(&ServerFrame {
                auth_error: Some(String::new()),
                response: None,
            })
            .await?;
        state = state.authenticate()?;
        tracing::debug!(session.id = %self.session_id, "session authenticated");

        // Strictly serialized serve loop: one request in flight at a time.
        loop {
            let frame: ClientFrame = match channel.recv().await? {
                Some(frame) => frame,
                None => {
                    tracing::debug!(session.id = %self.session_id, "session ended");
                    return Ok(());
                }
            };
            if frame.auth.is_some() {
                return Err(ProtocolError::UnexpectedAuth);
            }
            let request = frame.request.ok_or(ProtocolError::MissingRequest)?;

            state = state.begin_request()?;
            let response = match self.handle_request(&request).await {
                Ok(artifact) => ResolveResponse {
                    artifact,
                    error: None,
                },
                Err(error) => {
                    let error = format!("{error:#}");
                    tracing::warn!(key = %request.source_key, %error, "resolve request failed");
                    ResolveResponse {
                        artifact: None,
                        error: Some(error),
                    }
                }
            };
            channel
                .send(&ServerFrame {
                    auth_error: None,
                    response: Some(response),
                })
                .await?;
            state = state.complete_request();
        }
    }

    /// Accepts connections until `shutdown` fires, serving each on its own
    /// task.
    pub async fn listen(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let server = Arc::new(self);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(error) = server.serve(stream).await {
                            tracing::warn!(%error, %peer, "session failed");
                        }
                    });
                }
            }
        }
    }

    async fn handle_request(&self, request: &ResolveRequest) -> anyhow::Result<Option<Vec<u8>>> {
        let key: SourceKey = request
            .source_key
            .parse()
            .context("invalid source key")?;

        let path = self
            .resolver
            .resolve(&key)
            .await
            .context("resolve override failed")?;
        let Some(path) = path else {
            return Ok(None);
        };

        tracing::info!(%key, path = %path.display(), "controller requested source override");

        let tmp_root = self.tmp_root.clone();
        let max_artifact_size = self.limits.max_artifact_size;
        let artifact =
            tokio::task::spawn_blocking(move || archive::pack(&path, &tmp_root, max_artifact_size))
                .await
                .context("artifact build task failed")?
                .context("failed to build artifact")?;

        tracing::info!(size = artifact.len(), "sending source override artifact");
        Ok(Some(artifact))
    }
}
