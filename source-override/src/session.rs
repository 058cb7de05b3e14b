use thiserror::Error;

/// Lifecycle of one authenticated stream.
///
/// Both endpoints drive the same machine: a session starts unauthenticated,
/// becomes authenticated after a successful handshake exchange, and spends
/// the rest of its life alternating between `Authenticated` (idle) and
/// `Serving` (one resolve exchange in flight). There is never more than one
/// outstanding request on a stream, so responses correlate to requests by
/// arrival order alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Serving,
    Closed,
}

/// Errors that are fatal to a session. Per-request failures travel in the
/// response error field instead and leave the session usable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake reply is missing the auth status field")]
    MissingAuthStatus,

    #[error("first frame on a session must carry auth")]
    ExpectedAuth,

    #[error("auth frame received on an authenticated session")]
    UnexpectedAuth,

    #[error("frame is missing the resolve request")]
    MissingRequest,

    #[error("frame is missing the resolve response")]
    MissingResponse,

    #[error("stream ended mid-exchange")]
    UnexpectedEof,

    #[error("session is closed")]
    SessionClosed,

    #[error("an exchange was abandoned mid-flight; the session cannot be reused")]
    Desynchronized,

    #[error(transparent)]
    Transport(#[from] std::io::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

// === impl SessionState ===

impl SessionState {
    /// Transition taken by a successful handshake exchange.
    pub fn authenticate(self) -> Result<Self, ProtocolError> {
        match self {
            Self::Unauthenticated => Ok(Self::Authenticated),
            Self::Authenticated | Self::Serving => Err(ProtocolError::UnexpectedAuth),
            Self::Closed => Err(ProtocolError::SessionClosed),
        }
    }

    /// Transition taken when a resolve exchange starts.
    ///
    /// A session still in `Serving` had its previous exchange abandoned
    /// (e.g. a cancelled caller); the stream may hold a stale response, so
    /// the session is unusable rather than silently miscorrelated.
    pub fn begin_request(self) -> Result<Self, ProtocolError> {
        match self {
            Self::Authenticated => Ok(Self::Serving),
            Self::Unauthenticated => Err(ProtocolError::ExpectedAuth),
            Self::Serving => Err(ProtocolError::Desynchronized),
            Self::Closed => Err(ProtocolError::SessionClosed),
        }
    }

    /// Transition taken when the response for the in-flight request has been
    /// fully exchanged.
    pub fn complete_request(self) -> Self {
        debug_assert_eq!(self, Self::Serving);
        Self::Authenticated
    }

    pub fn close(self) -> Self {
        Self::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_then_serve() {
        let state = SessionState::Unauthenticated.authenticate().unwrap();
        assert_eq!(state, SessionState::Authenticated);
        let state = state.begin_request().unwrap();
        assert_eq!(state, SessionState::Serving);
        assert_eq!(state.complete_request(), SessionState::Authenticated);
    }

    #[test]
    fn requests_require_auth() {
        assert!(matches!(
            SessionState::Unauthenticated.begin_request(),
            Err(ProtocolError::ExpectedAuth)
        ));
    }

    #[test]
    fn second_auth_is_rejected() {
        assert!(matches!(
            SessionState::Authenticated.authenticate(),
            Err(ProtocolError::UnexpectedAuth)
        ));
    }

    #[test]
    fn abandoned_exchange_poisons_the_session() {
        let serving = SessionState::Authenticated.begin_request().unwrap();
        assert!(matches!(
            serving.begin_request(),
            Err(ProtocolError::Desynchronized)
        ));
    }

    #[test]
    fn closed_is_terminal() {
        let closed = SessionState::Authenticated.close();
        assert!(matches!(
            closed.begin_request(),
            Err(ProtocolError::SessionClosed)
        ));
        assert!(matches!(
            closed.authenticate(),
            Err(ProtocolError::SessionClosed)
        ));
    }
}
