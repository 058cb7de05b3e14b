//! Wire messages and framing for the override protocol.
//!
//! One stream carries exactly one session. Frames are length-delimited
//! protobuf messages: the dialing side sends [`ClientFrame`]s and the
//! accepting side answers with [`ServerFrame`]s in strict alternation. The
//! first exchange must be the auth handshake; everything after it is one
//! resolve request/response pair at a time.

use crate::session::ProtocolError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub session_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResolveRequest {
    /// Canonical text form of a [`crate::SourceKey`].
    #[prost(string, tag = "1")]
    pub source_key: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResolveResponse {
    /// Gzipped tar artifact. Absent together with `error` means the peer has
    /// no override for the requested key.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub artifact: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,

    /// Per-request failure. The session remains usable.
    #[prost(string, optional, tag = "2")]
    pub error: ::core::option::Option<::prost::alloc::string::String>,
}

/// Envelope for every frame sent by the dialing (controller) side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientFrame {
    #[prost(message, optional, tag = "1")]
    pub auth: ::core::option::Option<AuthRequest>,

    #[prost(message, optional, tag = "2")]
    pub request: ::core::option::Option<ResolveRequest>,
}

/// Envelope for every frame sent by the accepting (workstation) side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerFrame {
    /// Handshake status. Must be present in the handshake reply; empty means
    /// the session was accepted.
    #[prost(string, optional, tag = "1")]
    pub auth_error: ::core::option::Option<::prost::alloc::string::String>,

    #[prost(message, optional, tag = "2")]
    pub response: ::core::option::Option<ResolveResponse>,
}

/// A protobuf message channel over any byte stream, with a hard cap on
/// frame size in both directions.
pub struct Channel<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

// === impl Channel ===

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, max_frame_size: usize) -> Self {
        let framed = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_framed(io);
        Self { framed }
    }

    pub async fn send<M: prost::Message>(&mut self, msg: &M) -> Result<(), ProtocolError> {
        self.framed.send(Bytes::from(msg.encode_to_vec())).await?;
        Ok(())
    }

    /// Receives the next frame. `Ok(None)` is a clean end of stream.
    pub async fn recv<M: prost::Message + Default>(&mut self) -> Result<Option<M>, ProtocolError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(frame) => Ok(Some(M::decode(frame?.freeze())?)),
        }
    }

    /// Flushes and shuts down the write half.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.framed.close().await?;
        Ok(())
    }
}
