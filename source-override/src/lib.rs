//! Source-override proxying for iterative development.
//!
//! A deployment controller normally fetches sources (git checkouts, OCI
//! artifacts) from their remote locations. During iterative development an
//! operator can substitute a directory on their workstation for one of those
//! sources: the workstation runs an [`OverrideServer`] and the controller
//! side uses a [`ResolveClient`] to look overrides up over a single
//! authenticated stream, optionally tunneled through a pod port-forward
//! ([`Tunnel`]). Matched directories travel as size-bounded gzipped tar
//! artifacts and are extracted into per-source temporary directories that the
//! client caches and owns until [`ResolveClient::cleanup`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod archive;
mod cache;
mod client;
mod key;
pub mod proto;
mod resolver;
mod server;
mod session;
mod tunnel;

pub use self::client::{ResolveClient, ResolveError};
pub use self::key::{KeyError, OverrideRule, SourceKey};
pub use self::resolver::{Resolver, RuleResolver};
pub use self::server::OverrideServer;
pub use self::session::{ProtocolError, SessionState};
pub use self::tunnel::{Tunnel, TunnelError};

use url::Url;

/// The container port name the tunnel looks for on the target pod.
pub const SOURCE_OVERRIDE_PORT_NAME: &str = "source-override";

/// Scheme used in routing URLs that advertise an override session.
pub const SOURCE_OVERRIDE_SCHEME: &str = "flotilla-source-override";

/// Builds the routing URL for a session: the session id rides in the path so
/// a single listener address can advertise distinct sessions.
pub fn proxy_url(host: &str, session_id: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{SOURCE_OVERRIDE_SCHEME}://{host}/{session_id}"))
}

/// Size and time limits for the proxy subsystem. All limits fail closed.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum size of a built artifact, checked before any bytes are sent.
    pub max_artifact_size: u64,

    /// Maximum expanded size accepted when extracting an artifact.
    pub max_extract_size: u64,

    /// Maximum size of a single protocol frame.
    pub max_frame_size: usize,

    /// How long to wait for a port-forward to become ready.
    pub tunnel_ready_timeout: std::time::Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_artifact_size: 32 * 1024 * 1024,
            max_extract_size: 256 * 1024 * 1024,
            // One full artifact plus framing slack.
            max_frame_size: 33 * 1024 * 1024,
            tunnel_ready_timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_embeds_session_in_path() {
        let url = proxy_url("10.0.0.7:9443", "d4c71522").unwrap();
        assert_eq!(url.scheme(), SOURCE_OVERRIDE_SCHEME);
        assert_eq!(url.path(), "/d4c71522");
        assert_eq!(url.host_str(), Some("10.0.0.7"));
        assert_eq!(url.port(), Some(9443));
    }
}
