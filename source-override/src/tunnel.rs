use crate::SOURCE_OVERRIDE_PORT_NAME;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("pod {pod} has no container port named {SOURCE_OVERRIDE_PORT_NAME}")]
    PortNotFound { pod: String },

    #[error("pod {pod} has no address")]
    AddressNotFound { pod: String },

    #[error("timed out waiting for the port forward to become ready")]
    ReadyTimeout,

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Factory(#[from] flotilla_k8s::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A port-forward to the `source-override` container port of a pod,
/// surfaced as a local listening address for the protocol layer to dial.
///
/// The forwarding loop runs as a background task owned by this value; it is
/// torn down when [`Tunnel::shutdown`] is called or the tunnel is dropped.
pub struct Tunnel {
    local_addr: SocketAddr,
    pod_addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

// === impl Tunnel ===

impl Tunnel {
    /// Establishes the tunnel, verifying within `ready_timeout` that the pod
    /// accepts a forward before advertising a local address.
    pub async fn establish(
        client: kube::Client,
        namespace: &str,
        pod_name: &str,
        ready_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let pod = pods.get(pod_name).await?;
        let port = container_port(&pod, SOURCE_OVERRIDE_PORT_NAME).ok_or_else(|| {
            TunnelError::PortNotFound {
                pod: pod_name.to_string(),
            }
        })?;
        let pod_addr = pod_addr(&pod, port).ok_or_else(|| TunnelError::AddressNotFound {
            pod: pod_name.to_string(),
        })?;

        // Readiness probe: one throwaway forward proves the pod is
        // reachable before a local address is handed out.
        let probe = tokio::time::timeout(ready_timeout, pods.portforward(pod_name, &[port]))
            .await
            .map_err(|_| TunnelError::ReadyTimeout)??;
        drop(probe);

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, pod = %pod_name, port, "source override tunnel ready");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_loop(
            listener,
            pods,
            pod_name.to_string(),
            port,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            pod_addr,
            cancel,
            task,
        })
    }

    /// Like [`Tunnel::establish`], with the client drawn from the shared
    /// factory.
    pub async fn establish_via(
        factory: &flotilla_k8s::ClientFactory,
        namespace: &str,
        pod_name: &str,
        ready_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        Self::establish(factory.client()?, namespace, pod_name, ready_timeout).await
    }

    /// The local address the protocol layer should dial.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The pod's own address for the override port, reachable from inside
    /// the cluster.
    pub fn pod_addr(&self) -> SocketAddr {
        self.pod_addr
    }

    /// The routing URL advertising `session_id` at the pod's own address,
    /// for controllers that reach the pod directly rather than through this
    /// tunnel.
    pub fn proxy_url(&self, session_id: &str) -> Result<url::Url, url::ParseError> {
        crate::proxy_url(&self.pod_addr.to_string(), session_id)
    }

    /// Tears the forward down and waits for the background task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn forward_loop(
    listener: TcpListener,
    pods: Api<Pod>,
    pod_name: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (mut local, peer) = match accepted {
            Ok(conn) => conn,
            Err(error) => {
                tracing::warn!(%error, "tunnel accept failed");
                continue;
            }
        };

        let pods = pods.clone();
        let pod_name = pod_name.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut pf = match pods.portforward(&pod_name, &[port]).await {
                Ok(pf) => pf,
                Err(error) => {
                    tracing::warn!(%error, pod = %pod_name, "port forward failed");
                    return;
                }
            };
            let Some(mut remote) = pf.take_stream(port) else {
                tracing::warn!(pod = %pod_name, port, "port forward returned no stream");
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                    if let Err(error) = res {
                        tracing::debug!(%error, %peer, "forwarded connection ended");
                    }
                }
            }
        });
    }
}

fn container_port(pod: &Pod, name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .and_then(|p| u16::try_from(p.container_port).ok())
}

fn pod_addr(pod: &Pod, port: u16) -> Option<SocketAddr> {
    let ip: IpAddr = pod.status.as_ref()?.pod_ip.as_deref()?.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}
