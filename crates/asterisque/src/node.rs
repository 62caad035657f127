//! The node: one dispatcher serving many concurrent wires.
//!
//! A node owns the `service_id -> Service` registry, the local sealed
//! certificate, and an optional trust context. For every accepted or opened
//! wire it runs the `SyncSession` handshake, authenticates the peer, and
//! publishes a [`Session`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use asterisque_core::{
    Control, DEFAULT_PING_SECS, DEFAULT_QUEUE_CAPACITY, DEFAULT_SESSION_TIMEOUT_SECS, Message,
    PROTOCOL_VERSION, ProtocolError, SyncSession, Wire,
};
use asterisque_trust::{Envelope, TrustContext, sealed_cert_der};

use crate::session::negotiate_options;
use crate::{AuthError, ConnectError, Service, Session};

/// Static configuration of a node.
pub struct NodeOptions {
    /// Service this node requests on its peers.
    pub service_id: String,
    /// Proposed keepalive interval, seconds.
    pub ping_secs: u32,
    /// Proposed idle session timeout, seconds.
    pub session_timeout_secs: u32,
    /// Capacity of each wire's inbound and outbound queues.
    pub queue_capacity: usize,
    /// This node's certificate, sealed by a CA. Required by peers that
    /// authenticate.
    pub sealed_certificate: Option<Envelope>,
    /// Trust material; enables peer authentication and the wss carrier.
    pub trust: Option<Arc<TrustContext>>,
}

impl Default for NodeOptions {
    fn default() -> NodeOptions {
        NodeOptions {
            service_id: String::new(),
            ping_secs: DEFAULT_PING_SECS,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            sealed_certificate: None,
            trust: None,
        }
    }
}

struct NodeInner {
    options: NodeOptions,
    services: RwLock<HashMap<String, Arc<Service>>>,
    sessions: Mutex<HashMap<u64, Session>>,
}

/// A dispatcher for any number of concurrent wires. Clones share state.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(options: NodeOptions) -> Node {
        Node {
            inner: Arc::new(NodeInner {
                options,
                services: RwLock::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Expose a service under `service_id`, replacing any previous binding.
    pub fn register_service(&self, service_id: &str, service: Service) {
        self.inner.services.write().insert(service_id.to_string(), Arc::new(service));
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    /// Run the handshake on a freshly driven wire and publish the session.
    ///
    /// Sends our `Control(SyncSession)`, demands the peer's as its first
    /// message, authenticates it against the trust context if one is
    /// configured, and adopts the negotiated options.
    pub async fn handshake(&self, wire: Wire) -> Result<Session, ConnectError> {
        let primary = wire.is_primary();
        let options = &self.inner.options;

        let mut local = SyncSession::new(&options.service_id);
        local.session_id = if primary { self.fresh_session_id() } else { 0 };
        local.utc_ms = utc_now_ms();
        if let Some(envelope) = &options.sealed_certificate {
            local.sealed_certificate = envelope.to_bytes();
        }
        local
            .config
            .insert(SyncSession::CONFIG_PING.to_string(), options.ping_secs.to_string());
        local.config.insert(
            SyncSession::CONFIG_SESSION_TIMEOUT.to_string(),
            options.session_timeout_secs.to_string(),
        );

        if !wire.outbound().push(Message::Control(Control::SyncSession(local.clone()))).await {
            return Err(ProtocolError::WireClosed.into());
        }

        let peer = match wire.inbound().pop().await {
            Some(Message::Control(Control::SyncSession(sync))) => sync,
            Some(_) => {
                wire.outbound().push(Message::Control(Control::Close)).await;
                wire.close();
                return Err(ProtocolError::HandshakeExpected.into());
            }
            None => return Err(ProtocolError::WireClosed.into()),
        };

        if peer.version >> 8 != PROTOCOL_VERSION >> 8 {
            wire.outbound().push(Message::Control(Control::Close)).await;
            wire.close();
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: peer.version,
            }
            .into());
        }

        if let Some(trust) = &options.trust {
            if let Err(auth) = authenticate(trust, &peer, &wire) {
                tracing::warn!(error = %auth, "peer authentication failed");
                wire.close();
                return Err(auth.into());
            }
        }

        let session_id = if primary { local.session_id } else { peer.session_id };
        let negotiated = negotiate_options(&local, &peer);
        let service = self.inner.services.read().get(&peer.service_id).cloned();
        let session = Session::start(wire.clone(), session_id, local, peer, service, negotiated);

        self.inner.sessions.lock().insert(session_id, session.clone());
        let registry = Arc::downgrade(&self.inner);
        wire.on_close(Arc::new(move |_| {
            if let Some(inner) = registry.upgrade() {
                inner.sessions.lock().remove(&session_id);
            }
        }));
        tracing::info!(session = session_id, primary, "session established");
        Ok(session)
    }

    /// Open a session to a `ws://` or `wss://` endpoint (the connecting side
    /// is the secondary).
    #[cfg(feature = "websocket")]
    pub async fn connect(&self, uri: &str) -> Result<Session, ConnectError> {
        let wire = crate::transport::connect_wire(
            uri,
            self.inner.options.trust.as_ref(),
            self.inner.options.queue_capacity,
        )
        .await?;
        self.handshake(wire).await
    }

    /// Accept sessions on a `ws://` or `wss://` endpoint (the accepting side
    /// is the primary).
    #[cfg(feature = "websocket")]
    pub async fn listen(&self, uri: &str) -> Result<Server, ConnectError> {
        use crate::transport::{parse_uri, ws_error};

        let parsed = parse_uri(uri)?;
        #[cfg(feature = "tls")]
        let tls_acceptor = if parsed.secure {
            let trust = self.inner.options.trust.as_ref().ok_or(ConnectError::TlsRequired)?;
            let require_client_auth = !trust.trusted_cas().is_empty();
            Some(tokio_rustls::TlsAcceptor::from(trust.server_config(require_client_auth)?))
        } else {
            None
        };
        #[cfg(not(feature = "tls"))]
        if parsed.secure {
            return Err(ConnectError::TlsRequired);
        }

        let listener =
            tokio::net::TcpListener::bind((parsed.host.as_str(), parsed.port)).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let node = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (tcp, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed, listener stopping");
                        break;
                    }
                };
                let node = node.clone();
                let tx = tx.clone();
                #[cfg(feature = "tls")]
                let acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    let capacity = node.inner.options.queue_capacity;
                    let wire = Wire::new(true, capacity, capacity);
                    #[cfg(feature = "tls")]
                    let carrier: Result<(), ConnectError> = match &acceptor {
                        Some(acceptor) => {
                            match crate::transport::tls::accept_tls(acceptor, tcp).await {
                                Ok((stream, peer)) => {
                                    wire.set_peer_session(peer);
                                    tokio_tungstenite::accept_async(stream)
                                        .await
                                        .map(|ws| crate::transport::spawn_ws_driver(&wire, ws))
                                        .map_err(ws_error)
                                }
                                Err(e) => Err(e),
                            }
                        }
                        None => tokio_tungstenite::accept_async(tcp)
                            .await
                            .map(|ws| crate::transport::spawn_ws_driver(&wire, ws))
                            .map_err(ws_error),
                    };
                    #[cfg(not(feature = "tls"))]
                    let carrier: Result<(), ConnectError> = tokio_tungstenite::accept_async(tcp)
                        .await
                        .map(|ws| crate::transport::spawn_ws_driver(&wire, ws))
                        .map_err(ws_error);
                    if let Err(e) = carrier {
                        tracing::warn!(peer = %peer_addr, error = %e, "carrier setup failed");
                        return;
                    }
                    match node.handshake(wire).await {
                        Ok(session) => {
                            let _ = tx.send(session).await;
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer_addr, error = %e, "inbound handshake failed");
                        }
                    }
                });
            }
        });

        Ok(Server { local_addr, incoming: rx, handle })
    }

    fn fresh_session_id(&self) -> u64 {
        let sessions = self.inner.sessions.lock();
        loop {
            let id: u64 = rand::random();
            if id != 0 && !sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

fn utc_now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Authenticate a peer's `SyncSession` against the trust context: the
/// envelope must verify, carry a seal from a trusted CA, match the TLS peer
/// certificate list when one exists, and pass path verification.
fn authenticate(
    trust: &Arc<TrustContext>,
    peer: &SyncSession,
    wire: &Wire,
) -> Result<Vec<u8>, AuthError> {
    let envelope =
        Envelope::from_bytes(&peer.sealed_certificate).map_err(AuthError::EnvelopeRejected)?;
    envelope.verify().map_err(AuthError::EnvelopeRejected)?;
    if !envelope.seals().iter().any(|seal| trust.is_trusted_ca(&seal.signer)) {
        return Err(AuthError::SignerNotTrusted);
    }
    let cert = sealed_cert_der(&envelope).map_err(AuthError::EnvelopeRejected)?;
    if let Some(tls) = wire.peer_session() {
        if !tls.certificates.iter().any(|peer_cert| *peer_cert == cert) {
            return Err(AuthError::PeerCertificateMismatch);
        }
    }
    trust.verify(std::slice::from_ref(&cert)).map_err(AuthError::Untrusted)?;
    Ok(cert)
}

/// Handle to a running listener. Dropping it stops the accept loop;
/// established sessions live on.
pub struct Server {
    local_addr: std::net::SocketAddr,
    incoming: tokio::sync::mpsc::Receiver<Session>,
    handle: tokio::task::JoinHandle<()>,
}

impl Server {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// The next accepted session; `None` after the listener stops.
    pub async fn accept(&mut self) -> Option<Session> {
        self.incoming.recv().await
    }

    pub fn close(&self) {
        self.handle.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
