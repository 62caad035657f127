use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use asterisque_core::PeerSession;

use crate::ConnectError;

/// Complete a client TLS handshake and capture the peer view.
pub(crate) async fn connect_tls(
    host: &str,
    config: Arc<rustls::ClientConfig>,
    tcp: TcpStream,
) -> Result<(client::TlsStream<TcpStream>, PeerSession), ConnectError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ConnectError::BadUri(format!("invalid host name: {}", host)))?;
    let stream = TlsConnector::from(config).connect(server_name, tcp).await?;
    let peer = peer_session(stream.get_ref().1);
    Ok((stream, peer))
}

/// Complete a server TLS handshake and capture the peer view.
pub(crate) async fn accept_tls(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
) -> Result<(server::TlsStream<TcpStream>, PeerSession), ConnectError> {
    let stream = acceptor.accept(tcp).await?;
    let peer = peer_session(stream.get_ref().1);
    Ok((stream, peer))
}

/// The negotiated protocol, cipher suite and peer certificates of a rustls
/// connection, as exposed through [`Wire::peer_session`].
///
/// [`Wire::peer_session`]: asterisque_core::Wire::peer_session
fn peer_session(conn: &rustls::CommonState) -> PeerSession {
    let protocol =
        conn.protocol_version().map(|v| format!("{:?}", v)).unwrap_or_else(String::new);
    let cipher_suite =
        conn.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())).unwrap_or_default();
    let certificates = conn
        .peer_certificates()
        .map(|certs| certs.iter().map(|der| der.as_ref().to_vec()).collect())
        .unwrap_or_default();
    PeerSession { protocol, cipher_suite, certificates }
}
