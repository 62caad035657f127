use tokio::net::TcpStream;

use asterisque_core::Wire;

use crate::ConnectError;

/// Decomposed `ws://` / `wss://` endpoint. Schemes are case-insensitive; a
/// port is mandatory (there is no default asterisque port).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedUri {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

pub(crate) fn parse_uri(uri: &str) -> Result<ParsedUri, ConnectError> {
    let (scheme, rest) =
        uri.split_once("://").ok_or_else(|| ConnectError::BadUri(uri.to_string()))?;
    let secure = match scheme.to_ascii_lowercase().as_str() {
        "ws" => false,
        "wss" => true,
        other => return Err(ConnectError::UnsupportedProtocol(other.to_string())),
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{}", path)),
        None => (rest, "/".to_string()),
    };
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| ConnectError::BadUri(format!("no port in {}", uri)))?;
    if host.is_empty() {
        return Err(ConnectError::BadUri(format!("no host in {}", uri)));
    }
    let port =
        port.parse().map_err(|_| ConnectError::BadUri(format!("bad port in {}", uri)))?;
    Ok(ParsedUri { host: host.to_string(), port, path, secure })
}

/// Open a secondary wire to a `ws://` or `wss://` endpoint. `wss` requires a
/// trust context with loadable client TLS material.
pub(crate) async fn connect_wire(
    uri: &str,
    trust: Option<&std::sync::Arc<asterisque_trust::TrustContext>>,
    capacity: usize,
) -> Result<Wire, ConnectError> {
    let parsed = parse_uri(uri)?;
    let tcp = TcpStream::connect((parsed.host.as_str(), parsed.port)).await?;
    let wire = Wire::new(false, capacity, capacity);
    if parsed.secure {
        #[cfg(feature = "tls")]
        {
            let trust = trust.ok_or(ConnectError::TlsRequired)?;
            let config = trust.client_config()?;
            let (stream, peer) = super::tls::connect_tls(&parsed.host, config, tcp).await?;
            wire.set_peer_session(peer);
            let (ws, _response) =
                tokio_tungstenite::client_async(uri, stream).await.map_err(ws_error)?;
            super::websocket::spawn_ws_driver(&wire, ws);
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = trust;
            return Err(ConnectError::TlsRequired);
        }
    } else {
        let (ws, _response) = tokio_tungstenite::client_async(uri, tcp).await.map_err(ws_error)?;
        super::websocket::spawn_ws_driver(&wire, ws);
    }
    Ok(wire)
}

pub(crate) fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> ConnectError {
    ConnectError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ws() {
        let parsed = parse_uri("ws://example.net:9000/rpc").expect("parse");
        assert_eq!(parsed.host, "example.net");
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.path, "/rpc");
        assert!(!parsed.secure);
    }

    #[test]
    fn schemes_are_case_insensitive() {
        assert!(parse_uri("WS://h:1").expect("parse").secure == false);
        assert!(parse_uri("wSs://h:1").expect("parse").secure);
    }

    #[test]
    fn unknown_scheme_is_unsupported() {
        match parse_uri("tcp://example.net:9000") {
            Err(ConnectError::UnsupportedProtocol(scheme)) => assert_eq!(scheme, "tcp"),
            other => panic!("expected UnsupportedProtocol, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(matches!(parse_uri("ws://example.net/x"), Err(ConnectError::BadUri(_))));
    }

    #[test]
    fn missing_path_defaults_to_root() {
        assert_eq!(parse_uri("ws://h:1").expect("parse").path, "/");
    }
}
