//! End-to-end carrier tests: ws:// over loopback TCP, and wss:// with
//! mutually authenticated TLS plus the sealed-certificate handshake.

#![cfg(feature = "websocket")]

use asterisque::{ConnectError, Node, NodeOptions, Service};
use asterisque_core::Value;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_service() -> Service {
    Service::new().func(1, |_pipe, params| async move { Ok(params) })
}

#[tokio::test]
async fn plain_ws_echo_roundtrip() {
    init_tracing();
    let server_node = Node::new(NodeOptions::default());
    server_node.register_service("echo", echo_service());
    let mut server = server_node.listen("ws://127.0.0.1:0/").await.expect("listen");
    let port = server.local_addr().port();

    let client_node =
        Node::new(NodeOptions { service_id: "echo".to_string(), ..NodeOptions::default() });
    let session =
        client_node.connect(&format!("ws://127.0.0.1:{}/", port)).await.expect("connect");
    let accepted = server.accept().await.expect("accepted session");
    assert_eq!(accepted.id(), session.id());

    let pipe = session.open(1, Value::from("over websocket")).await.expect("open");
    assert_eq!(pipe.result().await.expect("result"), Value::from("over websocket"));
}

#[tokio::test]
async fn unknown_scheme_is_refused_by_the_factory() {
    let node = Node::new(NodeOptions::default());
    match node.connect("tcp://127.0.0.1:1/").await {
        Err(ConnectError::UnsupportedProtocol(scheme)) => assert_eq!(scheme, "tcp"),
        other => panic!("expected UnsupportedProtocol, got {:?}", other.map(|_| ())),
    }
}

#[cfg(feature = "tls")]
#[tokio::test]
async fn wss_requires_a_trust_context() {
    let node = Node::new(NodeOptions::default());
    match node.connect("wss://127.0.0.1:1/").await {
        Err(ConnectError::TlsRequired) => {}
        other => panic!("expected TlsRequired, got {:?}", other.map(|_| ())),
    }
}

#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use std::sync::Arc;

    use p256::ecdsa::SigningKey;
    use p256::pkcs8::DecodePrivateKey;

    use asterisque_trust::{TrustContext, seal_certificate};

    struct Identity {
        trust: Arc<TrustContext>,
        sealed: asterisque_trust::Envelope,
    }

    /// Mint one node identity under `ca`: key pair on disk, cert chain,
    /// trusted CA directory, and the CA-sealed certificate envelope.
    fn identity(
        ca_cert: &rcgen::Certificate,
        ca_key: &rcgen::KeyPair,
        san: &str,
    ) -> Identity {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("key");
        let params = rcgen::CertificateParams::new(vec![san.to_string()]).expect("params");
        let cert = params.signed_by(&key, ca_cert, ca_key).expect("cert");

        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("ca")).expect("mkdir");
        std::fs::write(root.join("node.key"), key.serialize_pem()).expect("key");
        std::fs::write(root.join("node.crt"), format!("{}{}", cert.pem(), ca_cert.pem()))
            .expect("chain");
        std::fs::write(root.join("ca/root.pem"), ca_cert.pem()).expect("ca");
        std::mem::forget(dir);

        let signing = SigningKey::from_pkcs8_der(&ca_key.serialize_der()).expect("pkcs8");
        let sealed = seal_certificate(cert.der(), ca_cert.der(), &signing).expect("seal");
        Identity {
            trust: Arc::new(TrustContext::load_with_refresh(&root, 0).expect("load")),
            sealed,
        }
    }

    #[tokio::test]
    async fn wss_mutual_auth_echo_roundtrip() {
        init_tracing();
        let ca_key =
            rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).expect("ca key");
        let mut ca_params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "asterisque e2e ca");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let server_id = identity(&ca_cert, &ca_key, "localhost");
        let client_id = identity(&ca_cert, &ca_key, "client.test");

        let server_node = Node::new(NodeOptions {
            trust: Some(server_id.trust.clone()),
            sealed_certificate: Some(server_id.sealed.clone()),
            ..NodeOptions::default()
        });
        server_node.register_service("echo", echo_service());
        let mut server = server_node.listen("wss://127.0.0.1:0/").await.expect("listen");
        let port = server.local_addr().port();

        let client_node = Node::new(NodeOptions {
            service_id: "echo".to_string(),
            trust: Some(client_id.trust.clone()),
            sealed_certificate: Some(client_id.sealed.clone()),
            ..NodeOptions::default()
        });
        let session = client_node
            .connect(&format!("wss://localhost:{}/", port))
            .await
            .expect("connect over tls");
        let accepted = server.accept().await.expect("accepted session");

        // The TLS peer views are populated on both wires.
        let peer = session.wire().peer_session().expect("client sees server certs");
        assert!(!peer.certificates.is_empty());
        let peer = accepted.wire().peer_session().expect("server sees client certs");
        assert!(!peer.certificates.is_empty());

        let pipe = session.open(1, Value::from("over tls")).await.expect("open");
        assert_eq!(pipe.result().await.expect("result"), Value::from("over tls"));
    }
}
