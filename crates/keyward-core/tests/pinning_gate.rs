//! Pinning gate against a live TLS listener.
//!
//! The server is a tokio-rustls acceptor with a throwaway CA; it answers one
//! HTTP request with a canned translation and counts application bytes so a
//! refused handshake can be shown to leak nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyward_core::{
    Fingerprint, HttpTranslator, IntentTranslator, KeywardError, PinningGate,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct TestPki {
    ca_der: CertificateDer<'static>,
    leaf_der: CertificateDer<'static>,
    leaf_key: Vec<u8>,
}

fn test_pki() -> TestPki {
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Keyward Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut leaf_params = CertificateParams::default();
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    leaf_params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
    let leaf_key = KeyPair::generate().unwrap();
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .unwrap();

    TestPki {
        ca_der: ca_cert.der().clone(),
        leaf_der: leaf_cert.der().clone(),
        leaf_key: leaf_key.serialize_der(),
    }
}

struct TestServer {
    port: u16,
    app_bytes: Arc<AtomicUsize>,
}

/// Serve TLS connections until the test ends; each connection gets one
/// JSON response with `translated_text`.
async fn spawn_server(pki: &TestPki, translated_text: &'static str) -> TestServer {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![pki.leaf_der.clone(), pki.ca_der.clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki.leaf_key.clone())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app_bytes = Arc::new(AtomicUsize::new(0));
    let counter = app_bytes.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };

                let mut request = Vec::new();
                let mut buf = [0_u8; 4096];
                loop {
                    let n = match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    counter.fetch_add(n, Ordering::SeqCst);
                    request.extend_from_slice(&buf[..n]);
                    if request_complete(&request) {
                        break;
                    }
                }

                let body = json!({ "translatedText": translated_text }).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    TestServer { port, app_bytes }
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}

fn gate(pki: &TestPki, expected: Fingerprint) -> PinningGate {
    let mut roots = RootCertStore::empty();
    roots.add(pki.ca_der.clone()).unwrap();
    PinningGate::with_roots(expected, roots)
}

#[tokio::test]
async fn test_matching_pin_completes_translation() {
    let pki = test_pki();
    let server = spawn_server(&pki, r#"[{"token":"USDC","limit":2*500}]"#).await;

    let translator = HttpTranslator::new(
        &format!("https://localhost:{}/translate", server.port),
        &gate(&pki, Fingerprint::of_der(&pki.leaf_der)),
        Duration::from_secs(5),
    )
    .unwrap();

    let translation = translator.translate("spend 1000 USDC").await.unwrap();
    assert_eq!(
        translation.payloads,
        vec![json!({"token": "USDC", "limit": 1000})]
    );
    assert_eq!(
        translation.attestation,
        keyward_core::attest("spend 1000 USDC", &translation.raw_text)
    );
    assert!(server.app_bytes.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_wrong_pin_aborts_before_any_request_bytes() {
    let pki = test_pki();
    let server = spawn_server(&pki, "[]").await;
    let wrong = Fingerprint::of_der(b"some other certificate");

    let translator = HttpTranslator::new(
        &format!("https://localhost:{}/translate", server.port),
        &gate(&pki, wrong),
        Duration::from_secs(5),
    )
    .unwrap();

    let err = translator.translate("spend 1000 USDC").await.unwrap_err();
    match &err {
        KeywardError::PinningMismatch {
            host,
            expected,
            actual,
        } => {
            assert_eq!(host, "localhost");
            assert_eq!(*expected, wrong.to_string());
            assert_eq!(*actual, Fingerprint::of_der(&pki.leaf_der).to_string());
        }
        other => panic!("Expected PinningMismatch, got: {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);

    // Give the server task a moment to observe the aborted handshake.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.app_bytes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_requests_all_report_pin_mismatch() {
    let pki = test_pki();
    let server = spawn_server(&pki, "[]").await;
    let wrong = Fingerprint::of_der(b"some other certificate");

    let translator = HttpTranslator::new(
        &format!("https://localhost:{}/translate", server.port),
        &gate(&pki, wrong),
        Duration::from_secs(5),
    )
    .unwrap();

    let (a, b, c) = tokio::join!(
        translator.translate("first"),
        translator.translate("second"),
        translator.translate("third"),
    );
    for result in [a, b, c] {
        let err = result.unwrap_err();
        assert!(
            matches!(err, KeywardError::PinningMismatch { .. }),
            "got {err:?}"
        );
    }
    assert_eq!(server.app_bytes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_untrusted_chain_is_not_a_pin_mismatch() {
    let pki = test_pki();
    let other = test_pki();
    let server = spawn_server(&pki, "[]").await;

    // Pin matches, but the chain does not verify against the configured roots.
    let translator = HttpTranslator::new(
        &format!("https://localhost:{}/translate", server.port),
        &gate(&other, Fingerprint::of_der(&pki.leaf_der)),
        Duration::from_secs(5),
    )
    .unwrap();

    let err = translator.translate("hello").await.unwrap_err();
    assert!(
        !matches!(err, KeywardError::PinningMismatch { .. }),
        "got {err:?}"
    );
    assert_eq!(server.app_bytes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_plain_http_translator_rejected() {
    let pki = test_pki();
    let err = HttpTranslator::new(
        "http://localhost:8080/translate",
        &gate(&pki, Fingerprint::of_der(&pki.leaf_der)),
        Duration::from_secs(5),
    )
    .unwrap_err();
    assert!(matches!(err, KeywardError::Config { .. }));
}
