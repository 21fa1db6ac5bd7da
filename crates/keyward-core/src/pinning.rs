//! Certificate pinning for the translation channel.
//!
//! [`PinnedCertVerifier`] runs the normal WebPKI chain validation first and then
//! requires the leaf certificate's SHA-256 fingerprint to equal one fixed value.
//! The check happens inside the TLS handshake, so on mismatch the connection is
//! torn down before any request bytes are written.
//!
//! There is no fallback: a pinned client never retries without the pin.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};
use url::Url;

use crate::digest::sha256_bytes;
use crate::error::{KeywardError, KeywardResult};

/// SHA-256 fingerprint of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_der(der: &[u8]) -> Self {
        Self(sha256_bytes(der))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = KeywardError;

    /// Accepts `AB:CD:...` or plain hex, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(&cleaned).map_err(|e| KeywardError::Config {
            message: format!("invalid certificate fingerprint: {e}"),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| KeywardError::Config {
            message: format!(
                "certificate fingerprint must be SHA-256 (32 bytes), got {} bytes",
                v.len()
            ),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Details of a rejected handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMismatch {
    pub host: String,
    pub expected: Fingerprint,
    pub actual: Fingerprint,
}

/// Where the verifier reports mismatches to the client that owns it, keyed by
/// host. An entry reflects the latest handshake with that host: a matching
/// leaf removes it.
///
/// The transport error surfaced by the HTTP stack does not reliably expose
/// the rustls error, so the verifier leaves the details here.
pub type MismatchSlot = Arc<Mutex<HashMap<String, PinMismatch>>>;

/// Chain-of-trust validation plus a leaf fingerprint pin.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: Fingerprint,
    mismatch: MismatchSlot,
}

impl PinnedCertVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        expected: Fingerprint,
        mismatch: MismatchSlot,
    ) -> KeywardResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| KeywardError::Config {
                message: format!("failed to build certificate verifier: {e}"),
            })?;
        Ok(Self {
            inner,
            expected,
            mismatch,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let actual = Fingerprint::of_der(end_entity.as_ref());
        if actual != self.expected {
            let host = server_name.to_str().into_owned();
            error!(
                host = %host,
                expected = %self.expected,
                actual = %actual,
                "certificate pin mismatch, aborting connection"
            );
            if let Ok(mut slot) = self.mismatch.lock() {
                slot.insert(
                    host.clone(),
                    PinMismatch {
                        host,
                        expected: self.expected,
                        actual,
                    },
                );
            }
            return Err(rustls::Error::General(format!(
                "certificate pin mismatch: got {actual}"
            )));
        }

        if let Ok(mut slot) = self.mismatch.lock() {
            let host = server_name.to_str();
            slot.remove(&*host);
        }
        debug!(fingerprint = %actual, "certificate pin matched");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Builds pinned TLS clients for one expected fingerprint.
#[derive(Debug, Clone)]
pub struct PinningGate {
    expected: Fingerprint,
    roots: Arc<RootCertStore>,
}

impl PinningGate {
    /// Pin against the public WebPKI roots.
    pub fn new(expected: Fingerprint) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(expected, roots)
    }

    /// Pin against a custom root set (private CAs, tests).
    pub fn with_roots(expected: Fingerprint, roots: RootCertStore) -> Self {
        Self {
            expected,
            roots: Arc::new(roots),
        }
    }

    pub fn expected(&self) -> Fingerprint {
        self.expected
    }

    /// rustls client config whose verifier reports into `mismatch`.
    pub fn client_config(&self, mismatch: MismatchSlot) -> KeywardResult<ClientConfig> {
        let verifier = PinnedCertVerifier::new(self.roots.clone(), self.expected, mismatch)?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| KeywardError::Config {
                message: format!("TLS config error: {e}"),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(config)
    }

    /// HTTPS client that only talks to servers presenting the pinned leaf.
    pub fn http_client(&self, timeout: Duration) -> KeywardResult<PinnedClient> {
        let mismatch: MismatchSlot = Arc::default();
        let tls = self.client_config(mismatch.clone())?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .https_only(true)
            .timeout(timeout)
            .user_agent(format!("keyward/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KeywardError::Config {
                message: format!("failed to build pinned HTTP client: {e}"),
            })?;
        Ok(PinnedClient {
            client,
            expected: self.expected,
            mismatch,
        })
    }
}

/// HTTP client behind a [`PinningGate`].
#[derive(Debug, Clone)]
pub struct PinnedClient {
    client: reqwest::Client,
    expected: Fingerprint,
    mismatch: MismatchSlot,
}

impl PinnedClient {
    /// POST a JSON body and decode a JSON response.
    pub async fn post_json<B, R>(&self, url: &Url, body: &B) -> KeywardResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if url.scheme() != "https" {
            return Err(KeywardError::Config {
                message: format!("pinned endpoint must use https: {url}"),
            });
        }

        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| self.translate_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KeywardError::Translation {
                message: format!("HTTP {status}: {body}"),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| KeywardError::InvalidResponse {
                message: format!("failed to decode response: {e}"),
            })
    }

    /// Recorded mismatch for the host of `url`.
    ///
    /// Left in place so concurrent requests to the same host all see it.
    fn mismatch_for(&self, url: &Url) -> Option<PinMismatch> {
        let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
        self.mismatch.lock().ok()?.get(host).cloned()
    }

    fn translate_error(&self, url: &Url, err: reqwest::Error) -> KeywardError {
        match self.mismatch_for(url) {
            Some(mismatch) => KeywardError::PinningMismatch {
                host: mismatch.host,
                expected: mismatch.expected.to_string(),
                actual: mismatch.actual.to_string(),
            },
            None => {
                debug!(url = %url, expected = %self.expected, error = %err, "pinned request failed");
                KeywardError::from(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};

    struct TestPki {
        ca_der: CertificateDer<'static>,
        leaf_der: CertificateDer<'static>,
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
        }
    }

    fn roots(pki: &TestPki) -> Arc<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.add(pki.ca_der.clone()).unwrap();
        Arc::new(roots)
    }

    fn verify(
        verifier: &PinnedCertVerifier,
        pki: &TestPki,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let name = ServerName::try_from("localhost").unwrap();
        verifier.verify_server_cert(&pki.leaf_der, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_fingerprint_parse_formats() {
        let raw = [0xab_u8; 32];
        let colon = Fingerprint(raw).to_string();
        assert!(colon.starts_with("AB:AB:"));
        assert_eq!(colon.len(), 32 * 3 - 1);

        assert_eq!(colon.parse::<Fingerprint>().unwrap(), Fingerprint(raw));
        assert_eq!(
            colon.to_lowercase().parse::<Fingerprint>().unwrap(),
            Fingerprint(raw)
        );
        assert_eq!(
            hex::encode(raw).parse::<Fingerprint>().unwrap(),
            Fingerprint(raw)
        );
    }

    #[test]
    fn test_sha1_length_fingerprint_rejected() {
        let sha1 = "AA:".repeat(19) + "AA";
        let err = sha1.parse::<Fingerprint>().unwrap_err();
        assert!(err.to_string().contains("20 bytes"));
    }

    #[test]
    fn test_matching_pin_accepted() {
        let pki = test_pki();
        let slot: MismatchSlot = Arc::default();
        let verifier =
            PinnedCertVerifier::new(roots(&pki), Fingerprint::of_der(&pki.leaf_der), slot.clone())
                .unwrap();

        assert!(verify(&verifier, &pki).is_ok());
        assert!(slot.lock().unwrap().is_empty());
    }

    #[test]
    fn test_valid_chain_wrong_pin_rejected() {
        let pki = test_pki();
        let slot: MismatchSlot = Arc::default();
        let expected = Fingerprint([0x11; 32]);
        let verifier = PinnedCertVerifier::new(roots(&pki), expected, slot.clone()).unwrap();

        assert!(verify(&verifier, &pki).is_err());

        let mismatch = slot.lock().unwrap().get("localhost").cloned().unwrap();
        assert_eq!(mismatch.host, "localhost");
        assert_eq!(mismatch.expected, expected);
        assert_eq!(mismatch.actual, Fingerprint::of_der(&pki.leaf_der));
    }

    #[test]
    fn test_untrusted_chain_rejected_before_pin() {
        let pki = test_pki();
        let other = test_pki();
        let slot: MismatchSlot = Arc::default();
        // Pin matches, but the leaf does not chain to the configured root.
        let verifier = PinnedCertVerifier::new(
            roots(&other),
            Fingerprint::of_der(&pki.leaf_der),
            slot.clone(),
        )
        .unwrap();

        assert!(verify(&verifier, &pki).is_err());
        assert!(slot.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mismatch_survives_other_handshakes() {
        let pki = test_pki();
        let slot: MismatchSlot = Arc::default();
        let wrong = PinnedCertVerifier::new(roots(&pki), Fingerprint([0x11; 32]), slot.clone())
            .unwrap();
        let right = PinnedCertVerifier::new(
            roots(&pki),
            Fingerprint::of_der(&pki.leaf_der),
            slot.clone(),
        )
        .unwrap();

        assert!(verify(&wrong, &pki).is_err());
        // A second rejected handshake does not erase the first record.
        assert!(verify(&wrong, &pki).is_err());
        assert_eq!(slot.lock().unwrap().len(), 1);

        // A matching leaf for the same host clears it.
        assert!(verify(&right, &pki).is_ok());
        assert!(slot.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plain_http_refused() {
        let client = PinningGate::new(Fingerprint([0; 32]))
            .http_client(Duration::from_secs(1))
            .unwrap();
        let url = Url::parse("http://translate.example/api").unwrap();

        let err = client
            .post_json::<_, serde_json::Value>(&url, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, KeywardError::Config { .. }));
    }
}
