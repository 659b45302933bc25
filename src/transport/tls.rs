use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::config::TlsMaterial;
use crate::error::UldpError;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

pub fn client_config(tls: &TlsMaterial) -> Result<Arc<ClientConfig>, UldpError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in load_certificates(&tls.ca_pem)? {
        roots.add(cert)
            .map_err(|e| UldpError::Tls(format!("invalid CA certificate: {}", e)))?;
    }
    let roots = Arc::new(roots);

    let client_certs = load_certificates(&tls.cert_pem)?;
    let client_key = load_private_key(&tls.key_pem, tls.key_passphrase.as_deref())?;

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| UldpError::Tls(e.to_string()))?;

    let builder = if tls.check_server_name {
        builder.with_root_certificates(roots)
    }
    else {
        debug!("TLS server name verification is disabled");
        let verifier = NameCheckDisabledVerifier::new(roots, provider)?;
        builder.dangerous().with_custom_certificate_verifier(Arc::new(verifier))
    };

    let config = builder.with_client_auth_cert(client_certs, client_key)
        .map_err(|e| UldpError::Tls(format!("invalid client certificate or key: {}", e)))?;
    Ok(Arc::new(config))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, UldpError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| UldpError::Tls(format!("invalid server name {:?}: {}", host, e)))
}

fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, UldpError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UldpError::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(UldpError::Tls("no certificates found in PEM data".to_string()));
    }
    Ok(certs)
}

/// Plain keys are accepted in any format rustls understands. A passphrase requires the key to be
///  an encrypted PKCS#8 key.
fn load_private_key(pem: &[u8], passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, UldpError> {
    let Some(passphrase) = passphrase else {
        return PrivateKeyDer::from_pem_slice(pem)
            .map_err(|e| UldpError::Tls(format!("invalid private key PEM: {}", e)));
    };

    let pem = std::str::from_utf8(pem)
        .map_err(|_| UldpError::Tls("private key PEM is not valid UTF-8".to_string()))?;
    let (label, document) = pkcs8::SecretDocument::from_pem(pem)
        .map_err(|e| UldpError::Tls(format!("invalid private key PEM: {}", e)))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(UldpError::Tls(format!("a passphrase requires an encrypted PKCS#8 key, PEM label was {:?}", label)));
    }

    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| UldpError::Tls(format!("invalid encrypted private key: {}", e)))?;
    let decrypted = encrypted.decrypt(passphrase)
        .map_err(|e| UldpError::Tls(format!("cannot decrypt private key: {}", e)))?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(decrypted.as_bytes().to_vec())))
}

/// Verifies the server's certificate chain against the configured CA like the default verifier,
///  but accepts certificates that are not valid for the server's name.
#[derive(Debug)]
struct NameCheckDisabledVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl NameCheckDisabledVerifier {
    fn new(roots: Arc<RootCertStore>, provider: Arc<CryptoProvider>) -> Result<NameCheckDisabledVerifier, UldpError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| UldpError::Tls(e.to_string()))?;
        Ok(NameCheckDisabledVerifier { inner })
    }
}

impl ServerCertVerifier for NameCheckDisabledVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. })) => {
                debug!("accepting server certificate that is not valid for {:?}", server_name);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
