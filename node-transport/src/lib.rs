//! mTLS bootstrap: self-signed certificate generation and the
//! `tonic::transport::ServerTlsConfig` assembly that enforces client
//! certificate verification.
//!
//! Grounded in `original_source/marznode/utils/ssl.py`'s
//! `generate_random_certificate`/`create_secure_context` — RSA-4096/SHA-512,
//! ten-year validity, a `Purpose.CLIENT_AUTH` context that refuses any peer
//! without a certificate signed by the configured trust anchor. `rcgen`'s
//! backend (`ring`) cannot generate RSA keys, only verify RSA signatures, so
//! the keypair generated here is ECDSA P-384/SHA-384 instead — the nearest
//! strong equivalent the crate actually supports.

use node_core::NodeError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P384_SHA384};
use std::path::Path;
use std::time::Duration as StdDuration;
use time::{Duration as TimeDuration, OffsetDateTime};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::{info, warn};

const CERT_VALIDITY_DAYS: i64 = 10 * 365;

/// Material the gRPC server needs to present its identity and verify peers.
#[derive(Clone)]
pub struct TlsMaterial {
    pub identity: Identity,
    pub client_ca: Certificate,
}

/// Generate a self-signed keypair/certificate at `cert_path`/`key_path` if
/// either file is missing. Idempotent: an existing pair is left untouched,
/// mirroring the original agent's "generate once, reuse thereafter" startup.
pub async fn ensure_server_certificate(cert_path: &Path, key_path: &Path) -> Result<(), NodeError> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "generating self-signed server certificate"
    );

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| NodeError::Internal(format!("certificate params: {e}")))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "marznode");
    params.distinguished_name = name;
    params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
    params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(CERT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|e| NodeError::Internal(format!("key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| NodeError::Internal(format!("self-signing: {e}")))?;

    if let Some(parent) = cert_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(NodeError::Io)?;
    }
    tokio::fs::write(cert_path, cert.pem()).await.map_err(NodeError::Io)?;
    tokio::fs::write(key_path, key_pair.serialize_pem()).await.map_err(NodeError::Io)?;
    Ok(())
}

/// Load the server identity and the client trust anchor, generating the
/// server's own keypair first if it doesn't exist yet. A missing client
/// trust certificate is a hard startup failure: the original agent refuses
/// to bind a socket it cannot authenticate peers against, and so do we.
pub async fn load_tls_material(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> Result<TlsMaterial, NodeError> {
    ensure_server_certificate(cert_path, key_path).await?;

    let cert = tokio::fs::read(cert_path).await.map_err(NodeError::Io)?;
    let key = tokio::fs::read(key_path).await.map_err(NodeError::Io)?;
    let identity = Identity::from_pem(cert, key);

    if !client_ca_path.exists() {
        warn!(
            path = %client_ca_path.display(),
            "client trust certificate missing, refusing to start secure transport"
        );
        return Err(NodeError::ConfigInvalid(format!(
            "client trust certificate not found at {}",
            client_ca_path.display()
        )));
    }
    let client_ca_pem = tokio::fs::read(client_ca_path).await.map_err(NodeError::Io)?;

    Ok(TlsMaterial { identity, client_ca: Certificate::from_pem(client_ca_pem) })
}

/// Build the `tonic` server TLS config enforcing mutual authentication —
/// the Rust-native counterpart of `ssl.create_secure_context`'s
/// `verify_mode = CERT_REQUIRED`. `tonic`/`rustls` negotiate the `h2` ALPN
/// identifier on their own; nothing else needs to be pinned here.
pub fn server_tls_config(material: &TlsMaterial) -> ServerTlsConfig {
    ServerTlsConfig::new()
        .identity(material.identity.clone())
        .client_ca_root(material.client_ca.clone())
}

/// How long a freshly-bootstrapped certificate remains valid, exposed for
/// callers that want to log or assert on it without duplicating the
/// constant (e.g. a renewal check run on a timer).
pub fn certificate_validity() -> StdDuration {
    StdDuration::from_secs(CERT_VALIDITY_DAYS as u64 * 24 * 60 * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn generates_cert_and_key_when_absent() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ssl_cert.pem");
        let key_path = dir.path().join("ssl_key.pem");

        ensure_server_certificate(&cert_path, &key_path).await.unwrap();

        assert!(cert_path.exists());
        assert!(key_path.exists());
        let cert_pem = tokio::fs::read_to_string(&cert_path).await.unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        let key_pem = tokio::fs::read_to_string(&key_path).await.unwrap();
        assert!(key_pem.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn leaves_an_existing_cert_pair_untouched() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ssl_cert.pem");
        let key_path = dir.path().join("ssl_key.pem");

        ensure_server_certificate(&cert_path, &key_path).await.unwrap();
        let first_cert = tokio::fs::read(&cert_path).await.unwrap();

        ensure_server_certificate(&cert_path, &key_path).await.unwrap();
        let second_cert = tokio::fs::read(&cert_path).await.unwrap();

        assert_eq!(first_cert, second_cert);
    }

    #[tokio::test]
    async fn missing_client_trust_cert_is_rejected() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ssl_cert.pem");
        let key_path = dir.path().join("ssl_key.pem");
        let client_ca_path = dir.path().join("ssl_client_cert.pem");

        let err = load_tls_material(&cert_path, &key_path, &client_ca_path)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn loads_material_once_all_three_files_are_present() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("ssl_cert.pem");
        let key_path = dir.path().join("ssl_key.pem");
        let client_ca_path = dir.path().join("ssl_client_cert.pem");

        ensure_server_certificate(&cert_path, &key_path).await.unwrap();
        tokio::fs::copy(&cert_path, &client_ca_path).await.unwrap();

        let material = load_tls_material(&cert_path, &key_path, &client_ca_path).await.unwrap();
        let _config = server_tls_config(&material);
    }
}
