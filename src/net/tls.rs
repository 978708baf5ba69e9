//! TLS material and certificate loading.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;

/// Error raised while loading or applying TLS material.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("certificate file not found: {0:?}")]
    CertificateNotFound(PathBuf),
    #[error("private key file not found: {0:?}")]
    KeyNotFound(PathBuf),
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate chain and private key, either on disk or in memory (PEM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMaterial {
    Files { cert_path: PathBuf, key_path: PathBuf },
    Pem { cert: Vec<u8>, key: Vec<u8> },
}

impl TlsMaterial {
    pub fn from_files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        TlsMaterial::Files {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    /// Read the PEM bytes, from disk if needed.
    async fn read(&self) -> Result<(Vec<u8>, Vec<u8>, String), TlsError> {
        match self {
            TlsMaterial::Files { cert_path, key_path } => {
                let cert = read_pem(cert_path, TlsError::CertificateNotFound).await?;
                let key = read_pem(key_path, TlsError::KeyNotFound).await?;
                Ok((cert, key, cert_path.display().to_string()))
            }
            TlsMaterial::Pem { cert, key } => Ok((cert.clone(), key.clone(), "inline PEM".to_string())),
        }
    }

    /// Load the material into a fresh rustls configuration.
    pub async fn load(&self) -> Result<RustlsConfig, TlsError> {
        let (cert, key, origin) = self.read().await?;
        validate_pem(&cert, &key, &origin)?;
        Ok(RustlsConfig::from_pem(cert, key).await?)
    }

    /// Swap the material of a live configuration in place.
    ///
    /// Existing connections keep their session; new handshakes use the new
    /// certificate. The listening socket is untouched.
    pub async fn apply_to(&self, config: &RustlsConfig) -> Result<(), TlsError> {
        let (cert, key, origin) = self.read().await?;
        validate_pem(&cert, &key, &origin)?;
        config.reload_from_pem(cert, key).await?;
        Ok(())
    }
}

async fn read_pem(path: &Path, not_found: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => not_found(path.to_path_buf()),
        _ => TlsError::Io(e),
    })
}

/// Check that the PEM blobs hold at least one certificate and a key, so a
/// bad file is reported by name instead of as a generic rustls error.
fn validate_pem(cert: &[u8], key: &[u8], origin: &str) -> Result<(), TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(origin.to_string()));
    }
    if rustls_pemfile::private_key(&mut BufReader::new(key))?.is_none() {
        return Err(TlsError::NoPrivateKey(origin.to_string()));
    }
    Ok(())
}

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, TlsError> {
    TlsMaterial::from_files(cert_path, key_path).load().await
}
