//! Pluggable origin of workload credentials.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_stream::Stream;

use super::x509::parse_leaf;
use super::{PrivateKeyHandle, WorkloadIdentity};
use crate::types::SpiffeId;

/// File name of the PEM certificate chain, leaf first.
pub const SVID_CERT_FILE: &str = "svid.pem";
/// File name of the PEM private key.
pub const SVID_KEY_FILE: &str = "svid_key.pem";

/// Stream of identities pushed by a source.
pub type IdentityStream = Pin<Box<dyn Stream<Item = Result<WorkloadIdentity, IdentitySourceError>> + Send>>;

/// Failure fetching a credential from the source.
#[derive(Debug, thiserror::Error)]
pub enum IdentitySourceError {
    /// The source could not be reached.
    #[error("identity source unavailable: {0}")]
    Unavailable(String),
    /// The source returned something that is not a usable credential.
    #[error("malformed credential: {0}")]
    Malformed(String),
    /// Reading credential files failed.
    #[error("credential io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where workload identities come from (a workload API agent, files, a test double).
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Fetch the current credential. `hint` is the identity currently held, if any.
    async fn fetch(&self, hint: Option<&SpiffeId>) -> Result<WorkloadIdentity, IdentitySourceError>;

    /// Credentials pushed by the source as they rotate. `None` when the
    /// source only supports polling.
    fn watch(&self) -> Option<IdentityStream> {
        None
    }
}

#[async_trait]
impl<T: IdentitySource + ?Sized> IdentitySource for Arc<T> {
    async fn fetch(&self, hint: Option<&SpiffeId>) -> Result<WorkloadIdentity, IdentitySourceError> {
        (**self).fetch(hint).await
    }

    fn watch(&self) -> Option<IdentityStream> {
        (**self).watch()
    }
}

/// Reads `svid.pem` and `svid_key.pem` from a directory kept fresh by a
/// workload API helper.
#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    dir: PathBuf,
}

impl FileIdentitySource {
    /// Source reading from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory credentials are read from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl IdentitySource for FileIdentitySource {
    async fn fetch(&self, _hint: Option<&SpiffeId>) -> Result<WorkloadIdentity, IdentitySourceError> {
        let cert_pem = tokio::fs::read(self.dir.join(SVID_CERT_FILE)).await?;
        let key_pem = tokio::fs::read(self.dir.join(SVID_KEY_FILE)).await?;
        identity_from_pem(&cert_pem, &key_pem)
    }
}

/// Build a [`WorkloadIdentity`] from a PEM chain (leaf first) and PEM key.
///
/// # Errors
///
/// Returns [`IdentitySourceError::Malformed`] when either input fails to
/// parse or the leaf lacks a SPIFFE ID.
pub fn identity_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<WorkloadIdentity, IdentitySourceError> {
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IdentitySourceError::Malformed(format!("certificate chain: {e}")))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| IdentitySourceError::Malformed(format!("private key: {e}")))?;
    identity_from_der(chain, key)
}

/// Build a [`WorkloadIdentity`] from DER parts, reading the identity and
/// validity from the leaf.
///
/// # Errors
///
/// Returns [`IdentitySourceError::Malformed`] when the chain is empty or the
/// leaf is unusable.
pub fn identity_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<WorkloadIdentity, IdentitySourceError> {
    let leaf = chain
        .first()
        .ok_or_else(|| IdentitySourceError::Malformed("empty certificate chain".to_owned()))?;
    let info = parse_leaf(leaf).map_err(IdentitySourceError::Malformed)?;
    WorkloadIdentity::new(
        info.spiffe_id,
        chain,
        PrivateKeyHandle::new(key),
        info.not_before,
        info.not_after,
    )
    .map_err(|e| IdentitySourceError::Malformed(e.to_string()))
}
