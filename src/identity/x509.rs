//! Leaf certificate inspection: SPIFFE ID and validity window.

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, SanType};
use rustls::pki_types::CertificateDer;

use crate::types::SpiffeId;

/// What the runtime needs from a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafInfo {
    pub spiffe_id: SpiffeId,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Parse the SPIFFE ID and validity window from a DER leaf certificate.
///
/// The certificate must carry exactly one `spiffe://` URI SAN.
pub(crate) fn parse_leaf(der: &CertificateDer<'_>) -> Result<LeafInfo, String> {
    let params = CertificateParams::from_ca_cert_der(der)
        .map_err(|e| format!("unparseable certificate: {e}"))?;

    let mut uris = params.subject_alt_names.iter().filter_map(|san| match san {
        SanType::URI(uri) if uri.as_str().starts_with("spiffe://") => Some(uri.as_str()),
        _ => None,
    });
    let uri = uris
        .next()
        .ok_or_else(|| "certificate has no spiffe:// URI SAN".to_owned())?;
    if uris.next().is_some() {
        return Err("certificate has more than one spiffe:// URI SAN".to_owned());
    }
    let spiffe_id = SpiffeId::parse(uri).map_err(|e| e.to_string())?;

    let not_before = DateTime::from_timestamp(params.not_before.unix_timestamp(), 0)
        .ok_or_else(|| "not_before out of range".to_owned())?;
    let not_after = DateTime::from_timestamp(params.not_after.unix_timestamp(), 0)
        .ok_or_else(|| "not_after out of range".to_owned())?;

    Ok(LeafInfo {
        spiffe_id,
        not_before,
        not_after,
    })
}

/// The SPIFFE ID of a peer's leaf certificate.
pub(crate) fn spiffe_id_of(der: &CertificateDer<'_>) -> Result<SpiffeId, String> {
    parse_leaf(der).map(|leaf| leaf.spiffe_id)
}
