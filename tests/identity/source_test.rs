//! Tests for `src/identity/source.rs`: file-backed credentials and parsing.

use rcgen::{CertificateParams, KeyPair};

use meshgate::identity::{
    identity_from_pem, FileIdentitySource, IdentitySource, IdentitySourceError, SVID_CERT_FILE,
    SVID_KEY_FILE,
};

use crate::common::{TestPki, DOMAIN};

#[tokio::test]
async fn file_source_reads_svid_and_key() {
    let pki = TestPki::new(DOMAIN);
    let (cert_pem, key_pem) = pki.issue_pem("agent/search");
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join(SVID_CERT_FILE), cert_pem).expect("write cert");
    std::fs::write(dir.path().join(SVID_KEY_FILE), key_pem).expect("write key");

    let source = FileIdentitySource::new(dir.path());
    let identity = source.fetch(None).await.expect("fetch");
    assert_eq!(identity.spiffe_id().to_string(), "spiffe://example.org/agent/search");
    assert_eq!(identity.trust_domain(), DOMAIN);
    assert_eq!(identity.cert_chain().len(), 1);
    assert!(identity.not_before() < identity.not_after());
}

#[tokio::test]
async fn file_source_missing_files_is_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = FileIdentitySource::new(dir.path());
    let err = source.fetch(None).await.expect_err("no files");
    assert!(matches!(err, IdentitySourceError::Io(_)), "got {err:?}");
}

#[test]
fn garbage_pem_is_malformed() {
    let err = identity_from_pem(b"not a certificate", b"not a key").expect_err("garbage");
    assert!(matches!(err, IdentitySourceError::Malformed(_)), "got {err:?}");
}

#[test]
fn certificate_without_spiffe_id_is_malformed() {
    let key = KeyPair::generate().expect("keygen");
    let cert = CertificateParams::new(vec!["search.example.org".to_owned()])
        .expect("params")
        .self_signed(&key)
        .expect("self-sign");

    let err = identity_from_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes())
        .expect_err("no spiffe san");
    match err {
        IdentitySourceError::Malformed(reason) => {
            assert!(reason.contains("spiffe"), "unexpected reason: {reason}");
        }
        other => panic!("expected Malformed, got {other:?}"),
    }
}

#[test]
fn private_key_never_appears_in_debug_output() {
    let pki = TestPki::new(DOMAIN);
    let identity = pki.issue("agent/search");
    let rendered = format!("{identity:?}");
    assert!(rendered.contains("REDACTED"));
}
