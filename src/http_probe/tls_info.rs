use rustls::ProtocolVersion;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

/// Facts derived from a completed TLS session, computed once per TLS
/// roundtrip and recorded straight into the metrics. Expiry timestamps are
/// unix seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateSnapshot {
    pub earliest_cert_expiry: Option<i64>,
    pub last_chain_expiry: Option<i64>,
    pub fingerprint_sha256: String,
    pub subject: String,
    pub issuer: String,
    pub subject_alternative: String,
    pub tls_version: &'static str,
}

pub fn tls_version_label(version: Option<ProtocolVersion>) -> &'static str {
    match version {
        Some(ProtocolVersion::TLSv1_0) => "TLS 1.0",
        Some(ProtocolVersion::TLSv1_1) => "TLS 1.1",
        Some(ProtocolVersion::TLSv1_2) => "TLS 1.2",
        Some(ProtocolVersion::TLSv1_3) => "TLS 1.3",
        _ => "unknown",
    }
}

/// Earliest `NotAfter` over a presented chain. A non-positive timestamp means
/// "no expiry data" and is skipped, it does not mean "already expired".
pub fn earliest_expiry<I>(not_after: I) -> Option<i64>
where
    I: IntoIterator<Item = i64>,
{
    not_after.into_iter().filter(|t| *t > 0).min()
}

/// The last of the per-chain weakest links: for every verified chain take its
/// earliest-expiring certificate, then keep the chain that stays valid the
/// longest.
pub fn last_chain_expiry(chains: &[Vec<i64>]) -> Option<i64> {
    chains
        .iter()
        .filter_map(|chain| earliest_expiry(chain.iter().copied()))
        .max()
}

/// Builds a snapshot from the peer certificate list of a TLS session.
/// Returns `None` when the peer presented no (parseable) leaf certificate;
/// callers skip the chain metrics in that case instead of emitting garbage.
///
/// rustls validated the presented chain during the handshake but does not
/// surface the chains it built against the root store, so the presented
/// chain doubles as the single verified chain here.
pub fn inspect_certificates(
    peer_certs: &[CertificateDer<'_>],
    version: Option<ProtocolVersion>,
) -> Option<CertificateSnapshot> {
    let leaf_der = peer_certs.first()?;
    let (_, leaf) = parse_x509_certificate(leaf_der.as_ref()).ok()?;

    let expiries: Vec<i64> = peer_certs
        .iter()
        .filter_map(|der| {
            parse_x509_certificate(der.as_ref())
                .ok()
                .map(|(_, cert)| cert.validity().not_after.timestamp())
        })
        .collect();

    Some(CertificateSnapshot {
        earliest_cert_expiry: earliest_expiry(expiries.iter().copied()),
        last_chain_expiry: last_chain_expiry(&[expiries]),
        fingerprint_sha256: hex::encode(Sha256::digest(leaf_der.as_ref())),
        subject: leaf.subject().to_string(),
        issuer: leaf.issuer().to_string(),
        subject_alternative: dns_names(&leaf).join(","),
        tls_version: tls_version_label(version),
    })
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_expiry_skips_zero_entries() {
        assert_eq!(earliest_expiry([0, 2_000_000, 1_000_000]), Some(1_000_000));
    }

    #[test]
    fn earliest_expiry_of_nothing_is_none() {
        assert_eq!(earliest_expiry([]), None);
        assert_eq!(earliest_expiry([0, 0]), None);
    }

    #[test]
    fn last_chain_expiry_takes_latest_weakest_link() {
        let chains = vec![vec![1_000_000, 5_000_000], vec![2_000_000, 9_000_000]];
        assert_eq!(last_chain_expiry(&chains), Some(2_000_000));
    }

    #[test]
    fn last_chain_expiry_ignores_chains_without_expiry_data() {
        let chains = vec![vec![0], vec![1_500_000]];
        assert_eq!(last_chain_expiry(&chains), Some(1_500_000));
    }

    #[test]
    fn version_labels_cover_the_fixed_set() {
        assert_eq!(tls_version_label(Some(ProtocolVersion::TLSv1_2)), "TLS 1.2");
        assert_eq!(tls_version_label(Some(ProtocolVersion::TLSv1_3)), "TLS 1.3");
        assert_eq!(tls_version_label(Some(ProtocolVersion::SSLv3)), "unknown");
        assert_eq!(tls_version_label(None), "unknown");
    }

    #[test]
    fn no_peer_certificates_yields_no_snapshot() {
        assert_eq!(inspect_certificates(&[], Some(ProtocolVersion::TLSv1_3)), None);
    }
}
