//! Peer certificate verification.
//!
//! The handshake itself runs with deferred verifiers that only check
//! handshake signatures. Trust is decided afterwards by
//! [`CertificateVerifier::verify`], which collects every problem with the
//! peer's chain instead of stopping at the first, so the session can weigh
//! them against the caller's [`IgnoredErrorSet`].

use super::config::TlsConfiguration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

/// One problem found with a peer certificate chain.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationError {
    #[error("The peer did not present any certificate")]
    NoPeerCertificate,

    #[error("The host name did not match any of the valid hosts for this certificate (expected '{expected}')")]
    HostNameMismatch { expected: String },

    #[error("The peer certificate is denylisted (serial {serial}, '{common_name}')")]
    CertificateDenylisted { serial: String, common_name: String },

    #[error("The certificate has expired")]
    CertificateExpired,

    #[error("The certificate is not yet valid")]
    CertificateNotYetValid,

    #[error("The issuer certificate could not be found")]
    UnknownIssuer,

    #[error("The certificate has been revoked")]
    CertificateRevoked,

    #[error("The certificate signature is invalid")]
    InvalidSignature,

    #[error("The certificate is invalid for the specified purpose")]
    InvalidPurpose,

    #[error("The certificate could not be decoded")]
    BadEncoding,

    #[error("The certificate chain is {length} certificates long, more than the allowed {max_depth}")]
    ChainTooLong { length: usize, max_depth: u32 },

    #[error("No trust anchors are configured")]
    NoTrustAnchors,

    #[error("Certificate verification failed: {0}")]
    Unspecified(String),
}

// ============================================================================
// Ignored Errors
// ============================================================================

/// Verification errors the caller accepts in advance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoredErrorSet {
    ignore_all: bool,
    errors: HashSet<VerificationError>,
}

impl IgnoredErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set that accepts every verification error.
    pub fn all() -> Self {
        Self {
            ignore_all: true,
            errors: HashSet::new(),
        }
    }

    pub fn insert(&mut self, error: VerificationError) {
        self.errors.insert(error);
    }

    pub fn is_empty(&self) -> bool {
        !self.ignore_all && self.errors.is_empty()
    }

    /// True when every error in `errors` is ignored.
    pub fn covers(&self, errors: &[VerificationError]) -> bool {
        self.ignore_all || errors.iter().all(|error| self.errors.contains(error))
    }
}

impl FromIterator<VerificationError> for IgnoredErrorSet {
    fn from_iter<I: IntoIterator<Item = VerificationError>>(iter: I) -> Self {
        Self {
            ignore_all: false,
            errors: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// Denylist
// ============================================================================

/// A certificate identified by serial number and common name.
///
/// Serials are colon-separated hex, e.g. `"05:e2:e6:a4"`; case and leading
/// zero bytes are ignored. The name matches either the subject or the issuer
/// common name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DenylistEntry {
    pub serial: String,
    pub common_name: String,
}

impl DenylistEntry {
    pub fn new(serial: impl Into<String>, common_name: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            common_name: common_name.into(),
        }
    }
}

// Fraudulently issued certificates from the Comodo (March 2011) and
// DigiNotar (August 2011) compromises.
const BUILTIN_DENYLIST: &[(&str, &str)] = &[
    ("04:7e:cb:e9:fc:a5:5f:7b:d0:9e:ae:36:e1:0c:ae:1e", "mail.google.com"),
    ("f5:c8:6a:f3:61:62:f1:3a:64:f5:4f:6d:c9:58:7c:06", "www.google.com"),
    ("d7:55:8f:da:f5:f1:10:5b:b2:13:28:2b:70:77:29:a3", "login.yahoo.com"),
    ("39:2a:43:4f:0e:07:df:1f:8a:a3:05:de:34:e0:c2:29", "login.yahoo.com"),
    ("3e:75:ce:d4:6b:69:30:21:21:88:30:ae:86:a8:2a:71", "login.yahoo.com"),
    ("e9:02:8b:95:78:e4:15:dc:1a:71:0a:2b:88:15:44:47", "login.skype.com"),
    ("92:39:d5:34:8f:40:d1:69:5a:74:54:70:e1:f2:3f:43", "addons.mozilla.org"),
    ("b0:b7:13:3e:d0:96:f9:b5:6f:ae:91:c8:74:bd:3a:c0", "login.live.com"),
    ("d8:f3:5f:4e:b7:87:2b:2d:ab:06:92:e3:15:38:2f:b0", "global trustee"),
    ("05:e2:e6:a4:cd:09:ea:54:d6:65:b0:75:fe:22:a2:56", "*.google.com"),
    ("0c:76:da:9c:91:0c:4e:2c:9e:fe:15:d0:58:93:3c:4c", "DigiNotar Root CA"),
    ("f1:4a:13:f4:87:2b:56:dc:39:df:84:ca:7a:a1:06:49", "DigiNotar Services CA"),
    ("36:16:71:55:43:42:1b:9d:e6:cb:a3:64:41:df:24:38", "DigiNotar Services 1024 CA"),
    ("0a:82:bd:1e:14:4e:88:14:d7:5b:1a:55:27:be:bf:3e", "DigiNotar Root CA G2"),
    ("5b:d5:60:9c:64:17:68:cf:21:0e:35:fd:fb:05:ad:41", "DigiNotar Qualified CA"),
    ("d6:d0:29:77:f1:49:fd:1a:83:f2:b9:ea:94:8c:5c:b4", "DigiNotar Extended Validation CA"),
    ("1e:7d:7a:53:3d:45:30:41:96:40:0f:71:48:1f:45:04", "DigiNotar Public CA 2025"),
];

fn normalize_serial(serial: &str) -> String {
    let lower = serial.trim().to_ascii_lowercase();
    let mut rest = lower.as_str();
    while let Some(stripped) = rest.strip_prefix("00:") {
        rest = stripped;
    }
    rest.to_string()
}

/// Known-compromised certificates, checked over the whole peer chain.
#[derive(Debug, Clone)]
pub struct Denylist {
    entries: Vec<DenylistEntry>,
}

impl Default for Denylist {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Denylist {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_DENYLIST
                .iter()
                .map(|(serial, name)| DenylistEntry::new(normalize_serial(serial), *name))
                .collect(),
        }
    }

    /// The built-in table plus `additions`.
    pub fn with_additions(additions: &[DenylistEntry]) -> Self {
        let mut denylist = Self::builtin();
        denylist.entries.extend(additions.iter().map(|entry| {
            DenylistEntry::new(normalize_serial(&entry.serial), entry.common_name.clone())
        }));
        denylist
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the matching entry for a parsed certificate, if any.
    pub fn lookup(&self, cert: &X509Certificate<'_>) -> Option<&DenylistEntry> {
        let serial = normalize_serial(&cert.raw_serial_as_string());
        let names: Vec<&str> = cert
            .subject()
            .iter_common_name()
            .chain(cert.issuer().iter_common_name())
            .filter_map(|attr| attr.as_str().ok())
            .collect();
        self.entries
            .iter()
            .find(|entry| entry.serial == serial && names.contains(&entry.common_name.as_str()))
    }
}

// ============================================================================
// Host Name Matching
// ============================================================================

/// Matches one certificate name against the host name the peer was reached by.
///
/// Both arguments are expected in lower case. A wildcard must be the only `*`,
/// sit at the end of the first label and be followed by at least two more
/// labels. It never matches a literal IP address.
pub fn is_matching_hostname(cn: &str, hostname: &str) -> bool {
    let Some(wildcard) = cn.find('*') else {
        return cn == hostname;
    };

    let Some(first_dot) = cn.find('.') else {
        return false;
    };
    // Check at least 3 components
    match cn[first_dot + 1..].find('.') {
        Some(offset) if first_dot + 1 + offset + 1 < cn.len() => {}
        _ => return false,
    }
    if wildcard + 1 != first_dot {
        return false;
    }
    if cn.rfind('*') != Some(wildcard) {
        return false;
    }
    if wildcard > 0 && hostname.get(..wildcard) != Some(&cn[..wildcard]) {
        return false;
    }
    let host_rest = hostname.find('.').map_or("", |dot| &hostname[dot..]);
    if host_rest != &cn[first_dot..] {
        return false;
    }
    hostname.parse::<IpAddr>().is_err()
}

fn san_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn matches_host(cert: &X509Certificate<'_>, expected: &str) -> bool {
    let expected = expected
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();
    let common_names = cert
        .subject()
        .iter_common_name()
        .filter_map(|attr| attr.as_str().ok())
        .map(str::to_lowercase);
    let alt_names: Vec<GeneralName<'_>> = match cert.subject_alternative_name() {
        Ok(Some(extension)) => extension.value.general_names.clone(),
        _ => Vec::new(),
    };

    if let Ok(ip) = expected.parse::<IpAddr>() {
        let ip_in_san = alt_names.iter().any(|name| match name {
            GeneralName::IPAddress(bytes) => san_ip(bytes) == Some(ip),
            _ => false,
        });
        return ip_in_san || common_names.into_iter().any(|cn| cn == expected);
    }

    let dns_names = alt_names.iter().filter_map(|name| match name {
        GeneralName::DNSName(dns) => Some(dns.to_lowercase()),
        _ => None,
    });
    common_names
        .chain(dns_names)
        .any(|name| is_matching_hostname(&name, &expected))
}

// ============================================================================
// Certificate Verifier
// ============================================================================

/// Which end of the connection the peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// The peer is a server; used by clients.
    ServerAuth,
    /// The peer is a client; used by servers.
    ClientAuth,
}

#[derive(Debug)]
enum ChainValidator {
    Server(Arc<WebPkiServerVerifier>),
    Client(Arc<dyn ClientCertVerifier>),
    NoAnchors,
}

/// Validates a peer chain against trust anchors, a host name and the denylist.
#[derive(Debug)]
pub struct CertificateVerifier {
    validator: ChainValidator,
    max_depth: u32,
    denylist: Denylist,
    purpose: Purpose,
}

impl CertificateVerifier {
    pub fn new(config: &TlsConfiguration, purpose: Purpose) -> Self {
        let provider = config.crypto_provider();
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(config.trust_anchors.iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "Skipped unparsable trust anchors");
        }

        let validator = if roots.is_empty() {
            ChainValidator::NoAnchors
        } else {
            let roots = Arc::new(roots);
            let built = match purpose {
                Purpose::ServerAuth => {
                    WebPkiServerVerifier::builder_with_provider(roots, provider)
                        .build()
                        .map(ChainValidator::Server)
                }
                Purpose::ClientAuth => {
                    WebPkiClientVerifier::builder_with_provider(roots, provider)
                        .build()
                        .map(ChainValidator::Client)
                }
            };
            built.unwrap_or_else(|err| {
                warn!(?err, "Failed to build chain verifier");
                ChainValidator::NoAnchors
            })
        };

        Self {
            validator,
            max_depth: config.peer_verify_depth,
            denylist: Denylist::with_additions(&config.denylist_additions),
            purpose,
        }
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Checks `chain` (leaf first) and returns every problem found.
    ///
    /// The host name check is skipped when `expected_host` is empty.
    pub fn verify(&self, chain: &[CertificateDer<'_>], expected_host: &str) -> Vec<VerificationError> {
        let Some((leaf, intermediates)) = chain.split_first() else {
            return vec![VerificationError::NoPeerCertificate];
        };
        let mut errors = Vec::new();

        // Denylisted certificates anywhere in the chain, root included
        for der in chain {
            match parse_x509_certificate(der.as_ref()) {
                Ok((_, cert)) => {
                    if let Some(entry) = self.denylist.lookup(&cert) {
                        warn!(serial = %entry.serial, common_name = %entry.common_name, "Denylisted certificate in peer chain");
                        errors.push(VerificationError::CertificateDenylisted {
                            serial: entry.serial.clone(),
                            common_name: entry.common_name.clone(),
                        });
                    }
                }
                Err(err) => trace!(?err, "Unparsable certificate in peer chain"),
            }
        }

        if !expected_host.is_empty() {
            let matched = parse_x509_certificate(leaf.as_ref())
                .map(|(_, cert)| matches_host(&cert, expected_host))
                .unwrap_or(false);
            if !matched {
                errors.push(VerificationError::HostNameMismatch {
                    expected: expected_host.to_string(),
                });
            }
        }

        if let Some(error) = self.validate_chain(leaf, intermediates, expected_host) {
            errors.push(error);
        }

        if self.max_depth > 0 && chain.len() > self.max_depth as usize {
            errors.push(VerificationError::ChainTooLong {
                length: chain.len(),
                max_depth: self.max_depth,
            });
        }

        debug!(count = errors.len(), purpose = ?self.purpose, "Verified peer chain");
        errors
    }

    fn validate_chain(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        expected_host: &str,
    ) -> Option<VerificationError> {
        let now = UnixTime::now();
        let result = match &self.validator {
            ChainValidator::NoAnchors => return Some(VerificationError::NoTrustAnchors),
            ChainValidator::Server(verifier) => {
                // Name errors are reported by the host name check
                let server_name = ServerName::try_from(expected_host.to_string())
                    .or_else(|_| ServerName::try_from("invalid".to_string()))
                    .ok()?;
                verifier
                    .verify_server_cert(leaf, intermediates, &server_name, &[], now)
                    .map(|_| ())
            }
            ChainValidator::Client(verifier) => verifier
                .verify_client_cert(leaf, intermediates, now)
                .map(|_| ()),
        };
        match result {
            Ok(()) => None,
            Err(rustls::Error::InvalidCertificate(err)) => map_certificate_error(err),
            Err(err) => Some(VerificationError::Unspecified(err.to_string())),
        }
    }
}

fn map_certificate_error(err: CertificateError) -> Option<VerificationError> {
    let mapped = match err {
        CertificateError::Expired => VerificationError::CertificateExpired,
        CertificateError::NotValidYet => VerificationError::CertificateNotYetValid,
        CertificateError::UnknownIssuer => VerificationError::UnknownIssuer,
        CertificateError::Revoked => VerificationError::CertificateRevoked,
        CertificateError::BadSignature => VerificationError::InvalidSignature,
        CertificateError::InvalidPurpose => VerificationError::InvalidPurpose,
        CertificateError::BadEncoding => VerificationError::BadEncoding,
        CertificateError::NotValidForName => return None,
        other => {
            // Variants carrying context differ between rustls releases
            let name = format!("{other:?}");
            if name.starts_with("NotValidForName") {
                return None;
            } else if name.starts_with("Expired") {
                VerificationError::CertificateExpired
            } else if name.starts_with("NotValidYet") {
                VerificationError::CertificateNotYetValid
            } else if name.starts_with("InvalidPurpose") {
                VerificationError::InvalidPurpose
            } else {
                VerificationError::Unspecified(name)
            }
        }
    };
    Some(mapped)
}

// ============================================================================
// Deferred Handshake Verifiers
// ============================================================================

/// Accepts any server chain during the handshake; signatures are still checked.
#[derive(Debug)]
pub(crate) struct DeferredServerVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredServerVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for DeferredServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Requests, but does not require, a client certificate and accepts any chain.
#[derive(Debug)]
pub(crate) struct DeferredClientVerifier {
    provider: Arc<CryptoProvider>,
}

impl DeferredClientVerifier {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ClientCertVerifier for DeferredClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_compare_exactly() {
        assert!(is_matching_hostname("www.example.com", "www.example.com"));
        assert!(!is_matching_hostname("www.example.com", "example.com"));
    }

    #[test]
    fn wildcard_rules() {
        assert!(is_matching_hostname("*.example.com", "www.example.com"));
        assert!(is_matching_hostname("xn--*.example.com", "xn--bcher-kva.example.com"));
        // Too few labels after the wildcard
        assert!(!is_matching_hostname("*.com", "example.com"));
        assert!(!is_matching_hostname("*.example.", "www.example."));
        // Wildcard not at the end of the first label
        assert!(!is_matching_hostname("w*w.example.com", "www.example.com"));
        assert!(!is_matching_hostname("www.*.com", "www.example.com"));
        // More than one wildcard
        assert!(!is_matching_hostname("**.example.com", "www.example.com"));
        // Remaining labels must match exactly
        assert!(!is_matching_hostname("*.example.com", "www.sub.example.com"));
        assert!(!is_matching_hostname("*.example.com", "www.example.org"));
        // Prefix before the wildcard must match
        assert!(!is_matching_hostname("foo*.example.com", "bar.example.com"));
    }

    #[test]
    fn wildcard_never_matches_ip() {
        assert!(!is_matching_hostname("*.0.0.1", "127.0.0.1"));
        assert!(is_matching_hostname("127.0.0.1", "127.0.0.1"));
    }

    #[test]
    fn host_name_check_uses_san_and_cn() {
        let certified = rcgen::generate_simple_self_signed(vec![
            "*.example.com".to_string(),
            "127.0.0.1".to_string(),
        ])
        .unwrap();
        let der = certified.cert.der();
        let (_, cert) = parse_x509_certificate(der.as_ref()).unwrap();

        assert!(matches_host(&cert, "WWW.Example.com"));
        assert!(matches_host(&cert, "127.0.0.1"));
        assert!(!matches_host(&cert, "example.com"));
        assert!(!matches_host(&cert, "127.0.0.2"));
    }

    #[test]
    fn serial_normalization() {
        assert_eq!(normalize_serial("00:0C:76"), "0c:76");
        assert_eq!(normalize_serial("0c:76"), "0c:76");
    }

    #[test]
    fn denylist_extension_matches_issued_certificate() {
        let mut params = rcgen::CertificateParams::new(vec!["bad.example.com".to_string()]).unwrap();
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&[0x12, 0x34, 0x56]));
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "bad.example.com");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let (_, parsed) = parse_x509_certificate(cert.der().as_ref()).unwrap();

        assert!(Denylist::builtin().lookup(&parsed).is_none());

        let denylist = Denylist::with_additions(&[DenylistEntry::new("12:34:56", "bad.example.com")]);
        let entry = denylist.lookup(&parsed).unwrap();
        assert_eq!(entry.common_name, "bad.example.com");

        let wrong_name = Denylist::with_additions(&[DenylistEntry::new("12:34:56", "good.example.com")]);
        assert!(wrong_name.lookup(&parsed).is_none());
    }

    #[test]
    fn builtin_denylist_covers_both_incidents() {
        let denylist = Denylist::builtin();
        assert_eq!(denylist.len(), BUILTIN_DENYLIST.len());
        assert!(denylist
            .entries
            .iter()
            .any(|entry| entry.common_name == "DigiNotar Root CA"));
        assert!(denylist
            .entries
            .iter()
            .any(|entry| entry.common_name == "login.yahoo.com"));
    }

    #[test]
    fn ignored_set_must_cover_every_error() {
        let mismatch = VerificationError::HostNameMismatch {
            expected: "example.com".to_string(),
        };
        let ignored: IgnoredErrorSet = [mismatch.clone()].into_iter().collect();

        assert!(ignored.covers(&[mismatch.clone()]));
        assert!(!ignored.covers(&[mismatch.clone(), VerificationError::UnknownIssuer]));
        assert!(!IgnoredErrorSet::new().covers(&[mismatch.clone()]));
        assert!(IgnoredErrorSet::all().covers(&[mismatch, VerificationError::UnknownIssuer]));
        assert!(IgnoredErrorSet::new().covers(&[]));
    }

    #[test]
    fn context_variants_map_by_name() {
        assert_eq!(
            map_certificate_error(CertificateError::Expired),
            Some(VerificationError::CertificateExpired)
        );
        assert_eq!(map_certificate_error(CertificateError::NotValidForName), None);
        assert!(matches!(
            map_certificate_error(CertificateError::UnhandledCriticalExtension),
            Some(VerificationError::Unspecified(_))
        ));
    }
}
