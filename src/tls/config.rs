//! TLS settings shared by sessions, and the rustls configs built from them.

use super::verifier::{DeferredClientVerifier, DeferredServerVerifier, DenylistEntry};
use crate::config::{
    get_namespaced_bool, get_namespaced_list, get_namespaced_string, get_namespaced_usize,
    optional,
};
use crate::error::Error;
use ::config::Config;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Lowest TLS version a session will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TlsProtocol {
    #[default]
    Tls12,
    Tls13,
}

impl TlsProtocol {
    fn versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static TLS12_AND_UP: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            TlsProtocol::Tls12 => TLS12_AND_UP,
            TlsProtocol::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.2" => Ok(TlsProtocol::Tls12),
            "1.3" => Ok(TlsProtocol::Tls13),
            other => Err(Error::InvalidConfigValue {
                key: "tls_protocol_floor".to_string(),
                got: other.to_string(),
                valid: vec!["1.2".to_string(), "1.3".to_string()],
            }),
        }
    }
}

/// How strictly the peer's certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerVerifyMode {
    /// Never ask for or check a peer certificate.
    None,
    /// Check the certificate and report problems without failing the handshake.
    QueryPeer,
    /// Problems not explicitly ignored fail the handshake.
    VerifyPeer,
    /// `VerifyPeer` for clients, `QueryPeer` for servers.
    #[default]
    AutoVerifyPeer,
}

impl FromStr for PeerVerifyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PeerVerifyMode::None),
            "query" => Ok(PeerVerifyMode::QueryPeer),
            "verify" => Ok(PeerVerifyMode::VerifyPeer),
            "auto" => Ok(PeerVerifyMode::AutoVerifyPeer),
            other => Err(Error::InvalidConfigValue {
                key: "tls_peer_verify_mode".to_string(),
                got: other.to_string(),
                valid: ["none", "query", "verify", "auto"]
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            }),
        }
    }
}

/// Everything a [`TlsSession`](super::TlsSession) needs to negotiate.
///
/// Sessions take their own deep copy at construction, so one value can serve
/// as the process-wide default.
pub struct TlsConfiguration {
    pub protocol_floor: TlsProtocol,
    pub peer_verify_mode: PeerVerifyMode,
    /// Longest accepted peer chain; 0 means unlimited.
    pub peer_verify_depth: u32,
    /// Name to verify the peer certificate against instead of the host
    /// that was connected to.
    pub peer_verify_name: Option<String>,
    pub local_certificate_chain: Vec<CertificateDer<'static>>,
    pub private_key: Option<PrivateKeyDer<'static>>,
    pub trust_anchors: Vec<CertificateDer<'static>>,
    /// Cipher suite names as printed by rustls; empty keeps the provider default.
    pub ciphers: Vec<String>,
    /// Key exchange group names as printed by rustls; empty keeps the provider default.
    pub curves: Vec<String>,
    pub alpn_protocols: Vec<String>,
    pub session_ticket: Option<Vec<u8>>,
    pub denylist_additions: Vec<DenylistEntry>,
    /// Pause the handshake on verification errors instead of failing it, so
    /// the caller can inspect them and decide through `resume()`.
    pub pause_on_verification_errors: bool,
}

impl Default for TlsConfiguration {
    fn default() -> Self {
        Self {
            protocol_floor: TlsProtocol::default(),
            peer_verify_mode: PeerVerifyMode::default(),
            peer_verify_depth: 0,
            peer_verify_name: None,
            local_certificate_chain: Vec::new(),
            private_key: None,
            trust_anchors: Vec::new(),
            ciphers: Vec::new(),
            curves: Vec::new(),
            alpn_protocols: Vec::new(),
            session_ticket: None,
            denylist_additions: Vec::new(),
            pause_on_verification_errors: false,
        }
    }
}

impl Clone for TlsConfiguration {
    fn clone(&self) -> Self {
        Self {
            protocol_floor: self.protocol_floor,
            peer_verify_mode: self.peer_verify_mode,
            peer_verify_depth: self.peer_verify_depth,
            peer_verify_name: self.peer_verify_name.clone(),
            local_certificate_chain: self.local_certificate_chain.clone(),
            private_key: self.private_key.as_ref().map(PrivateKeyDer::clone_key),
            trust_anchors: self.trust_anchors.clone(),
            ciphers: self.ciphers.clone(),
            curves: self.curves.clone(),
            alpn_protocols: self.alpn_protocols.clone(),
            session_ticket: self.session_ticket.clone(),
            denylist_additions: self.denylist_additions.clone(),
            pause_on_verification_errors: self.pause_on_verification_errors,
        }
    }
}

impl fmt::Debug for TlsConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfiguration")
            .field("protocol_floor", &self.protocol_floor)
            .field("peer_verify_mode", &self.peer_verify_mode)
            .field("peer_verify_depth", &self.peer_verify_depth)
            .field("peer_verify_name", &self.peer_verify_name)
            .field("local_certificate_chain", &self.local_certificate_chain.len())
            .field("private_key", &self.private_key.is_some())
            .field("trust_anchors", &self.trust_anchors.len())
            .field("ciphers", &self.ciphers)
            .field("curves", &self.curves)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("pause_on_verification_errors", &self.pause_on_verification_errors)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TlsConfiguration {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the `tls_*` keys, preferring those under `name.`.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let string = |key: &str| optional(get_namespaced_string(config, name, key));
        let list = |key: &str| optional(get_namespaced_list(config, name, key));
        let mut tls = Self::default();

        if let Some(path) = string("tls_local_cert")? {
            tls.local_certificate_chain = load_certificates(&path)?;
        }
        if let Some(path) = string("tls_private_key")? {
            tls.private_key = Some(load_private_key(&path)?);
        }
        if let Some(path) = string("tls_ca_cert")? {
            tls.trust_anchors = load_certificates(&path)?;
        }
        if let Some(mode) = string("tls_peer_verify_mode")? {
            tls.peer_verify_mode = mode.parse()?;
        }
        if let Some(depth) = optional(get_namespaced_usize(config, name, "tls_peer_verify_depth"))? {
            tls.peer_verify_depth = u32::try_from(depth).map_err(|_| Error::InvalidConfigValue {
                key: "tls_peer_verify_depth".to_string(),
                got: depth.to_string(),
                valid: vec![format!("0..={}", u32::MAX)],
            })?;
        }
        tls.peer_verify_name = string("tls_peer_verify_name")?.filter(|name| !name.is_empty());
        if let Some(floor) = string("tls_protocol_floor")? {
            tls.protocol_floor = floor.parse()?;
        }
        tls.ciphers = list("tls_ciphers")?.unwrap_or_default();
        tls.curves = list("tls_curves")?.unwrap_or_default();
        tls.alpn_protocols = list("tls_alpn")?.unwrap_or_default();
        if let Some(pause) = optional(get_namespaced_bool(
            config,
            name,
            "tls_pause_on_verification_errors",
        ))? {
            tls.pause_on_verification_errors = pause;
        }

        debug!(?tls, "Loaded TLS configuration");
        Ok(tls)
    }
}

// ============================================================================
// rustls Configs
// ============================================================================

impl TlsConfiguration {
    /// The ring provider restricted to the configured ciphers and curves.
    pub fn crypto_provider(&self) -> Arc<CryptoProvider> {
        let mut provider = rustls::crypto::ring::default_provider();
        if !self.ciphers.is_empty() {
            provider.cipher_suites.retain(|suite| {
                let name = format!("{:?}", suite.suite());
                self.ciphers.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
            });
        }
        if !self.curves.is_empty() {
            provider.kx_groups.retain(|group| {
                let name = format!("{:?}", group.name());
                self.curves.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
            });
        }
        Arc::new(provider)
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.alpn_protocols
            .iter()
            .map(|protocol| protocol.as_bytes().to_vec())
            .collect()
    }

    /// Builds the client side. Chain trust is decided after the handshake.
    pub(crate) fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let provider = self.crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(self.protocol_floor.versions())
            .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier::new(provider)));

        let mut config = match (&self.private_key, self.local_certificate_chain.is_empty()) {
            (Some(key), false) => builder
                .with_client_auth_cert(self.local_certificate_chain.clone(), key.clone_key())
                .map_err(|e| Error::TlsClientConfigBuild(e.to_string()))?,
            _ => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn();
        Ok(Arc::new(config))
    }

    /// Builds the server side. Requires a local certificate and key.
    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        let key = match (&self.private_key, self.local_certificate_chain.is_empty()) {
            (Some(key), false) => key.clone_key(),
            _ => return Err(Error::TlsServerConfigMissing),
        };

        let provider = self.crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(self.protocol_floor.versions())
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        let builder = match self.peer_verify_mode {
            PeerVerifyMode::QueryPeer | PeerVerifyMode::VerifyPeer => builder
                .with_client_cert_verifier(Arc::new(DeferredClientVerifier::new(provider))),
            PeerVerifyMode::None | PeerVerifyMode::AutoVerifyPeer => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(self.local_certificate_chain.clone(), key)
            .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
        config.alpn_protocols = self.alpn();
        Ok(Arc::new(config))
    }
}

// ============================================================================
// PEM Loading
// ============================================================================

/// Reads every certificate from a PEM file.
pub fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

/// Reads the first private key from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verify_modes() {
        assert_eq!("verify".parse::<PeerVerifyMode>().unwrap(), PeerVerifyMode::VerifyPeer);
        assert_eq!("Auto".parse::<PeerVerifyMode>().unwrap(), PeerVerifyMode::AutoVerifyPeer);
        assert!(matches!(
            "strict".parse::<PeerVerifyMode>(),
            Err(Error::InvalidConfigValue { .. })
        ));
    }

    #[test]
    fn clone_duplicates_private_key() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = TlsConfiguration {
            local_certificate_chain: vec![certified.cert.der().clone()],
            private_key: Some(PrivateKeyDer::Pkcs8(
                certified.key_pair.serialize_der().into(),
            )),
            ..Default::default()
        };
        let copy = config.clone();
        assert_eq!(
            copy.private_key.as_ref().map(|key| key.secret_der().to_vec()),
            config.private_key.as_ref().map(|key| key.secret_der().to_vec())
        );
        assert!(copy.server_config().is_ok());
    }

    #[test]
    fn server_requires_certificate_and_key() {
        assert!(matches!(
            TlsConfiguration::default().server_config(),
            Err(Error::TlsServerConfigMissing)
        ));
    }

    #[test]
    fn cipher_filter_restricts_provider() {
        let config = TlsConfiguration {
            ciphers: vec!["TLS13_AES_128_GCM_SHA256".to_string()],
            ..Default::default()
        };
        let provider = config.crypto_provider();
        assert_eq!(provider.cipher_suites.len(), 1);

        let none_left = TlsConfiguration {
            ciphers: vec!["NO_SUCH_SUITE".to_string()],
            ..Default::default()
        };
        assert!(none_left.client_config().is_err());
    }
}
