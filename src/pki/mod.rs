//! Certificate minting and validation for the impersonation proxy.
//!
//! The proxy's serving identity is a single-SAN leaf certificate signed by a
//! dedicated CA. A fresh CA is minted for every impersonator incarnation:
//! the Secret is rotated whenever the serving name changes, never on expiry,
//! so both CA and leaf carry a 100 year validity window.
//!
//! # Secret layout
//!
//! The material lives in a `kubernetes.io/tls` Secret with the keys
//! `ca.crt`, `tls.crt` and `tls.key`. A Secret is only usable when all three
//! keys are present, the certificate and key parse and match as a pair, and
//! the leaf's SAN set is exactly the desired serving name.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

/// Subject CN of every minted impersonation proxy CA.
pub const CA_COMMON_NAME: &str = "Pinniped Impersonation Proxy CA";

/// Secret data key holding the CA bundle.
pub const CA_CRT_KEY: &str = "ca.crt";

/// Secret data key holding the leaf certificate.
pub const TLS_CRT_KEY: &str = "tls.crt";

/// Secret data key holding the private key.
pub const TLS_KEY_KEY: &str = "tls.key";

/// Secret type for TLS material.
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Validity period for CA and leaf certificates, in days.
///
/// Rotation is identity-driven, not expiry-driven, so the window is long
/// enough to never matter.
const VALIDITY_DAYS: i64 = 100 * 365;

/// Certificates are backdated slightly to tolerate clock skew between the
/// controller and whatever validates the chain.
const NOT_BEFORE_SKEW_SECONDS: i64 = 10;

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Certificate or key parsing error.
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

/// The name the proxy serves under, classified for SAN placement.
///
/// An IP literal goes into the certificate's IP SANs, anything else into the
/// DNS SANs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServingName {
    /// An IPv4 or IPv6 literal.
    Ip(IpAddr),
    /// A DNS hostname.
    Dns(String),
}

impl ServingName {
    /// Classify an endpoint string as an IP literal or hostname.
    pub fn classify(name: &str) -> Self {
        match name.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Dns(name.to_string()),
        }
    }
}

impl std::fmt::Display for ServingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Dns(name) => write!(f, "{name}"),
        }
    }
}

fn compute_validity() -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_before = now - ::time::Duration::seconds(NOT_BEFORE_SKEW_SECONDS);
    let not_after = now + ::time::Duration::days(VALIDITY_DAYS);
    (not_before, not_after)
}

/// Certificate Authority for one impersonator incarnation.
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM, zeroized on drop.
    ca_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate for distribution.
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA.
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = Zeroizing::new(key_pair.serialize_pem());

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Get the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))
    }

    /// Issue a server certificate for TLS with the given SANs.
    ///
    /// Returns `(cert_pem, key_pem)`. The subject is left empty; the
    /// identity lives entirely in the SANs.
    pub fn issue_server_cert(
        &self,
        sans: &[ServingName],
    ) -> Result<(String, Zeroizing<String>)> {
        let mut params = CertificateParams::default();

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity();
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| match san {
                ServingName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
                ServingName::Dns(name) => Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGeneration(format!(
                            "invalid DNS name '{}': {}",
                            name, e
                        ))
                    }),
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate server key: {}", e))
        })?;
        let server_key_pem = Zeroizing::new(server_key.serialize_pem());

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key_pem))
    }
}

/// Freshly minted serving material: CA bundle, leaf and private key.
pub struct TlsMaterial {
    /// PEM-encoded CA certificate.
    pub ca_pem: String,
    /// PEM-encoded leaf certificate.
    pub cert_pem: String,
    /// PEM-encoded private key, zeroized on drop.
    pub key_pem: Zeroizing<String>,
}

impl TlsMaterial {
    /// Mint a fresh CA and a leaf whose sole SAN is the given serving name.
    pub fn mint(name: &ServingName) -> Result<Self> {
        let ca = CertificateAuthority::new(CA_COMMON_NAME)?;
        let (cert_pem, key_pem) = ca.issue_server_cert(std::slice::from_ref(name))?;
        Ok(Self {
            ca_pem: ca.ca_cert_pem().to_string(),
            cert_pem,
            key_pem,
        })
    }

    /// Assemble the owned TLS Secret for this material.
    pub fn to_secret(
        &self,
        name: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Secret {
        Secret {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            type_: Some(TLS_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([
                (
                    CA_CRT_KEY.to_string(),
                    ByteString(self.ca_pem.clone().into_bytes()),
                ),
                (
                    TLS_CRT_KEY.to_string(),
                    ByteString(self.cert_pem.clone().into_bytes()),
                ),
                (
                    TLS_KEY_KEY.to_string(),
                    ByteString(self.key_pem.as_bytes().to_vec()),
                ),
            ])),
            ..Default::default()
        }
    }

    /// Build the rustls serving key for this material.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        certified_key_from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
    }
}

/// Verdict on an existing TLS Secret, relative to the desired serving name.
pub enum SecretVerdict {
    /// The material is usable and its SAN set is exactly the desired name.
    Valid {
        /// Ready-to-serve rustls key.
        certified_key: Arc<CertifiedKey>,
    },
    /// Data keys are missing, empty, or not PEM-encoded.
    MissingOrNotPem,
    /// `tls.crt` held PEM data that is not a parseable certificate.
    InvalidCert,
    /// `tls.key` is missing, unparseable, or does not match the certificate.
    InvalidKey,
    /// Valid keypair, but the SAN set differs from the desired name.
    WrongName,
}

/// Classify an existing TLS Secret.
///
/// The checks run in a fixed order and the first failing one wins, because
/// the verdict decides which user-visible recovery message is used if the
/// subsequent delete fails.
pub fn evaluate_tls_secret(secret: &Secret, desired: &ServingName) -> SecretVerdict {
    let Some(data) = secret.data.as_ref() else {
        return SecretVerdict::MissingOrNotPem;
    };

    let Some(cert_bytes) = data.get(TLS_CRT_KEY).map(|b| b.0.as_slice()) else {
        return SecretVerdict::MissingOrNotPem;
    };
    let chain: Vec<CertificateDer<'static>> =
        match rustls_pemfile::certs(&mut &cert_bytes[..]).collect::<std::io::Result<Vec<_>>>() {
            Ok(chain) if !chain.is_empty() => chain,
            _ => return SecretVerdict::MissingOrNotPem,
        };

    let Ok((_, leaf)) = X509Certificate::from_der(&chain[0]) else {
        return SecretVerdict::InvalidCert;
    };

    if !data.get(CA_CRT_KEY).is_some_and(|b| !b.0.is_empty()) {
        return SecretVerdict::MissingOrNotPem;
    }

    let Some(key_bytes) = data.get(TLS_KEY_KEY).map(|b| b.0.as_slice()) else {
        return SecretVerdict::InvalidKey;
    };
    if !key_matches_certificate(key_bytes, &leaf) {
        return SecretVerdict::InvalidKey;
    }

    if subject_alt_names(&leaf) != [desired.clone()] {
        return SecretVerdict::WrongName;
    }

    match certified_key_from_pem(cert_bytes, key_bytes) {
        Ok(certified_key) => SecretVerdict::Valid { certified_key },
        Err(_) => SecretVerdict::InvalidKey,
    }
}

/// Check that the private key's public half matches the certificate's.
fn key_matches_certificate(key_pem: &[u8], cert: &X509Certificate<'_>) -> bool {
    let Ok(key_pem) = std::str::from_utf8(key_pem) else {
        return false;
    };
    let Ok(key_pair) = KeyPair::from_pem(key_pem) else {
        return false;
    };
    cert.public_key().subject_public_key.data == key_pair.public_key_raw()
}

/// Extract the SAN set of a certificate as serving names.
pub fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<ServingName> {
    let mut names = Vec::new();

    let Some(san_ext) = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid == x509_parser::oid_registry::OID_X509_EXT_SUBJECT_ALT_NAME)
    else {
        return names;
    };

    if let ParsedExtension::SubjectAlternativeName(san) = san_ext.parsed_extension() {
        for name in &san.general_names {
            match name {
                GeneralName::DNSName(dns_name) => {
                    names.push(ServingName::Dns(dns_name.to_string()));
                }
                GeneralName::IPAddress(ip_bytes) => {
                    if ip_bytes.len() == 4 {
                        #[allow(clippy::unwrap_used)] // length checked
                        names.push(ServingName::Ip(IpAddr::from(
                            <[u8; 4]>::try_from(*ip_bytes).unwrap(),
                        )));
                    } else if ip_bytes.len() == 16 {
                        #[allow(clippy::unwrap_used)] // length checked
                        names.push(ServingName::Ip(IpAddr::from(
                            <[u8; 16]>::try_from(*ip_bytes).unwrap(),
                        )));
                    }
                }
                _ => {}
            }
        }
    }

    names
}

/// Build a rustls [`CertifiedKey`] from PEM-encoded certificate chain and key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate chain: {}", e)))?;
    if chain.is_empty() {
        return Err(PkiError::Parse("no certificates found in PEM".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| PkiError::Parse(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| PkiError::Parse("no private key found in PEM".to_string()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| PkiError::Parse(format!("unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_leaf(pem_data: &str) -> Vec<u8> {
        ::pem::parse(pem_data.as_bytes()).unwrap().contents().to_vec()
    }

    fn minted_for(name: &str) -> (TlsMaterial, ServingName) {
        let serving_name = ServingName::classify(name);
        let material = TlsMaterial::mint(&serving_name).expect("minting should succeed");
        (material, serving_name)
    }

    #[test]
    fn serving_name_classification() {
        assert_eq!(
            ServingName::classify("127.0.0.1"),
            ServingName::Ip("127.0.0.1".parse().unwrap())
        );
        assert_eq!(
            ServingName::classify("::1"),
            ServingName::Ip("::1".parse().unwrap())
        );
        assert_eq!(
            ServingName::classify("fake.example.com"),
            ServingName::Dns("fake.example.com".into())
        );
        // Not a valid IPv4 address, so it is treated as a hostname.
        assert_eq!(
            ServingName::classify("127.0.0.456"),
            ServingName::Dns("127.0.0.456".into())
        );
    }

    #[test]
    fn ca_carries_expected_subject_and_validity() {
        let (material, _) = minted_for("127.0.0.1");
        let ca_der = parse_leaf(&material.ca_pem);
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();

        let cn = ca_cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, CA_COMMON_NAME);

        let now = ::time::OffsetDateTime::now_utc().unix_timestamp();
        let not_before = ca_cert.validity().not_before.timestamp();
        let not_after = ca_cert.validity().not_after.timestamp();
        assert!((not_before - (now - NOT_BEFORE_SKEW_SECONDS)).abs() <= 10);
        assert!((not_after - (now + VALIDITY_DAYS * 24 * 60 * 60)).abs() <= 10);
    }

    #[test]
    fn leaf_has_exactly_one_ip_san_for_ip_names() {
        let (material, name) = minted_for("127.0.0.1");
        let leaf_der = parse_leaf(&material.cert_pem);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        assert_eq!(subject_alt_names(&leaf), vec![name]);
    }

    #[test]
    fn leaf_has_exactly_one_dns_san_for_hostnames() {
        let (material, name) = minted_for("fake.example.com");
        let leaf_der = parse_leaf(&material.cert_pem);
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        assert_eq!(subject_alt_names(&leaf), vec![name]);

        let now = ::time::OffsetDateTime::now_utc().unix_timestamp();
        let not_after = leaf.validity().not_after.timestamp();
        assert!((not_after - (now + VALIDITY_DAYS * 24 * 60 * 60)).abs() <= 10);
    }

    #[test]
    fn minted_material_round_trips_through_secret_validation() {
        let (material, name) = minted_for("127.0.0.1");
        let secret = material.to_secret("tls", "ns", &BTreeMap::new());
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::Valid { .. }
        ));
    }

    #[test]
    fn empty_secret_is_missing_or_not_pem() {
        let secret = Secret::default();
        let name = ServingName::classify("127.0.0.1");
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::MissingOrNotPem
        ));

        let secret = Secret {
            data: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::MissingOrNotPem
        ));
    }

    #[test]
    fn pem_wrapped_garbage_is_an_invalid_cert() {
        // "aGVsbG8gd29ybGQK" is "hello world" base64 encoded: valid PEM
        // structure around bytes that are not a certificate.
        let secret = Secret {
            data: Some(BTreeMap::from([(
                TLS_CRT_KEY.to_string(),
                ByteString(
                    b"-----BEGIN CERTIFICATE-----\naGVsbG8gd29ybGQK\n-----END CERTIFICATE-----\n"
                        .to_vec(),
                ),
            )])),
            ..Default::default()
        };
        let name = ServingName::classify("127.0.0.1");
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::InvalidCert
        ));
    }

    #[test]
    fn missing_key_is_an_invalid_key() {
        let (material, name) = minted_for("127.0.0.1");
        let mut secret = material.to_secret("tls", "ns", &BTreeMap::new());
        secret.data.as_mut().unwrap().remove(TLS_KEY_KEY);
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::InvalidKey
        ));
    }

    #[test]
    fn mismatched_key_is_an_invalid_key() {
        let (material, name) = minted_for("127.0.0.1");
        let (other, _) = minted_for("127.0.0.1");
        let mut secret = material.to_secret("tls", "ns", &BTreeMap::new());
        secret.data.as_mut().unwrap().insert(
            TLS_KEY_KEY.to_string(),
            ByteString(other.key_pem.as_bytes().to_vec()),
        );
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::InvalidKey
        ));
    }

    #[test]
    fn missing_ca_bundle_is_missing_or_not_pem() {
        let (material, name) = minted_for("127.0.0.1");
        let mut secret = material.to_secret("tls", "ns", &BTreeMap::new());
        secret.data.as_mut().unwrap().remove(CA_CRT_KEY);
        assert!(matches!(
            evaluate_tls_secret(&secret, &name),
            SecretVerdict::MissingOrNotPem
        ));
    }

    #[test]
    fn san_mismatch_is_the_wrong_name() {
        let (material, _) = minted_for("127.0.0.1");
        let secret = material.to_secret("tls", "ns", &BTreeMap::new());
        let other = ServingName::classify("fake.example.com");
        assert!(matches!(
            evaluate_tls_secret(&secret, &other),
            SecretVerdict::WrongName
        ));
    }

    #[test]
    fn san_superset_is_the_wrong_name() {
        // A cert whose SANs include the desired name plus extras must be
        // treated as stale; exact match is required.
        let ca = CertificateAuthority::new(CA_COMMON_NAME).unwrap();
        let (cert_pem, key_pem) = ca
            .issue_server_cert(&[
                ServingName::Dns("foo".into()),
                ServingName::Dns("bar".into()),
                ServingName::classify("127.0.0.1"),
            ])
            .unwrap();
        let material = TlsMaterial {
            ca_pem: ca.ca_cert_pem().to_string(),
            cert_pem,
            key_pem,
        };
        let secret = material.to_secret("tls", "ns", &BTreeMap::new());
        let desired = ServingName::classify("127.0.0.1");
        assert!(matches!(
            evaluate_tls_secret(&secret, &desired),
            SecretVerdict::WrongName
        ));
    }

    #[test]
    fn secret_carries_type_and_all_three_keys() {
        let (material, _) = minted_for("example.com");
        let labels = BTreeMap::from([("app".to_string(), "app-name".to_string())]);
        let secret = material.to_secret("some-secret", "some-namespace", &labels);

        assert_eq!(secret.metadata.name.as_deref(), Some("some-secret"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("some-namespace"));
        assert_eq!(secret.metadata.labels.as_ref(), Some(&labels));
        assert_eq!(secret.type_.as_deref(), Some(TLS_SECRET_TYPE));
        let data = secret.data.as_ref().unwrap();
        assert_eq!(data.len(), 3);
        for key in [CA_CRT_KEY, TLS_CRT_KEY, TLS_KEY_KEY] {
            assert!(!data.get(key).unwrap().0.is_empty());
        }
    }

    #[test]
    fn certified_key_builds_from_minted_material() {
        let (material, _) = minted_for("127.0.0.1");
        let key = material.certified_key().expect("should build");
        assert_eq!(key.cert.len(), 1);
    }
}
