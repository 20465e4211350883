use std::collections::BTreeMap;

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509NameBuilder, X509,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::ByteString, time::Duration};
use time::OffsetDateTime;

use crate::{
    backend::{IssueRequest, IssuedCertificate},
    utils::{checked_add, Unloggable},
};

pub const SECRET_KEY_CA_CERT: &str = "ca.crt";
pub const SECRET_KEY_CA_KEY: &str = "ca.key";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("serialized certificate is not valid PEM"))]
    PemEncoding { source: std::string::FromUtf8Error },

    #[snafu(display("certificate lifetime {lifetime} ends too far in the future"))]
    LifetimeOutOfRange { lifetime: Duration },

    #[snafu(display("CA is missing key {key:?}"))]
    MissingCaKey { key: &'static str },

    #[snafu(display("failed to load CA from key {key:?}"))]
    LoadCa {
        source: openssl::error::ErrorStack,
        key: &'static str,
    },

    #[snafu(display("invalid IP SAN {ip:?}"))]
    InvalidIpSan {
        source: std::net::AddrParseError,
        ip: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub struct CertificateAuthority {
    pub ca_cert: X509,
    pub ca_key: PKey<Private>,
}

impl CertificateAuthority {
    pub fn new_self_signed(cluster_id: &str, lifetime: Duration) -> Result<Self> {
        let subject_name = X509NameBuilder::new()
            .and_then(|mut name| {
                name.append_entry_by_nid(
                    Nid::COMMONNAME,
                    &format!("{cluster_id} certificate authority"),
                )?;
                Ok(name)
            })
            .context(BuildCertificateSnafu)?
            .build();
        let now = OffsetDateTime::now_utc();
        let not_before = now - Duration::from_minutes_unchecked(5);
        let not_after =
            checked_add(now, *lifetime).context(LifetimeOutOfRangeSnafu { lifetime })?;
        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        let ca_key = Rsa::generate(2048)
            .and_then(PKey::try_from)
            .context(GenerateKeySnafu)?;
        let ca_cert = X509Builder::new()
            .and_then(|mut x509| {
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(&subject_name)?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(&ca_key)?;
                let mut serial = BigNum::new()?;
                serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
                x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let ctx = x509.x509v3_context(None, Some(&conf));
                let exts = [
                    BasicConstraints::new().critical().ca().build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(false)
                        .keyid(false)
                        .build(&ctx)?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_cert_sign()
                        .crl_sign()
                        .build()?,
                ];
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&ca_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        Ok(Self { ca_cert, ca_key })
    }

    pub fn from_secret_data(secret_data: &BTreeMap<String, ByteString>) -> Result<Self> {
        let ca_cert = X509::from_pem(
            &secret_data
                .get(SECRET_KEY_CA_CERT)
                .context(MissingCaKeySnafu {
                    key: SECRET_KEY_CA_CERT,
                })?
                .0,
        )
        .context(LoadCaSnafu {
            key: SECRET_KEY_CA_CERT,
        })?;
        let ca_key = PKey::private_key_from_pem(
            &secret_data
                .get(SECRET_KEY_CA_KEY)
                .context(MissingCaKeySnafu {
                    key: SECRET_KEY_CA_KEY,
                })?
                .0,
        )
        .context(LoadCaSnafu {
            key: SECRET_KEY_CA_KEY,
        })?;
        Ok(Self { ca_cert, ca_key })
    }

    pub fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>> {
        Ok([
            (
                SECRET_KEY_CA_CERT.to_string(),
                ByteString(self.ca_cert.to_pem().context(SerializeCertificateSnafu)?),
            ),
            (
                SECRET_KEY_CA_KEY.to_string(),
                ByteString(
                    self.ca_key
                        .private_key_to_pem_pkcs8()
                        .context(SerializeCertificateSnafu)?,
                ),
            ),
        ]
        .into())
    }

    /// Generates a keypair and signs a leaf certificate for it, valid for `lifetime` from now.
    pub fn issue(&self, request: &IssueRequest, lifetime: Duration) -> Result<IssuedCertificate> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - Duration::from_minutes_unchecked(5);
        let not_after =
            checked_add(now, *lifetime).context(LifetimeOutOfRangeSnafu { lifetime })?;
        let ip_sans = request
            .ip_sans
            .iter()
            .map(|ip| {
                ip.parse::<std::net::IpAddr>()
                    .context(InvalidIpSanSnafu { ip })
            })
            .collect::<Result<Vec<_>>>()?;
        let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
        let key = Rsa::generate(2048)
            .and_then(PKey::try_from)
            .context(GenerateKeySnafu)?;
        let cert = X509Builder::new()
            .and_then(|mut x509| {
                let subject_name = X509NameBuilder::new()
                    .and_then(|mut name| {
                        name.append_entry_by_nid(Nid::COMMONNAME, &request.common_name)?;
                        for organization in &request.organizations {
                            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, organization)?;
                        }
                        Ok(name)
                    })?
                    .build();
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(self.ca_cert.subject_name())?;
                x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
                x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
                x509.set_pubkey(&key)?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let mut serial = BigNum::new()?;
                serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
                x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
                let ctx = x509.x509v3_context(Some(&self.ca_cert), Some(&conf));
                let mut exts = vec![
                    BasicConstraints::new().critical().build()?,
                    KeyUsage::new()
                        .key_encipherment()
                        .digital_signature()
                        .build()?,
                    ExtendedKeyUsage::new()
                        .server_auth()
                        .client_auth()
                        .build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(true)
                        .keyid(true)
                        .build(&ctx)?,
                ];
                let mut san_ext = SubjectAlternativeName::new();
                san_ext.dns(&request.common_name);
                for alt_name in &request.alt_names {
                    san_ext.dns(alt_name);
                }
                for ip in &ip_sans {
                    san_ext.ip(&ip.to_string());
                }
                exts.push(san_ext.build(&ctx)?);
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&self.ca_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(BuildCertificateSnafu)?
            .build();
        Ok(IssuedCertificate {
            ca: pem_string(self.ca_cert.to_pem())?,
            certificate: pem_string(cert.to_pem())?,
            private_key: Unloggable(pem_string(key.private_key_to_pem_pkcs8())?),
        })
    }
}

fn pem_string(pem: Result<Vec<u8>, openssl::error::ErrorStack>) -> Result<String> {
    String::from_utf8(pem.context(SerializeCertificateSnafu)?).context(PemEncodingSnafu)
}
