//! Layout of the Secret that a certificate is delivered in

use std::collections::BTreeMap;

use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::api::ObjectMeta,
};
use time::{
    format_description::FormatItem, macros::format_description, OffsetDateTime,
    PrimitiveDateTime, UtcOffset,
};

use crate::{
    backend::IssuedCertificate,
    resource::CertificateRequest,
    utils::{sha256_hex, Unloggable},
};

pub const LABEL_CLUSTER: &str = "cluster";
pub const LABEL_CERTIFICATE: &str = "certificate";
pub const LABEL_OPERATOR_VERSION: &str = "operator-version";

pub const ANNOTATION_CONFIG_HASH: &str = "config-hash";
pub const ANNOTATION_UPDATE_TIMESTAMP: &str = "update-timestamp";
pub const ANNOTATION_VERSION_BUNDLE_VERSION: &str = "version-bundle-version";

pub const DATA_CA: &str = "ca";
pub const DATA_CRT: &str = "crt";
pub const DATA_KEY: &str = "key";

/// UTC with microsecond precision, such as `2024-03-01T12:00:00.000000Z`
const UPDATE_TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Secret has no name"))]
    MissingName,

    #[snafu(display("Secret {name:?} has non-UTF-8 data in key {key:?}"))]
    NonUtf8Data {
        source: std::string::FromUtf8Error,
        name: String,
        key: &'static str,
    },

    #[snafu(display("failed to serialize hashed certificate config"))]
    SerializeHashedConfig { source: serde_json::Error },

    #[snafu(display("failed to format update timestamp"))]
    FormatTimestamp { source: time::error::Format },
}

pub fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, time::error::Format> {
    timestamp
        .to_offset(UtcOffset::UTC)
        .format(UPDATE_TIMESTAMP_FORMAT)
}

pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    Ok(PrimitiveDateTime::parse(value, UPDATE_TIMESTAMP_FORMAT)?.assume_utc())
}

/// The subset of a request that the issued certificate depends on
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedConfig<'a> {
    alt_names: &'a [String],
    ip_sans: &'a [String],
    organizations: &'a [String],
    common_name: &'a str,
    ttl_seconds: u64,
    allow_bare_domains: bool,
}

/// Fingerprint of the request fields that require a reissue when they change
pub fn config_hash(request: &CertificateRequest) -> Result<String, Error> {
    let config = HashedConfig {
        alt_names: &request.alt_names,
        ip_sans: &request.ip_sans,
        organizations: &request.organizations,
        common_name: &request.common_name,
        ttl_seconds: request.ttl.as_secs(),
        allow_bare_domains: request.allow_bare_domains,
    };
    let json = serde_json::to_vec(&config).context(SerializeHashedConfigSnafu)?;
    Ok(sha256_hex(&json))
}

/// PEM material stored in a certificate Secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateData {
    pub ca: String,
    pub crt: String,
    pub key: Unloggable<String>,
}

impl CertificateData {
    pub fn is_empty(&self) -> bool {
        self.ca.is_empty() && self.crt.is_empty() && self.key.is_empty()
    }
}

impl From<IssuedCertificate> for CertificateData {
    fn from(issued: IssuedCertificate) -> Self {
        Self {
            ca: issued.ca,
            crt: issued.certificate,
            key: issued.private_key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSecret {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub data: CertificateData,
}

impl CertificateSecret {
    /// The Secret that `request` should be stored in at `now`, without any certificate material.
    pub fn desired(
        request: &CertificateRequest,
        namespace: &str,
        operator_version: &str,
        now: OffsetDateTime,
    ) -> Result<Self, Error> {
        Ok(Self {
            name: request.secret_name(),
            namespace: namespace.to_string(),
            labels: [
                (LABEL_CLUSTER.to_string(), request.cluster_id.clone()),
                (
                    LABEL_CERTIFICATE.to_string(),
                    request.cluster_component.clone(),
                ),
                (
                    LABEL_OPERATOR_VERSION.to_string(),
                    operator_version.to_string(),
                ),
            ]
            .into(),
            annotations: [
                (ANNOTATION_CONFIG_HASH.to_string(), config_hash(request)?),
                (
                    ANNOTATION_UPDATE_TIMESTAMP.to_string(),
                    format_timestamp(now).context(FormatTimestampSnafu)?,
                ),
                (
                    ANNOTATION_VERSION_BUNDLE_VERSION.to_string(),
                    request.version_bundle_version.clone(),
                ),
            ]
            .into(),
            data: CertificateData::default(),
        })
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn with_data(self, data: CertificateData) -> Self {
        Self { data, ..self }
    }

    pub fn from_secret(secret: Secret) -> Result<Self, Error> {
        let name = secret.metadata.name.context(MissingNameSnafu)?;
        let mut data = secret.data.unwrap_or_default();
        let mut take = |key: &'static str| -> Result<String, Error> {
            data.remove(key)
                .map(|ByteString(bytes)| String::from_utf8(bytes))
                .transpose()
                .with_context(|_| NonUtf8DataSnafu { name: &name, key })
                .map(Option::unwrap_or_default)
        };
        let data = CertificateData {
            ca: take(DATA_CA)?,
            crt: take(DATA_CRT)?,
            key: Unloggable(take(DATA_KEY)?),
        };
        Ok(Self {
            namespace: secret.metadata.namespace.unwrap_or_default(),
            labels: secret.metadata.labels.unwrap_or_default(),
            annotations: secret.metadata.annotations.unwrap_or_default(),
            name,
            data,
        })
    }

    pub fn to_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: Some(self.annotations.clone()),
                ..ObjectMeta::default()
            },
            data: Some(
                [
                    (DATA_CA, &self.data.ca),
                    (DATA_CRT, &self.data.crt),
                    (DATA_KEY, &*self.data.key),
                ]
                .into_iter()
                .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                .collect(),
            ),
            ..Secret::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use stackable_operator::{
        k8s_openapi::{api::core::v1::Secret, ByteString},
        kube::api::ObjectMeta,
        time::Duration,
    };
    use time::OffsetDateTime;

    use super::{
        config_hash, format_timestamp, parse_timestamp, CertificateData, CertificateSecret, Error,
        ANNOTATION_CONFIG_HASH, ANNOTATION_UPDATE_TIMESTAMP, DATA_CRT, LABEL_CERTIFICATE,
    };
    use crate::{resource::testing, utils::Unloggable};

    #[test]
    fn timestamp_has_microseconds() {
        let timestamp = OffsetDateTime::from_unix_timestamp_nanos(1_709_294_400_123_456_789).unwrap();
        let formatted = format_timestamp(timestamp).unwrap();
        assert_eq!(formatted, "2024-03-01T12:00:00.123456Z");
        assert_eq!(
            parse_timestamp(&formatted).unwrap(),
            OffsetDateTime::from_unix_timestamp_nanos(1_709_294_400_123_456_000).unwrap()
        );
        assert!(parse_timestamp("2024-03-01 12:00:00").is_err());
    }

    #[test]
    fn config_hash_tracks_certificate_fields() {
        let request = testing::request();
        let hash = config_hash(&request).unwrap();
        assert_eq!(hash.len(), 64);

        let mut unrelated = request.clone();
        unrelated.version_bundle_version = "2.0.0".to_string();
        unrelated.disable_regeneration = true;
        assert_eq!(config_hash(&unrelated).unwrap(), hash);

        let mut alt_names = request.clone();
        alt_names.alt_names.push("api.example.com".to_string());
        assert_ne!(config_hash(&alt_names).unwrap(), hash);

        let mut ttl = request;
        ttl.ttl = Duration::from_hours_unchecked(48);
        assert_ne!(config_hash(&ttl).unwrap(), hash);
    }

    #[test]
    fn desired_secret_has_no_material() {
        let now = OffsetDateTime::from_unix_timestamp(1_709_294_400).unwrap();
        let desired =
            CertificateSecret::desired(&testing::request(), "default", "0.1.0", now).unwrap();
        assert_eq!(desired.name, "al9qy-api");
        assert_eq!(desired.labels[LABEL_CERTIFICATE], "api");
        assert_eq!(
            desired.annotation(ANNOTATION_UPDATE_TIMESTAMP),
            Some("2024-03-01T12:00:00.000000Z")
        );
        assert!(desired.annotation(ANNOTATION_CONFIG_HASH).is_some());
        assert!(desired.data.is_empty());
    }

    #[test]
    fn secret_conversion_keeps_material() {
        let now = OffsetDateTime::from_unix_timestamp(1_709_294_400).unwrap();
        let secret = CertificateSecret::desired(&testing::request(), "default", "0.1.0", now)
            .unwrap()
            .with_data(CertificateData {
                ca: "ca".to_string(),
                crt: "crt".to_string(),
                key: Unloggable("key".to_string()),
            });
        assert_eq!(
            CertificateSecret::from_secret(secret.to_secret()).unwrap(),
            secret
        );
    }

    #[test]
    fn non_utf8_data_is_rejected() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("al9qy-api".to_string()),
                ..ObjectMeta::default()
            },
            data: Some([(DATA_CRT.to_string(), ByteString(vec![0xff, 0xfe]))].into()),
            ..Secret::default()
        };
        assert!(matches!(
            CertificateSecret::from_secret(secret),
            Err(Error::NonUtf8Data { key: DATA_CRT, .. })
        ));
    }
}
