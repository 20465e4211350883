//! Decides when an existing certificate must be reissued

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::time::Duration;
use time::OffsetDateTime;

use super::secret::{
    parse_timestamp, CertificateSecret, ANNOTATION_CONFIG_HASH, ANNOTATION_UPDATE_TIMESTAMP,
};
use crate::{
    resource::{CertificateRequest, ErrorKind, ResourceError},
    utils::{checked_add, checked_sub},
};

#[derive(Debug, Snafu)]
pub enum RenewalError {
    #[snafu(display("no certificate Secret exists yet"))]
    NoCurrentSecret,

    #[snafu(display("certificate Secret {secret:?} has no {annotation:?} annotation"))]
    MissingAnnotation {
        secret: String,
        annotation: &'static str,
    },

    #[snafu(display("certificate Secret {secret:?} has an invalid update timestamp {value:?}"))]
    ParseUpdateTimestamp {
        source: time::error::Parse,
        secret: String,
        value: String,
    },

    #[snafu(display("certificate TTL {ttl} must be longer than the expiration threshold {threshold}, or it would be renewed on every reconciliation"))]
    TtlWithinThreshold { ttl: Duration, threshold: Duration },

    #[snafu(display("expiry of certificate Secret {secret:?} is out of range"))]
    ExpiryOutOfRange { secret: String },
}

impl ResourceError for RenewalError {
    fn kind(&self) -> ErrorKind {
        match self {
            RenewalError::NoCurrentSecret | RenewalError::MissingAnnotation { .. } => {
                ErrorKind::MissingAnnotation
            }
            RenewalError::ParseUpdateTimestamp { .. } => ErrorKind::WrongType,
            RenewalError::TtlWithinThreshold { .. } | RenewalError::ExpiryOutOfRange { .. } => {
                ErrorKind::InvalidConfig
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// How long before expiry a certificate is reissued
    pub expiration_threshold: Duration,
    /// Components whose certificates are never reissued once created
    pub non_regenerating_components: Vec<String>,
}

impl RenewalPolicy {
    pub fn is_exempt(&self, request: &CertificateRequest) -> bool {
        request.disable_regeneration
            || self
                .non_regenerating_components
                .contains(&request.cluster_component)
    }

    /// Rejects requests whose certificates would already be due for renewal when they are issued.
    pub fn validate(&self, request: &CertificateRequest) -> Result<(), RenewalError> {
        ensure!(
            self.is_exempt(request) || request.ttl > self.expiration_threshold,
            TtlWithinThresholdSnafu {
                ttl: request.ttl,
                threshold: self.expiration_threshold,
            }
        );
        Ok(())
    }

    /// Whether the certificate in `current` must be reissued so that it matches `desired`.
    ///
    /// Exempt requests are never renewed. Otherwise the certificate is renewed once it is within the
    /// expiration threshold of its TTL (strictly past that point), or when the request's config hash changed.
    pub fn should_renew(
        &self,
        request: &CertificateRequest,
        current: Option<&CertificateSecret>,
        desired: &CertificateSecret,
        now: OffsetDateTime,
    ) -> Result<bool, RenewalError> {
        if self.is_exempt(request) {
            return Ok(false);
        }
        self.validate(request)?;
        let current = current.context(NoCurrentSecretSnafu)?;
        let annotation = |annotation: &'static str| {
            current
                .annotation(annotation)
                .with_context(|| MissingAnnotationSnafu {
                    secret: &current.name,
                    annotation,
                })
        };
        let update_timestamp = annotation(ANNOTATION_UPDATE_TIMESTAMP)?;
        let current_hash = annotation(ANNOTATION_CONFIG_HASH)?;
        let updated_at =
            parse_timestamp(update_timestamp).with_context(|_| ParseUpdateTimestampSnafu {
                secret: &current.name,
                value: update_timestamp,
            })?;

        let expiry = checked_add(updated_at, *request.ttl)
            .and_then(|expiry| checked_sub(expiry, *self.expiration_threshold))
            .with_context(|| ExpiryOutOfRangeSnafu {
                secret: &current.name,
            })?;
        if expiry < now {
            return Ok(true);
        }
        Ok(desired.annotation(ANNOTATION_CONFIG_HASH) != Some(current_hash))
    }
}
