//! Error types for the Cirrus operator
//!
//! Errors are structured with fields to aid debugging in production. Cloud
//! errors carry the stable error code returned by the service; all
//! classification (not-found, throttling, capacity exhaustion) is done on
//! those codes, never on type identity.

use thiserror::Error;

/// Error codes EC2/IAM return for resources that do not (yet) exist.
///
/// Eventual consistency means a freshly created resource can still report
/// one of these, so callers generally retry them.
pub const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidLaunchTemplateName.NotFoundException",
    "InvalidLaunchTemplateId.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidSecurityGroupID.NotFound",
    "InvalidAMIID.NotFound",
    "NoSuchEntity",
    "ResourceNotFoundException",
];

/// Error codes that indicate the fleet could not be fulfilled for capacity
/// reasons. These feed the unavailable-offerings cache.
pub const UNFULFILLABLE_CAPACITY_CODES: &[&str] = &[
    "InsufficientInstanceCapacity",
    "InsufficientFreeAddressesInSubnet",
    "InsufficientHostCapacity",
    "InsufficientReservedInstanceCapacity",
    "MaxSpotInstanceCountExceeded",
    "SpotMaxPriceTooLow",
    "Unavailable",
    "UnfulfillableCapacity",
    "VcpuLimitExceeded",
];

/// Error codes indicating request throttling
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

const LAUNCH_TEMPLATE_NOT_FOUND_CODES: &[&str] = &[
    "InvalidLaunchTemplateName.NotFoundException",
    "InvalidLaunchTemplateId.NotFound",
];

/// Returns true if the code names a missing resource
pub fn is_not_found_code(code: &str) -> bool {
    NOT_FOUND_CODES.contains(&code)
}

/// Returns true if the code names a capacity-exhaustion condition
pub fn is_unfulfillable_capacity_code(code: &str) -> bool {
    UNFULFILLABLE_CAPACITY_CODES.contains(&code)
}

/// Returns true if the code indicates throttling
pub fn is_throttling_code(code: &str) -> bool {
    THROTTLING_CODES.contains(&code)
}

/// Main error type for Cirrus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Error returned by a cloud service call
    #[error("cloud error [{code}]: {message}")]
    CloudApi {
        /// Stable error code from the service (e.g. "InvalidInstanceID.NotFound")
        code: String,
        /// Description of what failed
        message: String,
    },

    /// Every override in a fleet request failed with a capacity error
    #[error("insufficient capacity: {message}")]
    InsufficientCapacity {
        /// Combined fleet error detail
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {node_class}: {message}")]
    Validation {
        /// Name of the NodeClass with invalid configuration
        node_class: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "spec.blockDeviceMappings")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "launch", "catalog")
        context: String,
    },
}

impl Error {
    /// Create a cloud error with the given code and message
    pub fn cloud(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CloudApi {
            code: code.into(),
            message: msg.into(),
        }
    }

    /// Create an insufficient-capacity error
    pub fn insufficient_capacity(msg: impl Into<String>) -> Self {
        Self::InsufficientCapacity {
            message: msg.into(),
        }
    }

    /// Create a validation error without field context
    pub fn validation(node_class: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            node_class: node_class.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(
        node_class: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            node_class: node_class.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The cloud error code, if this error came from a cloud service call
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::CloudApi { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True if the error names a cloud resource that does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::CloudApi { code, .. } => is_not_found_code(code),
            Error::Kube { source } => {
                matches!(source, kube::Error::Api(ae) if ae.code == 404)
            }
            _ => false,
        }
    }

    /// True if the error is a launch-template-not-found returned by the fleet API
    pub fn is_launch_template_not_found(&self) -> bool {
        matches!(self, Error::CloudApi { code, .. } if LAUNCH_TEMPLATE_NOT_FOUND_CODES.contains(&code.as_str()))
    }

    /// True if every fleet override failed on capacity
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Error::InsufficientCapacity { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec change and are not
    /// retried. Capacity exhaustion is surfaced to the scheduler, which
    /// retries with a different shape. Throttling and eventual-consistency
    /// not-founds are retried with back-off.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 404 && ae.code != 409 && ae.code != 429)
            }
            Error::CloudApi { code, .. } => {
                is_throttling_code(code) || is_not_found_code(code) || code == "ServiceUnavailable"
            }
            Error::InsufficientCapacity { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Drops a not-found error, mapping it to `Ok(())`
pub fn ignore_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: fleet capacity errors are classified by stable code, so the
    /// launch pipeline can mark offerings unavailable without depending on
    /// SDK error types.
    #[test]
    fn story_capacity_errors_classified_by_code() {
        assert!(is_unfulfillable_capacity_code("InsufficientInstanceCapacity"));
        assert!(is_unfulfillable_capacity_code("SpotMaxPriceTooLow"));
        assert!(is_unfulfillable_capacity_code("Unavailable"));
        assert!(!is_unfulfillable_capacity_code("AccessDenied"));
    }

    /// Story: a stale launch-template cache shows up as a fleet error with a
    /// well-known code, which triggers exactly one invalidate-and-retry.
    #[test]
    fn story_launch_template_not_found_detection() {
        let err = Error::cloud(
            "InvalidLaunchTemplateName.NotFoundException",
            "The specified launch template does not exist",
        );
        assert!(err.is_launch_template_not_found());
        assert!(err.is_not_found());

        let other = Error::cloud("InvalidInstanceID.NotFound", "nope");
        assert!(!other.is_launch_template_not_found());
        assert!(other.is_not_found());
    }

    #[test]
    fn story_error_retryability() {
        // Throttling is transient
        assert!(Error::cloud("RequestLimitExceeded", "slow down").is_retryable());

        // Eventual-consistency not-found is transient
        assert!(Error::cloud("InvalidInstanceID.NotFound", "not yet visible").is_retryable());

        // Capacity exhaustion is surfaced, not retried in place
        assert!(!Error::insufficient_capacity("all overrides ICEd").is_retryable());

        // User errors require a spec change
        assert!(!Error::validation("default", "bad selector").is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());

        // Unauthorized is permanent
        assert!(!Error::cloud("UnauthorizedOperation", "denied").is_retryable());
    }

    #[test]
    fn validation_error_includes_field_path() {
        let err = Error::validation_for_field(
            "default",
            "spec.blockDeviceMappings[0].volumeSizeGiB",
            "must be within [1, 65536]",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(
                    field.as_deref(),
                    Some("spec.blockDeviceMappings[0].volumeSizeGiB")
                );
            }
            _ => panic!("expected Validation variant"),
        }
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn ignore_not_found_passes_other_errors() {
        assert!(ignore_not_found(Err(Error::cloud("NoSuchEntity", "gone"))).is_ok());
        assert!(ignore_not_found(Err(Error::cloud("AccessDenied", "nope"))).is_err());
        assert!(ignore_not_found(Ok(())).is_ok());
    }

    #[test]
    fn cloud_error_exposes_code() {
        let err = Error::cloud("Throttling", "rate exceeded");
        assert_eq!(err.code(), Some("Throttling"));
        assert!(err.to_string().contains("[Throttling]"));
    }
}
