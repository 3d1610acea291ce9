use thiserror::Error;

#[derive(Error, Debug)]
pub enum OfficerError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pod not found: {name} in namespace {namespace}")]
    PodNotFound { name: String, namespace: String },

    #[error("Log source error: {0}")]
    LogSourceError(String),

    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to bind {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Log rotation failed: {0}")]
    RotationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

impl OfficerError {
    /// The error means the requested Kubernetes object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, OfficerError::NotFound(_) | OfficerError::PodNotFound { .. })
    }
}

impl From<kube::Error> for OfficerError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => {
                OfficerError::NotFound(response.message)
            }
            other => OfficerError::KubernetesError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OfficerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_api_404_is_not_found() {
        let err = OfficerError::from(api_error(404, "NotFound", "pods \"traefik-abc\" not found"));
        assert!(matches!(err, OfficerError::NotFound(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_errors_are_not_not_found() {
        // Messages that merely mention 404 or "not found" do not count
        let err = OfficerError::from(api_error(500, "InternalError", "upstream returned 404: not found"));
        assert!(matches!(err, OfficerError::KubernetesError(_)));
        assert!(!err.is_not_found());

        assert!(!OfficerError::LogSourceError("stream closed: 404".to_string()).is_not_found());
        assert!(OfficerError::PodNotFound {
            name: "traefik-abc".to_string(),
            namespace: "ingress-controller".to_string(),
        }
        .is_not_found());
    }
}
