use axum::http::StatusCode;
use thiserror::Error;

/// Taxonomie des erreurs du plan de contrôle. Chaque appel externe (Docker,
/// stream, store) est converti vers une de ces variantes : aucun composant
/// ne laisse remonter une faute brute qui ferait tomber le process.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("node {0} is offline")]
    NodeUnreachable(String),

    #[error("server not found")]
    ServerNotFound,

    #[error("node not found")]
    NodeNotFound,

    #[error("server has no container yet")]
    ContainerMissing,

    #[error("server is not running")]
    NotRunning,

    #[error("docker connect failed: {0}")]
    Connect(String),

    #[error("stream failure: {0}")]
    Stream(String),

    #[error("lifecycle failure: {0}")]
    Lifecycle(String),
}

impl ControlError {
    /// Mapping HTTP. Un refus d'accès console est émis comme ServerNotFound
    /// en amont : fail closed, indiscernable d'un serveur inexistant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::NodeUnreachable(_) | ControlError::Connect(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ControlError::ServerNotFound
            | ControlError::NodeNotFound
            | ControlError::ContainerMissing => StatusCode::NOT_FOUND,
            ControlError::NotRunning => StatusCode::CONFLICT,
            ControlError::Stream(_) => StatusCode::BAD_GATEWAY,
            ControlError::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ControlError::NodeUnreachable("n1".into()).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ControlError::ServerNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ControlError::NotRunning.status_code(), StatusCode::CONFLICT);
        assert_eq!(ControlError::Stream("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ControlError::Lifecycle("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
