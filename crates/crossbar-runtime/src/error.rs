//! Connection error type.

use crossbar_core::PatternError;
use thiserror::Error;

/// A problem with a connection operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The caller tried to push a `res` body through the tracked-send path.
    ///
    /// Responses are emitted by the engine in reply to an inbound envelope;
    /// tracking one would demand an acknowledgement of an acknowledgement.
    #[error("'res' bodies cannot be posted; responses are emitted by the engine")]
    ResNotPostable,

    /// The route is not sendable (bad characters or a reserved colon).
    #[error("route '{route}' cannot be sent")]
    InvalidRoute {
        /// The offending route.
        route: String,
        /// What exactly is wrong with it.
        #[source]
        source: PatternError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_route_carries_the_pattern_error() {
        let source = crossbar_core::pattern::validate_client_route("/x/:id").unwrap_err();
        let err = ConnectionError::InvalidRoute {
            route: "/x/:id".into(),
            source,
        };
        assert!(err.to_string().contains("/x/:id"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
