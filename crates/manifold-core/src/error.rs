/// Boxed error carried for application-supplied failures (handlers, hooks,
/// transport implementations).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while declaring routes, subroutes, or message handlers.
///
/// These always fail fast at registration time, never at request time.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("route already registered for path {0:?}")]
    DuplicateRoute(String),
    #[error("route name already in use: {0:?}")]
    DuplicateRouteName(String),
    #[error("subroute already registered for path {0:?}")]
    DuplicateSubroute(String),
    #[error("malformed route template {path:?}: {reason}")]
    MalformedTemplate { path: String, reason: String },
    #[error("duplicate parameter {name:?} in route template {path:?}")]
    DuplicateParameter { path: String, name: String },
    #[error("handler already registered for message type {0:?}")]
    DuplicateHandler(String),
    #[error("conventional handler already registered under name {0:?}")]
    DuplicateMethod(String),
    #[error("payload type {payload} bound to both {first:?} and {second:?}")]
    DuplicatePayloadType {
        payload: &'static str,
        first: String,
        second: String,
    },
    #[error("router is already mounted at {0:?}")]
    AlreadyMounted(String),
}

impl DefinitionError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateRoute(_) => "duplicate_route",
            Self::DuplicateRouteName(_) => "duplicate_route_name",
            Self::DuplicateSubroute(_) => "duplicate_subroute",
            Self::MalformedTemplate { .. } => "malformed_template",
            Self::DuplicateParameter { .. } => "duplicate_parameter",
            Self::DuplicateHandler(_) => "duplicate_handler",
            Self::DuplicateMethod(_) => "duplicate_method",
            Self::DuplicatePayloadType { .. } => "duplicate_payload_type",
            Self::AlreadyMounted(_) => "already_mounted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        assert_eq!(
            DefinitionError::DuplicateRoute("/a".into()).kind(),
            "duplicate_route"
        );
        assert_eq!(
            DefinitionError::MalformedTemplate {
                path: "/{".into(),
                reason: "unbalanced".into()
            }
            .kind(),
            "malformed_template"
        );
        assert_eq!(
            DefinitionError::AlreadyMounted("/ws".into()).kind(),
            "already_mounted"
        );
    }

    #[test]
    fn display_includes_offender() {
        let err = DefinitionError::DuplicateHandler("echo".into());
        assert!(err.to_string().contains("echo"));

        let err = DefinitionError::DuplicateParameter {
            path: "/{id}/{id}".into(),
            name: "id".into(),
        };
        assert!(err.to_string().contains("id"));
    }
}
