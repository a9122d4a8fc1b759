use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::runtime::RuntimeError;

/// Marks an encoded error on a line of output.
pub const PAYLOAD_PREFIX: &str = "HATCHERY_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 16 * 1024;
const MAX_FIELD_BYTES: usize = 2 * 1024;
const TRUNCATED: &str = "…(truncated)";

/// Errors surfaced by orchestrator operations.
///
/// Each variant has a stable code (see [`OrchestratorError::code`]); messages are
/// safe to show to callers and never contain host filesystem paths.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid spec: {message}")]
    InvalidSpec {
        message: String,
        field_errors: Option<BTreeMap<String, String>>,
    },

    #[error("no usable image for {family} (tried {})", tried.join(", "))]
    ImageResolutionExhausted { family: String, tried: Vec<String> },

    #[error("installation failed: {message}")]
    InstallationFailed {
        exit_code: Option<i64>,
        message: String,
    },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("already {0}")]
    AlreadyInState(String),

    #[error("instance is not running: {0}")]
    NotRunning(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("runtime rejected {op}: {message}")]
    Runtime { op: &'static str, message: String },

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
            field_errors: None,
        }
    }

    pub fn invalid_fields(message: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
            field_errors: Some(fields),
        }
    }

    /// Maps a runtime failure for operation `op` into the taxonomy.
    pub fn from_runtime(op: &'static str, what: &'static str, id: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(_) => Self::not_found(what, id),
            RuntimeError::NotModified(msg) => Self::AlreadyInState(msg),
            RuntimeError::Unavailable(msg) => Self::RuntimeUnavailable(msg),
            RuntimeError::Rejected(message) => Self::Runtime { op, message },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidSpec { .. } => "invalid_spec",
            Self::ImageResolutionExhausted { .. } => "image_resolution_exhausted",
            Self::InstallationFailed { .. } => "installation_failed",
            Self::AccessDenied(_) => "access_denied",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::AlreadyInState(_) => "already_in_state",
            Self::NotRunning(_) => "not_running",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::Cancelled(_) => "cancelled",
            Self::Runtime { .. } => "runtime_rejected",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// A missing container can be repaired with `recreate`.
    pub fn is_container_missing(&self) -> bool {
        matches!(self, Self::NotFound { what: "container", .. })
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotFound {
                what: "container", ..
            } => Some("Recreate the instance to rebuild its container."),
            Self::ImageResolutionExhausted { .. } => {
                Some("Check registry connectivity or add a fallback image.")
            }
            Self::InstallationFailed { .. } => Some("See the install log for the full installer output."),
            Self::InvalidSpec {
                field_errors: Some(_),
                ..
            } => Some("Fix the highlighted fields, then try again."),
            _ => None,
        }
    }

    /// Structured fields a caller can act on without parsing the message.
    fn details(&self) -> Option<Value> {
        match self {
            Self::NotFound { what, id } => Some(json!({ "what": what, "id": id })),
            Self::ImageResolutionExhausted { family, tried } => {
                Some(json!({ "family": family, "tried": tried }))
            }
            Self::InstallationFailed {
                exit_code: Some(code),
                ..
            } => Some(json!({ "exit_code": code })),
            Self::FileTooLarge { size, limit } => Some(json!({ "size": size, "limit": limit })),
            Self::Runtime { op, .. } => Some(json!({ "op": op })),
            _ => None,
        }
    }

    /// Encodes the error as a single `HATCHERY_ERROR_JSON:` line for outer layers.
    ///
    /// The object carries `code` and `message`, plus `field_errors`, `hint` and
    /// `details` when the variant has them. Long texts are clipped.
    pub fn to_payload(&self) -> String {
        let mut body = Map::new();
        body.insert("code".into(), self.code().into());
        body.insert("message".into(), clip(&self.to_string(), MAX_MESSAGE_BYTES).into());
        if let Self::InvalidSpec {
            field_errors: Some(fields),
            ..
        } = self
        {
            let fields = fields
                .iter()
                .map(|(name, problem)| (name.clone(), Value::from(clip(problem, MAX_FIELD_BYTES))))
                .collect();
            body.insert("field_errors".into(), Value::Object(fields));
        }
        if let Some(hint) = self.hint() {
            body.insert("hint".into(), hint.into());
        }
        if let Some(details) = self.details() {
            body.insert("details".into(), details);
        }
        format!("{PAYLOAD_PREFIX}{}", Value::Object(body))
    }
}

/// Cuts `text` to at most `max` bytes on a char boundary, marking the cut.
fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max.saturating_sub(TRUNCATED.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATED}", &text[..end])
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        // io::Error's Display does not carry the path.
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}
