use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    #[display("configuration error: {msg}")]
    Config { msg: String },

    #[display("bad request: {msg}")]
    BadRequest { msg: String },

    #[display("unknown environment: {env}")]
    UnknownEnvironment { env: String },

    #[display("missing parameter: {name}")]
    MissingParameter { name: String },

    #[display("forbidden: {reason}")]
    Forbidden { reason: String },

    #[display("conflict: {reason}")]
    Conflict { reason: String },

    #[display("integrity check failed: {msg}")]
    IntegrityMismatch { msg: String },

    #[display("deploy command exited with status {exit_code}")]
    ExecutionFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[display("IO error at {path}: {error}")]
    Io { error: std::io::Error, path: String },

    #[display("permission denied: {path}")]
    PermissionDenied { path: String },
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, body) = match &self {
            Error::Config { msg } => {
                tracing::error!(msg = %msg, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "configuration error" }),
                )
            }
            Error::BadRequest { msg } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            Error::UnknownEnvironment { env } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": format!("unknown environment: {env}") }),
            ),
            Error::MissingParameter { name } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": format!("missing parameter: {name}") }),
            ),
            Error::Forbidden { reason } => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "error": reason }),
            ),
            Error::Conflict { reason } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": reason }),
            ),
            Error::IntegrityMismatch { msg } => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            Error::ExecutionFailed {
                exit_code,
                stdout,
                stderr,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": format!("deploy command exited with status {exit_code}"),
                    "exitCode": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                }),
            ),
            Error::Io { error, path } => {
                tracing::error!(path = %path, error = %error, "io error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
            Error::PermissionDenied { path } => {
                tracing::error!(path = %path, "permission denied");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| match error.kind() {
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied {
                path: path.display().to_string(),
            },
            _ => Error::Io {
                error,
                path: path.display().to_string(),
            },
        })
    }
}
