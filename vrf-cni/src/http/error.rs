use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::Error;
use crate::http::Reply;

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Provision { source, .. } => source.status_code(),
            Error::NetworkNotFound(_)
            | Error::InvalidAnnotation(_)
            | Error::JsonConversion(_) => StatusCode::BAD_REQUEST,
            Error::Dataplane(_)
            | Error::NotFound(_)
            | Error::UnsupportedStateVersion { .. }
            | Error::StateDecode(_)
            | Error::StateEncode(_)
            | Error::IoError(_)
            | Error::YamlConversion(_)
            | Error::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            error!(e = %self, "request failed");
        }
        let reply = Reply {
            status: "fail".into(),
            message: Some(self.to_string()),
        };
        (code, Json(reply)).into_response()
    }
}
