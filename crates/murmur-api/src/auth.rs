use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use murmur_crypto::KeyRing;
use murmur_crypto::keys::key_to_base64;
use murmur_gateway::{AuthError, AuthService, Dispatcher};
use murmur_types::api::{
    ErrorResponse, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub auth: Arc<dyn AuthService>,
    pub keys: KeyRing,
    pub dispatcher: Dispatcher,
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidInput(reason) => Self::new(StatusCode::BAD_REQUEST, reason),
            AuthError::UsernameTaken => Self::new(StatusCode::CONFLICT, "username already taken"),
            // Unknown user and wrong password look the same from outside.
            AuthError::NotFound | AuthError::WrongPassword => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid username or password")
            }
            AuthError::Unavailable(reason) => {
                warn!(%reason, "Auth request failed");
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "try again later")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.register(&req.username, &req.password).await?;

    let key = state.keys.user_key(&req.username).map_err(|e| {
        warn!(username = %req.username, error = %e, "Key derivation failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            username: req.username,
            key: key_to_base64(&key),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = state.auth.verify(&req.username, &req.password).await?;

    Ok(Json(LoginResponse {
        username: identity.username,
    }))
}
