//! Login and token endpoints

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::Bearer;
use crate::error::RegistryResult;
use crate::service::{AccessService, LoginRequest, LoginResponse, TokenResponse, VerifyResponse};

/// Router for authentication
pub fn router() -> Router<AccessService> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/token", post(refresh))
        .route("/auth/verify", get(verify))
}

/// Exchange a username and password for a token
async fn login(
    State(service): State<AccessService>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> RegistryResult<Json<LoginResponse>> {
    let Json(request) = payload?;
    Ok(Json(service.login(request).await?))
}

/// Exchange a valid token for a fresh one
async fn refresh(
    State(service): State<AccessService>,
    Bearer(token): Bearer,
) -> RegistryResult<Json<TokenResponse>> {
    Ok(Json(service.refresh(&token).await?))
}

/// Decode a valid token
async fn verify(
    State(service): State<AccessService>,
    Bearer(token): Bearer,
) -> RegistryResult<Json<VerifyResponse>> {
    Ok(Json(service.verify(&token)?))
}
