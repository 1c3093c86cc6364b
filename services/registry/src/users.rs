//! User management

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use metadata::User;

use crate::api::Authenticated;
use crate::error::RegistryResult;
use crate::service::{AccessService, CreateUserRequest, Message, UpdateUserRequest};

/// Router for user operations
pub fn router() -> Router<AccessService> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{username}", put(update_user).delete(delete_user))
}

async fn list_users(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
) -> RegistryResult<Json<Vec<User>>> {
    Ok(Json(service.list_users(&claims).await?))
}

async fn create_user(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> RegistryResult<(StatusCode, Json<User>)> {
    let Json(request) = payload?;
    let user = service.create_user(&claims, request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn update_user(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path(username): Path<String>,
    payload: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> RegistryResult<Json<User>> {
    let Json(request) = payload?;
    Ok(Json(service.update_user(&claims, &username, request).await?))
}

async fn delete_user(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path(username): Path<String>,
) -> RegistryResult<Json<Message>> {
    Ok(Json(service.delete_user(&claims, &username).await?))
}
