//! Image and tag operations

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use metadata::{Image, Published, Tag};

use crate::api::Authenticated;
use crate::error::RegistryResult;
use crate::service::{AccessService, CreateImageRequest, Message, PublishTagRequest};

/// Router for image operations
///
/// Image names containing `/` must be percent-encoded in the path.
pub fn router() -> Router<AccessService> {
    Router::new()
        .route("/images", get(list_images).post(create_image))
        .route("/images/{name}", get(get_image).delete(delete_image))
        .route("/images/{name}/tags", get(list_tags))
        .route(
            "/images/{name}/tags/{tag}",
            put(publish_tag).delete(delete_tag),
        )
        .route("/images/{name}/tags/{tag}/pulls", post(record_pull))
}

async fn list_images(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
) -> RegistryResult<Json<Vec<Image>>> {
    Ok(Json(service.list_images(&claims).await?))
}

async fn create_image(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    payload: Result<Json<CreateImageRequest>, JsonRejection>,
) -> RegistryResult<(StatusCode, Json<Image>)> {
    let Json(request) = payload?;
    let image = service.create_image(&claims, request).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

async fn get_image(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path(name): Path<String>,
) -> RegistryResult<Json<Image>> {
    Ok(Json(service.get_image(&claims, &name).await?))
}

/// Delete an image together with its tags
async fn delete_image(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path(name): Path<String>,
) -> RegistryResult<Json<Message>> {
    Ok(Json(service.delete_image(&claims, &name).await?))
}

async fn list_tags(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path(name): Path<String>,
) -> RegistryResult<Json<Vec<Tag>>> {
    Ok(Json(service.list_tags(&claims, &name).await?))
}

/// Record a pushed tag. Created tags answer 201, repointed ones 200.
async fn publish_tag(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path((name, tag)): Path<(String, String)>,
    payload: Result<Json<PublishTagRequest>, JsonRejection>,
) -> RegistryResult<(StatusCode, Json<Published>)> {
    let Json(request) = payload?;
    let published = service.publish_tag(&claims, &name, &tag, request).await?;
    let status = if published.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(published)))
}

async fn record_pull(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path((name, tag)): Path<(String, String)>,
) -> RegistryResult<Json<Tag>> {
    Ok(Json(service.record_pull(&claims, &name, &tag).await?))
}

async fn delete_tag(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
    Path((name, tag)): Path<(String, String)>,
) -> RegistryResult<Json<Message>> {
    Ok(Json(service.delete_tag(&claims, &name, &tag).await?))
}
