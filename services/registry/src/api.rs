//! API server builder, router and request authentication

use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::credentials::Claims;
use crate::error::{RegistryError, RegistryResult};
use crate::service::{AccessService, Health, Info, Metrics};

/// Path prefix every route is mounted under.
pub const API_PREFIX: &str = "/api/v1";

/// Registry builder for configuring and creating the HTTP service
#[derive(Debug)]
pub struct RegistryBuilder {
    service: AccessService,
}

impl RegistryBuilder {
    /// Serve `service` under [API_PREFIX].
    pub fn new(service: AccessService) -> Self {
        Self { service }
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let routes = Router::new()
            .route("/registry/health", get(health))
            .route("/registry/info", get(info))
            .route("/registry/metrics", get(metrics))
            .merge(crate::auth::router())
            .merge(crate::images::router())
            .merge(crate::users::router());

        Router::new()
            .nest(API_PREFIX, routes)
            .layer(TraceLayer::new_for_http())
            .with_state(self.service)
    }
}

/// The raw token from an `Authorization: Bearer` header.
#[derive(Debug)]
pub struct Bearer(pub String);

impl<S> FromRequestParts<S> for Bearer
where
    S: Send + Sync,
{
    type Rejection = RegistryError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(RegistryError::Unauthorized)?;

        let (scheme, token) = value
            .trim()
            .split_once(' ')
            .ok_or(RegistryError::Unauthorized)?;
        let token = token.trim();
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(RegistryError::Unauthorized);
        }
        Ok(Bearer(token.to_string()))
    }
}

/// Claims of a caller holding a valid token. Per-operation policy checks
/// happen in the service.
#[derive(Debug)]
pub struct Authenticated(pub Claims);

impl FromRequestParts<AccessService> for Authenticated {
    type Rejection = RegistryError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &AccessService,
    ) -> Result<Self, Self::Rejection> {
        let Bearer(token) = Bearer::from_request_parts(parts, service).await?;
        let claims = service.credentials().verify(&token)?;
        Ok(Authenticated(claims))
    }
}

/// Liveness, including the metadata store
async fn health(State(service): State<AccessService>) -> RegistryResult<Json<Health>> {
    Ok(Json(service.health().await?))
}

/// Where the blob-transfer endpoint lives
async fn info(State(service): State<AccessService>) -> Json<Info> {
    Json(service.info())
}

/// Approximate image and tag counts
async fn metrics(
    State(service): State<AccessService>,
    Authenticated(claims): Authenticated,
) -> RegistryResult<Json<Metrics>> {
    Ok(Json(service.metrics(&claims).await?))
}
