use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use impact_tracker_api::{NewPrincipal, Page, ParentRef, TrackerApi, API_CONTRACT_VERSION};
use impact_tracker_core::{
    AttributeMap, AttributionContext, EntityId, EntityKind, JoinId, JoinKind, PrincipalId,
    RequestError, Role, TrackedKind,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TrackerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Request failure carried to the wire. Validation maps surface field
/// errors at the top level; a stale update keeps the `Record outdated`
/// body shape clients already parse.
#[derive(Debug)]
struct ServiceFailure(RequestError);

impl From<RequestError> for ServiceFailure {
    fn from(value: RequestError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        match self.0 {
            RequestError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "authentication required"})),
            )
                .into_response(),
            RequestError::Forbidden => {
                (StatusCode::FORBIDDEN, Json(json!({"error": "not allowed"}))).into_response()
            }
            RequestError::NotFound => {
                (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
            }
            RequestError::Conflict => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "Record outdated"})),
            )
                .into_response(),
            RequestError::Validation(errors) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(errors)).into_response()
            }
            RequestError::Storage(message) => {
                tracing::error!(%message, "storage failure");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal error"})))
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

impl PageParams {
    fn page(self) -> Page {
        let default = Page::default();
        Page {
            limit: self.limit.unwrap_or(default.limit),
            offset: self.offset.unwrap_or(default.offset),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterPayload {
    email: String,
    name: String,
    role: Option<String>,
}

/// A plural path segment resolved to the resource family it serves.
#[derive(Debug, Clone, Copy)]
enum Resource {
    Entity(EntityKind),
    Join(JoinKind),
}

fn resolve_resource(name: &str) -> Option<Resource> {
    if let Some(kind) = EntityKind::from_resource_name(name) {
        return Some(Resource::Entity(kind));
    }
    JoinKind::from_resource_name(name).map(Resource::Join)
}

#[derive(Debug, Parser)]
#[command(name = "impact-tracker-service")]
#[command(about = "HTTP service for the impact tracker")]
struct Args {
    #[arg(long, default_value = "./impact_tracker.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/principals", get(principals_index).post(principals_register))
        .route("/v1/principals/:id", axum::routing::delete(principals_archive))
        .route("/v1/:resource", get(index).post(create))
        .route("/v1/:resource/:id", get(show).patch(update).delete(destroy))
        .route("/v1/:resource/:id/:sub", get(nested_index_or_versions))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let state = ServiceState { api: TrackerApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind_addr = %args.bind, "impact-tracker-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Bind the acting principal from the `x-principal-id` header. A missing
/// header is an anonymous request; a present but unknown or archived id is
/// rejected outright.
fn bind_context(
    state: &ServiceState,
    headers: &HeaderMap,
) -> Result<AttributionContext, ServiceFailure> {
    let Some(raw) = headers.get("x-principal-id") else {
        return Ok(AttributionContext::anonymous());
    };

    let raw = raw.to_str().map_err(|_| ServiceFailure(RequestError::Unauthorized))?;
    let id = PrincipalId::parse(raw).ok_or(ServiceFailure(RequestError::Unauthorized))?;
    let principal = state
        .api
        .principal_by_id(id)?
        .filter(|principal| !principal.is_archived())
        .ok_or(ServiceFailure(RequestError::Unauthorized))?;

    let ctx = AttributionContext::acting_as(principal);
    tracing::debug!(
        request_id = %ctx.request_id,
        principal = ?ctx.whodunnit(),
        "request context bound"
    );
    Ok(ctx)
}

async fn health() -> Json<ServiceEnvelope<serde_json::Value>> {
    Json(envelope(json!({"status": "ok"})))
}

async fn principals_index(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    let principals = state.api.list_principals(&ctx)?;
    Ok(Json(envelope(principals)).into_response())
}

async fn principals_register(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterPayload>,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    let role = match payload.role.as_deref() {
        None => Role::Guest,
        Some(raw) => match Role::parse(raw) {
            Some(role) => role,
            None => {
                let mut errors = impact_tracker_core::ValidationErrors::new();
                errors.add("role", "is invalid");
                return Err(ServiceFailure(RequestError::Validation(errors)));
            }
        },
    };

    let principal = state.api.register_principal(
        &ctx,
        NewPrincipal { email: payload.email, name: payload.name, role },
    )?;
    let location = format!("/v1/principals/{}", principal.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(envelope(principal)),
    )
        .into_response())
}

async fn principals_archive(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    let id = PrincipalId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
    state.api.archive_principal(&ctx, id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn index(
    State(state): State<ServiceState>,
    Path(resource): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    match resolve_resource(&resource) {
        Some(Resource::Entity(kind)) => {
            let entities = state.api.list_entities(&ctx, kind, None, params.page())?;
            Ok(Json(envelope(entities)).into_response())
        }
        Some(Resource::Join(kind)) => {
            let joins = state.api.list_joins(&ctx, kind, params.page())?;
            Ok(Json(envelope(joins)).into_response())
        }
        None => Err(ServiceFailure(RequestError::NotFound)),
    }
}

async fn create(
    State(state): State<ServiceState>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    Json(attributes): Json<AttributeMap>,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    match resolve_resource(&resource) {
        Some(Resource::Entity(kind)) => {
            let entity = state.api.create_entity(&ctx, kind, &attributes)?;
            let location = format!("/v1/{resource}/{}", entity.id);
            Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(envelope(entity)))
                .into_response())
        }
        Some(Resource::Join(kind)) => {
            let join = state.api.create_join(&ctx, kind, &attributes)?;
            let location = format!("/v1/{resource}/{}", join.id);
            Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(envelope(join)))
                .into_response())
        }
        None => Err(ServiceFailure(RequestError::NotFound)),
    }
}

async fn show(
    State(state): State<ServiceState>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    match resolve_resource(&resource) {
        Some(Resource::Entity(kind)) => {
            let id = EntityId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            let entity = state.api.get_entity(&ctx, kind, id)?;
            Ok(Json(envelope(entity)).into_response())
        }
        Some(Resource::Join(kind)) => {
            let id = JoinId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            let join = state.api.get_join(&ctx, kind, id)?;
            Ok(Json(envelope(join)).into_response())
        }
        None => Err(ServiceFailure(RequestError::NotFound)),
    }
}

async fn update(
    State(state): State<ServiceState>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(attributes): Json<AttributeMap>,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    match resolve_resource(&resource) {
        Some(Resource::Entity(kind)) => {
            let id = EntityId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            let entity = state.api.update_entity(&ctx, kind, id, &attributes)?;
            Ok(Json(envelope(entity)).into_response())
        }
        Some(Resource::Join(kind)) => {
            // An edge without payload is present or absent, never edited in
            // place; its update route is not routable.
            if !kind.descriptor().update_permitted {
                return Err(ServiceFailure(RequestError::NotFound));
            }
            let id = JoinId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            let join = state.api.update_join(&ctx, kind, id, &attributes)?;
            Ok(Json(envelope(join)).into_response())
        }
        None => Err(ServiceFailure(RequestError::NotFound)),
    }
}

async fn destroy(
    State(state): State<ServiceState>,
    Path((resource, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;
    match resolve_resource(&resource) {
        Some(Resource::Entity(kind)) => {
            let id = EntityId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            state.api.delete_entity(&ctx, kind, id)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Some(Resource::Join(kind)) => {
            let id = JoinId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
            state.api.delete_join(&ctx, kind, id)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        None => Err(ServiceFailure(RequestError::NotFound)),
    }
}

async fn nested_index_or_versions(
    State(state): State<ServiceState>,
    Path((resource, id, sub)): Path<(String, String, String)>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Result<Response, ServiceFailure> {
    let ctx = bind_context(&state, &headers)?;

    if sub == "versions" {
        let item_type = match resolve_resource(&resource) {
            Some(Resource::Entity(kind)) => TrackedKind::Entity(kind),
            Some(Resource::Join(kind)) => TrackedKind::Join(kind),
            None => return Err(ServiceFailure(RequestError::NotFound)),
        };
        let item_id =
            Ulid::from_string(&id).map_err(|_| ServiceFailure(RequestError::NotFound))?;
        let versions = state.api.versions(&ctx, item_type, item_id)?;
        return Ok(Json(envelope(versions)).into_response());
    }

    let (Some(Resource::Entity(parent_kind)), Some(Resource::Entity(child_kind))) =
        (resolve_resource(&resource), resolve_resource(&sub))
    else {
        return Err(ServiceFailure(RequestError::NotFound));
    };
    let parent_id = EntityId::parse(&id).ok_or(ServiceFailure(RequestError::NotFound))?;
    let children = state.api.list_entities(
        &ctx,
        child_kind,
        Some(ParentRef { kind: parent_kind, id: parent_id }),
        params.page(),
    )?;
    Ok(Json(envelope(children)).into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use http::Request;
    use impact_tracker_core::{Principal, Role};
    use impact_tracker_store_sqlite::TrackerStore;
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("impact-tracker-service-{}.sqlite3", Ulid::new()))
    }

    fn seed_principal(db_path: &std::path::Path, role: Role) -> Principal {
        let mut store = match TrackerStore::open(db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:?}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate store: {err:?}");
        }
        let now = OffsetDateTime::now_utc();
        let principal = Principal {
            id: PrincipalId::new(),
            email: format!("{}-{}@example.org", role.as_str(), Ulid::new()),
            name: role.as_str().to_string(),
            role,
            created_at: now,
            updated_at: now,
            relationship_updated_at: None,
            relationship_updated_by_id: None,
            archived_at: None,
        };
        if let Err(err) = store.insert_principal(&principal) {
            panic!("failed to seed principal: {err:?}");
        }
        principal
    }

    fn request(
        method: &str,
        uri: &str,
        principal: Option<&Principal>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(principal) = principal {
            builder = builder.header("x-principal-id", principal.id.to_string());
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        };
        request.unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn data(value: &serde_json::Value) -> &serde_json::Value {
        value
            .get("data")
            .unwrap_or_else(|| panic!("missing data field in response: {value}"))
    }

    struct Harness {
        router: Router,
        db_path: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let db_path = unique_temp_db_path();
            let state = ServiceState { api: TrackerApi::new(db_path.clone()) };
            Self { router: app(state), db_path }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.db_path);
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let harness = Harness::new();
        let response = send(&harness.router, request("GET", "/v1/health", None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn anonymous_create_is_unauthorized_and_guest_join_index_forbidden() {
        let harness = Harness::new();

        let response = send(
            &harness.router,
            request("POST", "/v1/categories", None, Some(json!({"title": "Nope"}))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let guest = seed_principal(&harness.db_path, Role::Guest);
        let response =
            send(&harness.router, request("GET", "/v1/memberships", Some(&guest), None)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn create_update_destroy_flow_with_ownership_and_concurrency() {
        let harness = Harness::new();
        let manager = seed_principal(&harness.db_path, Role::Manager);
        let coordinator = seed_principal(&harness.db_path, Role::Coordinator);

        let created = send(
            &harness.router,
            request(
                "POST",
                "/v1/categories",
                Some(&manager),
                Some(json!({"title": "Water", "extraneous": true})),
            ),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let location = created
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_else(|| panic!("missing location header"))
            .to_string();
        let created_value = response_json(created).await;
        let id = data(&created_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing id in response: {created_value}"))
            .to_string();
        assert_eq!(location, format!("/v1/categories/{id}"));
        assert!(data(&created_value).get("extraneous").is_none());

        let updated_at = data(&created_value)
            .get("updated_at")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing updated_at in response: {created_value}"))
            .to_string();

        // Stale comparison value: whole-second mismatch.
        let stale = send(
            &harness.router,
            request(
                "PATCH",
                &format!("/v1/categories/{id}"),
                Some(&manager),
                Some(json!({"title": "Altered", "updated_at": "2001-01-01T00:00:00Z"})),
            ),
        )
        .await;
        assert_eq!(stale.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let stale_value = response_json(stale).await;
        assert_eq!(
            stale_value.get("error").and_then(serde_json::Value::as_str),
            Some("Record outdated")
        );

        let fresh = send(
            &harness.router,
            request(
                "PATCH",
                &format!("/v1/categories/{id}"),
                Some(&manager),
                Some(json!({"title": "Renamed", "updated_at": updated_at})),
            ),
        )
        .await;
        assert_eq!(fresh.status(), StatusCode::OK);

        let forbidden = send(
            &harness.router,
            request("DELETE", &format!("/v1/categories/{id}"), Some(&coordinator), None),
        )
        .await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let destroyed = send(
            &harness.router,
            request("DELETE", &format!("/v1/categories/{id}"), Some(&manager), None),
        )
        .await;
        assert_eq!(destroyed.status(), StatusCode::NO_CONTENT);

        let repeat = send(
            &harness.router,
            request("DELETE", &format!("/v1/categories/{id}"), Some(&manager), None),
        )
        .await;
        assert_eq!(repeat.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn published_scope_applies_to_anonymous_readers() {
        let harness = Harness::new();
        let manager = seed_principal(&harness.db_path, Role::Manager);

        let _draft = send(
            &harness.router,
            request("POST", "/v1/measures", Some(&manager), Some(json!({"title": "Draft"}))),
        )
        .await;
        let published = send(
            &harness.router,
            request(
                "POST",
                "/v1/measures",
                Some(&manager),
                Some(json!({"title": "Published", "published": true})),
            ),
        )
        .await;
        assert_eq!(published.status(), StatusCode::CREATED);

        let listed = send(&harness.router, request("GET", "/v1/measures", None, None)).await;
        assert_eq!(listed.status(), StatusCode::OK);
        let value = response_json(listed).await;
        let items = data(&value)
            .as_array()
            .unwrap_or_else(|| panic!("expected array payload: {value}"));
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].get("title").and_then(serde_json::Value::as_str),
            Some("Published")
        );

        let actors = send(&harness.router, request("GET", "/v1/actors", None, None)).await;
        assert_eq!(actors.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn join_routes_create_list_and_reject_in_place_edits() {
        let harness = Harness::new();
        let coordinator = seed_principal(&harness.db_path, Role::Coordinator);

        let measure = send(
            &harness.router,
            request("POST", "/v1/measures", Some(&coordinator), Some(json!({"title": "M"}))),
        )
        .await;
        let measure_value = response_json(measure).await;
        let measure_id = data(&measure_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing measure id"))
            .to_string();

        let indicator = send(
            &harness.router,
            request("POST", "/v1/indicators", Some(&coordinator), Some(json!({"title": "I"}))),
        )
        .await;
        let indicator_value = response_json(indicator).await;
        let indicator_id = data(&indicator_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing indicator id"))
            .to_string();

        let join = send(
            &harness.router,
            request(
                "POST",
                "/v1/measure_indicators",
                Some(&coordinator),
                Some(json!({"measure_id": measure_id, "indicator_id": indicator_id})),
            ),
        )
        .await;
        assert_eq!(join.status(), StatusCode::CREATED);
        let join_value = response_json(join).await;
        let join_id = data(&join_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing join id"))
            .to_string();

        let listed = send(
            &harness.router,
            request("GET", "/v1/measure_indicators", Some(&coordinator), None),
        )
        .await;
        assert_eq!(listed.status(), StatusCode::OK);

        // Pure edges expose no update route.
        let patched = send(
            &harness.router,
            request(
                "PATCH",
                &format!("/v1/measure_indicators/{join_id}"),
                Some(&coordinator),
                Some(json!({"value": "1"})),
            ),
        )
        .await;
        assert_eq!(patched.status(), StatusCode::NOT_FOUND);

        let unknown = send(
            &harness.router,
            request("GET", "/v1/widgets", Some(&coordinator), None),
        )
        .await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn nested_index_and_versions_routes_resolve() {
        let harness = Harness::new();
        let admin = seed_principal(&harness.db_path, Role::Admin);

        let category = send(
            &harness.router,
            request("POST", "/v1/categories", Some(&admin), Some(json!({"title": "Health"}))),
        )
        .await;
        let category_value = response_json(category).await;
        let category_id = data(&category_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing category id"))
            .to_string();

        let recommendation = send(
            &harness.router,
            request(
                "POST",
                "/v1/recommendations",
                Some(&admin),
                Some(json!({"title": "Linked"})),
            ),
        )
        .await;
        let recommendation_value = response_json(recommendation).await;
        let recommendation_id = data(&recommendation_value)
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing recommendation id"))
            .to_string();

        let join = send(
            &harness.router,
            request(
                "POST",
                "/v1/recommendation_categories",
                Some(&admin),
                Some(json!({
                    "recommendation_id": recommendation_id,
                    "category_id": category_id
                })),
            ),
        )
        .await;
        assert_eq!(join.status(), StatusCode::CREATED);

        let nested = send(
            &harness.router,
            request(
                "GET",
                &format!("/v1/categories/{category_id}/recommendations"),
                Some(&admin),
                None,
            ),
        )
        .await;
        assert_eq!(nested.status(), StatusCode::OK);
        let nested_value = response_json(nested).await;
        let items = data(&nested_value)
            .as_array()
            .unwrap_or_else(|| panic!("expected array payload: {nested_value}"));
        assert_eq!(items.len(), 1);

        let versions = send(
            &harness.router,
            request(
                "GET",
                &format!("/v1/recommendations/{recommendation_id}/versions"),
                Some(&admin),
                None,
            ),
        )
        .await;
        assert_eq!(versions.status(), StatusCode::OK);
        let versions_value = response_json(versions).await;
        let items = data(&versions_value)
            .as_array()
            .unwrap_or_else(|| panic!("expected array payload: {versions_value}"));
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].get("event").and_then(serde_json::Value::as_str),
            Some("create")
        );

        let manager = seed_principal(&harness.db_path, Role::Manager);
        let forbidden = send(
            &harness.router,
            request(
                "GET",
                &format!("/v1/recommendations/{recommendation_id}/versions"),
                Some(&manager),
                None,
            ),
        )
        .await;
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn archived_principals_are_rejected_at_the_boundary() {
        let harness = Harness::new();
        let admin = seed_principal(&harness.db_path, Role::Admin);
        let analyst = seed_principal(&harness.db_path, Role::Analyst);

        let archived = send(
            &harness.router,
            request("DELETE", &format!("/v1/principals/{}", analyst.id), Some(&admin), None),
        )
        .await;
        assert_eq!(archived.status(), StatusCode::NO_CONTENT);

        let rejected =
            send(&harness.router, request("GET", "/v1/measures", Some(&analyst), None)).await;
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    }
}
