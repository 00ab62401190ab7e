use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use registry_sync_api::{AuditPoll, AuditPoller, RegistrySyncApi, API_CONTRACT_VERSION};
use registry_sync_core::EntityId;
use registry_sync_store_sqlite::{EntityDetail, EntityPage, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_PER_PAGE: u32 = 5;

#[derive(Debug, Clone)]
struct ServiceState {
    api: RegistrySyncApi,
    poller: Arc<Mutex<AuditPoller>>,
    per_page: u32,
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

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListParams {
    page: Option<u32>,
    per_page: Option<u32>,
}

#[derive(Debug, Parser)]
#[command(name = "registry-sync-service")]
#[command(about = "Local read-only HTTP service over a synchronized registry")]
struct Args {
    #[arg(long, env = "REGSYNC_DB", default_value = "./registry_sync.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "REGSYNC_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = DEFAULT_PER_PAGE)]
    per_page: u32,
    #[arg(short, long)]
    verbose: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn new(api: RegistrySyncApi, per_page: u32) -> Self {
        Self { api, poller: Arc::new(Mutex::new(AuditPoller::new())), per_page }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> ServiceError {
        let error = format!("{err:#}");
        tracing::error!(%error, "request failed");
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/entities", get(entity_list))
        // Entity ids carry a slash, e.g. 2023/1234.
        .route("/v1/entities/*entity_id", get(entity_show))
        .route("/v1/audit/poll", get(audit_poll))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let state = ServiceState::new(RegistrySyncApi::new(args.db), args.per_page.max(1));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "registry sync service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::internal(&err))?;
    Ok(Json(envelope(status)))
}

async fn entity_list(
    State(state): State<ServiceState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ServiceEnvelope<EntityPage>>, ServiceError> {
    let page = params.page.unwrap_or(1);
    let per_page = params.per_page.unwrap_or(state.per_page);
    let listing =
        state.api.list_entities(page, per_page).map_err(|err| ServiceState::internal(&err))?;
    Ok(Json(envelope(listing)))
}

async fn entity_show(
    State(state): State<ServiceState>,
    Path(entity_id): Path<String>,
) -> Result<Json<ServiceEnvelope<EntityDetail>>, ServiceError> {
    let entity_id = EntityId::from(entity_id.trim_start_matches('/'));
    let detail =
        state.api.entity_detail(&entity_id).map_err(|err| ServiceState::internal(&err))?;
    let Some(detail) = detail else {
        return Err(ServiceState::error(
            StatusCode::NOT_FOUND,
            format!("entity {entity_id} not found"),
        ));
    };
    Ok(Json(envelope(detail)))
}

async fn audit_poll(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<AuditPoll>>, ServiceError> {
    let counters = state.api.audit_counters().map_err(|err| ServiceState::internal(&err))?;
    let mut poller = state.poller.lock().map_err(|_| {
        ServiceState::error(StatusCode::INTERNAL_SERVER_ERROR, "audit poller lock poisoned")
    })?;
    Ok(Json(envelope(poller.observe(counters))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use registry_sync_core::{NationalityRow, RemoteRecord};
    use registry_sync_store_sqlite::SqliteStore;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("registry-sync-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn state_for(db_path: PathBuf) -> ServiceState {
        ServiceState::new(RegistrySyncApi::new(db_path), DEFAULT_PER_PAGE)
    }

    fn seed(db_path: &std::path::Path, entities: &[(&str, &str)]) {
        let mut store = match SqliteStore::open(db_path) {
            Ok(store) => store,
            Err(err) => panic!("failed to open seed store: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate seed store: {err}");
        }
        for (entity_id, name) in entities {
            let mut record = RemoteRecord::new(*entity_id);
            record.name = Some((*name).to_string());
            record.nationalities =
                Some(vec![NationalityRow { nationality: Some("US".to_string()) }]);
            if let Err(err) = store.apply_unseen(&record) {
                panic!("failed to seed {entity_id}: {err}");
            }
        }
    }

    async fn get_uri(router: &Router, uri: &str) -> Response {
        match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_text(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let body = response_text(response).await;
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn data_field<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
        value.get("data").and_then(|data| data.get(key))
    }

    fn cleanup(db_path: &std::path::Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(state_for(unique_temp_db_path()));

        let response = get_uri(&router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_field(&value, "status").and_then(serde_json::Value::as_str), Some("ok"));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = app(state_for(unique_temp_db_path()));

        let response = get_uri(&router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_text(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/entities/{entity_id}"));
        assert!(body.contains("/v1/audit/poll"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn entity_listing_is_paginated_by_name() {
        let db_path = unique_temp_db_path();
        seed(&db_path, &[("2023/3", "CARTER"), ("2023/1", "ADAMS"), ("2023/2", "BAKER")]);
        let router = app(state_for(db_path.clone()));

        let response = get_uri(&router, "/v1/entities?page=2&per_page=2").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(data_field(&value, "total").and_then(serde_json::Value::as_i64), Some(3));
        assert_eq!(data_field(&value, "total_pages").and_then(serde_json::Value::as_i64), Some(2));
        let names: Vec<&str> = data_field(&value, "entities")
            .and_then(serde_json::Value::as_array)
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|entity| entity.get("name").and_then(serde_json::Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(names, vec!["CARTER"]);

        let default_page = response_json(get_uri(&router, "/v1/entities").await).await;
        assert_eq!(
            data_field(&default_page, "per_page").and_then(serde_json::Value::as_u64),
            Some(u64::from(DEFAULT_PER_PAGE))
        );

        cleanup(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn entity_detail_accepts_slashed_ids_and_404s_unknown() {
        let db_path = unique_temp_db_path();
        seed(&db_path, &[("2023/1234", "DOE")]);
        let router = app(state_for(db_path.clone()));

        let response = get_uri(&router, "/v1/entities/2023/1234").await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            data_field(&value, "entity_id").and_then(serde_json::Value::as_str),
            Some("2023/1234")
        );
        assert_eq!(
            data_field(&value, "nationalities")
                .and_then(serde_json::Value::as_array)
                .map(Vec::len),
            Some(1)
        );

        let missing = get_uri(&router, "/v1/entities/2023/9999").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let error = response_json(missing).await;
        assert!(error
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|message| message.contains("2023/9999")));

        cleanup(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn audit_poll_reports_growth_once() {
        let db_path = unique_temp_db_path();
        seed(&db_path, &[("2023/1", "ADAMS")]);
        let router = app(state_for(db_path.clone()));

        let first = response_json(get_uri(&router, "/v1/audit/poll").await).await;
        assert_eq!(
            data_field(&first, "has_new_data_added").and_then(serde_json::Value::as_bool),
            Some(true)
        );
        assert_eq!(
            data_field(&first, "has_new_data_changed").and_then(serde_json::Value::as_bool),
            Some(false)
        );

        let second = response_json(get_uri(&router, "/v1/audit/poll").await).await;
        assert_eq!(
            data_field(&second, "has_new_data_added").and_then(serde_json::Value::as_bool),
            Some(false)
        );

        seed(&db_path, &[("2023/2", "BAKER")]);
        let third = response_json(get_uri(&router, "/v1/audit/poll").await).await;
        assert_eq!(
            data_field(&third, "has_new_data_added").and_then(serde_json::Value::as_bool),
            Some(true)
        );

        cleanup(&db_path);
    }
}
