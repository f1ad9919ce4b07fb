//! REST API endpoints for the document sequencer.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::instrument;
use uuid::Uuid;

use super::error::{validation_error, ApiError, ErrorCode};
use super::types::{
    AllocationResponse, CreateDefinitionRequest, DefinitionResponse, ListDefinitionsResponse,
    UpdateDefinitionRequest,
};
use crate::domain::{DefinitionId, DocumentType, SequenceKey, TenantId};
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/tenants/:tenant_id/sequences/:document_type/allocate",
            post(allocate_number),
        )
        .route(
            "/v1/tenants/:tenant_id/sequences/:document_type/preview",
            get(preview_number),
        )
        .route("/v1/tenants/:tenant_id/definitions", get(list_definitions))
        .route("/v1/definitions", post(create_definition))
        .route(
            "/v1/definitions/:id",
            get(get_definition)
                .put(update_definition)
                .delete(delete_definition),
        )
}

fn parse_uuid(field: &str, raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| validation_error(field, format!("Invalid {field}: {e}")))
}

fn parse_key(tenant_id: &str, document_type: String) -> ApiResult<SequenceKey> {
    let tenant_id = TenantId::from_uuid(parse_uuid("tenant_id", tenant_id)?);
    Ok(SequenceKey::new(tenant_id, DocumentType::from(document_type)))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::new(ErrorCode::InvalidRequestBody, rejection.body_text()))
}

// ============================================================================
// Allocation
// ============================================================================

#[instrument(skip(state))]
async fn allocate_number(
    State(state): State<AppState>,
    Path((tenant_id, document_type)): Path<(String, String)>,
) -> ApiResult<Json<AllocationResponse>> {
    let key = parse_key(&tenant_id, document_type)?;
    let allocated = state
        .allocator
        .allocate_next_with_retry(&key.tenant_id, &key.document_type)
        .await?;

    Ok(Json(AllocationResponse::new(key, allocated)))
}

async fn preview_number(
    State(state): State<AppState>,
    Path((tenant_id, document_type)): Path<(String, String)>,
) -> ApiResult<Json<AllocationResponse>> {
    let key = parse_key(&tenant_id, document_type)?;
    let preview = state
        .admin
        .preview_next(&key.tenant_id, &key.document_type)
        .await?;

    Ok(Json(AllocationResponse::new(key, preview)))
}

// ============================================================================
// Definitions
// ============================================================================

async fn list_definitions(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<ListDefinitionsResponse>> {
    let tenant_id = parse_uuid("tenant_id", &tenant_id)?;
    let definitions: Vec<DefinitionResponse> = state
        .admin
        .list(&TenantId::from_uuid(tenant_id))
        .await?
        .into_iter()
        .map(DefinitionResponse::from)
        .collect();

    Ok(Json(ListDefinitionsResponse {
        tenant_id,
        count: definitions.len(),
        definitions,
    }))
}

#[instrument(skip_all)]
async fn create_definition(
    State(state): State<AppState>,
    payload: Result<Json<CreateDefinitionRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DefinitionResponse>)> {
    let request = body(payload)?;
    let created = state
        .admin
        .create(
            TenantId::from_uuid(request.tenant_id),
            DocumentType::from(request.document_type),
            request.prefix,
            request.padding,
            request.reset_every_year,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(created.into())))
}

async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DefinitionResponse>> {
    let id = DefinitionId::from_uuid(parse_uuid("id", &id)?);
    let definition = state.admin.get(id).await?;
    Ok(Json(definition.into()))
}

#[instrument(skip(state, payload))]
async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateDefinitionRequest>, JsonRejection>,
) -> ApiResult<Json<DefinitionResponse>> {
    let id = DefinitionId::from_uuid(parse_uuid("id", &id)?);
    let request = body(payload)?;
    let updated = state
        .admin
        .update(id, request.prefix, request.padding, request.reset_every_year)
        .await?;

    Ok(Json(updated.into()))
}

#[instrument(skip(state))]
async fn delete_definition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = DefinitionId::from_uuid(parse_uuid("id", &id)?);
    state.admin.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
