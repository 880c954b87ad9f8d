use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::logic::{ConfigUpdate, Mutation, UpdateCoordinator, UpdateResult};
use crate::model::{
    ConfigDiff, ConfigurationDocument, FieldUpdates, Fingerprint, Locator, NodeKind,
    RevisionSummary, UserContext,
};
use crate::store::traits::{ConfigStore, EditingSnapshot, StoreError};

pub type AppState<S> = Arc<UpdateCoordinator<S>>;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub fingerprint: Fingerprint,
    pub document: ConfigurationDocument,
}

#[derive(Debug, Serialize)]
pub struct RevisionResponse {
    #[serde(flatten)]
    pub summary: RevisionSummary,
    pub document: ConfigurationDocument,
}

#[derive(Debug, Serialize)]
pub struct FingerprintMatchResponse {
    pub fingerprint: Fingerprint,
    pub matches: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditQuery {
    /// Locator such as `pipeline:p1/stage:build`
    pub path: Option<String>,
}

/// Body of PUT /config/nodes
#[derive(Debug, Deserialize)]
pub struct UpdateNodeRequest {
    pub locator: String,
    #[serde(default)]
    pub fields: FieldUpdates,
    /// Fingerprint of the configuration the editor loaded
    pub config_md5: Option<Fingerprint>,
}

/// Body of POST /config/nodes
#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    /// Parent of the new node
    pub locator: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub fields: FieldUpdates,
    pub config_md5: Option<Fingerprint>,
}

/// Body of DELETE /config/nodes
#[derive(Debug, Deserialize)]
pub struct RemoveNodeRequest {
    pub locator: String,
    pub config_md5: Option<Fingerprint>,
}

/// Body of POST /config/nodes/move
#[derive(Debug, Deserialize)]
pub struct MoveNodeRequest {
    pub locator: String,
    /// -1 moves the node before its previous sibling, 1 after its next one
    pub delta: isize,
    pub config_md5: Option<Fingerprint>,
}

fn storage_error(e: StoreError) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse::new(&e.to_string())),
    )
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

fn parse_locator(raw: &str) -> Result<Locator, ApiError> {
    raw.parse::<Locator>()
        .map_err(|e| bad_request(&format!("Invalid locator '{}': {}", raw, e)))
}

/// Split a node locator into its parent locator and the node's own segment
fn parent_and_segment(locator: &Locator) -> Result<(Locator, crate::model::Segment), ApiError> {
    match (locator.parent(), locator.last()) {
        (Some(parent), Some(segment)) => Ok((parent, segment.clone())),
        _ => Err(bad_request("The configuration root cannot be removed or moved")),
    }
}

fn respond(result: UpdateResult) -> (StatusCode, Json<UpdateResult>) {
    let status =
        StatusCode::from_u16(result.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(result))
}

async fn run<S: ConfigStore>(
    coordinator: &UpdateCoordinator<S>,
    command: Result<ConfigUpdate, crate::logic::CommandError>,
    user: &UserContext,
) -> Result<(StatusCode, Json<UpdateResult>), ApiError> {
    let command = command.map_err(|e| bad_request(&e.to_string()))?;
    Ok(respond(coordinator.execute(&command, user).await))
}

pub async fn get_config<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let (document, fingerprint) = coordinator.current().await.map_err(storage_error)?;
    Ok(Json(ConfigResponse {
        fingerprint,
        document,
    }))
}

pub async fn get_config_for_edit<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    Query(query): Query<EditQuery>,
    user: UserContext,
) -> Result<Json<EditingSnapshot>, Response> {
    let locator = match query.path.as_deref() {
        Some(path) => parse_locator(path).map_err(IntoResponse::into_response)?,
        None => Locator::root(),
    };

    coordinator
        .load_for_edit(&locator, &user)
        .await
        .map(Json)
        .map_err(|result| respond(result).into_response())
}

pub async fn list_revisions<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
) -> Result<Json<ListResponse<RevisionSummary>>, ApiError> {
    let items = coordinator.history().await.map_err(storage_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn get_revision<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<RevisionResponse>, ApiError> {
    let fingerprint = Fingerprint::new(fingerprint);
    let Some(revision) = coordinator
        .revision(&fingerprint)
        .await
        .map_err(storage_error)?
    else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Revision {} not found", fingerprint))),
        ));
    };

    let document = revision.document().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(&e.to_string())),
        )
    })?;
    Ok(Json(RevisionResponse {
        summary: revision.summary(),
        document,
    }))
}

pub async fn check_fingerprint<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<FingerprintMatchResponse>, ApiError> {
    let fingerprint = Fingerprint::new(fingerprint);
    let matches = coordinator
        .fingerprint_matches(&fingerprint)
        .await
        .map_err(storage_error)?;
    Ok(Json(FingerprintMatchResponse {
        fingerprint,
        matches,
    }))
}

pub async fn get_changes<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    Path((later, earlier)): Path<(String, String)>,
) -> Result<Json<ConfigDiff>, ApiError> {
    coordinator
        .changes_between(&Fingerprint::new(later), &Fingerprint::new(earlier))
        .await
        .map_err(storage_error)?
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("One of the requested revisions was not found")),
            )
        })
}

/// Set attributes on a node; a `name` field renames it
pub async fn update_node<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    user: UserContext,
    Json(request): Json<UpdateNodeRequest>,
) -> Result<(StatusCode, Json<UpdateResult>), ApiError> {
    let locator = parse_locator(&request.locator)?;
    let command = ConfigUpdate::builder()
        .locator(locator)
        .mutation(Mutation::SetAttributes)
        .input(request.fields)
        .based_on(request.config_md5)
        .build();
    run(&coordinator, command, &user).await
}

pub async fn add_node<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    user: UserContext,
    Json(request): Json<AddNodeRequest>,
) -> Result<(StatusCode, Json<UpdateResult>), ApiError> {
    let locator = parse_locator(&request.locator)?;
    let command = ConfigUpdate::builder()
        .locator(locator)
        .mutation(Mutation::AddChild { kind: request.kind })
        .input(request.fields)
        .based_on(request.config_md5)
        .build();
    run(&coordinator, command, &user).await
}

pub async fn remove_node<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    user: UserContext,
    Json(request): Json<RemoveNodeRequest>,
) -> Result<(StatusCode, Json<UpdateResult>), ApiError> {
    let (parent, segment) = parent_and_segment(&parse_locator(&request.locator)?)?;
    let command = ConfigUpdate::builder()
        .locator(parent)
        .mutation(Mutation::RemoveChild(segment))
        .based_on(request.config_md5)
        .build();
    run(&coordinator, command, &user).await
}

pub async fn move_node<S: ConfigStore>(
    State(coordinator): State<AppState<S>>,
    user: UserContext,
    Json(request): Json<MoveNodeRequest>,
) -> Result<(StatusCode, Json<UpdateResult>), ApiError> {
    let (parent, segment) = parent_and_segment(&parse_locator(&request.locator)?)?;
    let command = ConfigUpdate::builder()
        .locator(parent)
        .mutation(Mutation::MoveChild {
            segment,
            delta: request.delta,
        })
        .based_on(request.config_md5)
        .build();
    run(&coordinator, command, &user).await
}
