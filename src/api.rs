//! REST API for the measurement planner.
//!
//! Exposes the candidate builder, the validator and the point search over
//! HTTP. Uses Axum as the web framework and supports CORS.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Router,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use utoipa::{OpenApi, ToSchema};

use crate::candidates::{CandidateSpace, build_candidates};
use crate::config::{ApiConfig, PlannerConfig};
use crate::model::{
    AxisFlags, Enclosure, LayoutRules, PointReport, SourcePoint, ValidationError, ViolationReport,
    ZUniqueness,
};
use crate::optimizer::{
    CancelFlag, FallbackTier, SearchConfig, SearchDiagnostics, SearchInput, Termination,
    select_points, select_points_with,
};
use crate::random::SeededRandom;
use crate::scene::{Generation, GenerationStatus, Scene};
use crate::types::{Vec2, Vec3};
use crate::validator::validate;

#[derive(Clone)]
struct ApiState {
    planner: PlannerConfig,
}

static OPENAPI_DOC: OnceLock<utoipa::openapi::OpenApi> = OnceLock::new();

const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <title>measure-planner API Docs</title>
        <link
            rel="stylesheet"
            href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css"
            integrity="sha384-wxLW6kwyHktdDGr6Pv1zgm/VGJh99lfUbzSn6HNHBENZlCN7W602k9VkGdxuFvPn"
            crossorigin="anonymous"
        />
    </head>
    <body>
        <div id="swagger-ui"></div>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"
            integrity="sha384-wmyclcVGX/WhUkdkATwhaK1X1JtiNrr2EoYJ+diV3vj4v6OC5yCeSu+yW13SYJep"
            crossorigin="anonymous"
        ></script>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-standalone-preset.js"
            integrity="sha384-2YH8WDRaj7V2OqU/trsmzSagmk/E2SutiCsGkdgoQwC9pNUJV1u/141DHB6jgs8t"
            crossorigin="anonymous"
        ></script>
        <script>
            window.onload = function () {
                const ui = SwaggerUIBundle({
                    url: "/docs/openapi.json",
                    dom_id: "#swagger-ui",
                    presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
                    layout: "StandaloneLayout",
                });
                window.ui = ui;
            };
        </script>
    </body>
    </html>"##;

fn openapi_doc() -> &'static utoipa::openapi::OpenApi {
    OPENAPI_DOC.get_or_init(ApiDoc::openapi)
}

/// Request for the candidate space of a room.
#[derive(Deserialize, ToSchema)]
#[schema(example = json!({
    "enclosure": {
        "vertices": [
            { "x": 0.0, "y": 0.0 },
            { "x": 3.0, "y": 0.0 },
            { "x": 3.0, "y": 2.0 },
            { "x": 0.0, "y": 2.0 }
        ],
        "height": 2.5
    },
    "margin": 0.5,
    "step": 0.1
}))]
pub struct CandidatesRequest {
    pub enclosure: Enclosure,
    /// Defaults to the configured margin
    #[serde(default)]
    #[schema(nullable = true)]
    pub margin: Option<f64>,
    /// Defaults to 0.1
    #[serde(default)]
    #[schema(nullable = true)]
    pub step: Option<f64>,
}

#[derive(Serialize, ToSchema)]
pub struct CandidatesResponse {
    pub count: usize,
    pub floor_cells: usize,
    pub z_levels: Vec<f64>,
    pub area: f64,
    pub volume: f64,
    pub points: Vec<Vec3>,
}

/// Request to check a point set against the layout rules.
#[derive(Deserialize, ToSchema)]
pub struct ValidateRequest {
    pub enclosure: Enclosure,
    pub sources: Vec<SourcePoint>,
    #[serde(default)]
    pub measurements: Vec<Vec3>,
}

#[derive(Serialize, ToSchema)]
pub struct ValidateResponse {
    pub clean: bool,
    pub report: ViolationReport,
    pub summary: Vec<String>,
}

/// Request for a point search.
///
/// Without `candidates` the candidate space is built from the enclosure.
#[derive(Deserialize, Clone, ToSchema)]
#[schema(example = json!({
    "enclosure": {
        "vertices": [
            { "x": 0.0, "y": 0.0 },
            { "x": 3.0, "y": 0.0 },
            { "x": 3.0, "y": 2.0 },
            { "x": 0.0, "y": 2.0 }
        ],
        "height": 2.5
    },
    "sources": [
        { "position": { "x": 0.5, "y": 1.5, "z": 1.8 }, "active": true },
        { "position": { "x": 2.5, "y": 0.5, "z": 1.1 }, "active": true }
    ],
    "seed": "test123",
    "generation": 0
}))]
pub struct SelectRequest {
    pub enclosure: Enclosure,
    pub sources: Vec<SourcePoint>,
    #[serde(default)]
    #[schema(nullable = true)]
    pub seed: Option<String>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    #[schema(nullable = true)]
    pub candidates: Option<Vec<Vec3>>,
}

#[derive(Debug)]
struct ValidatedSelectRequest {
    enclosure: Enclosure,
    sources: Vec<SourcePoint>,
    seed: Option<String>,
    generation: u64,
    candidates: CandidateSpace,
}

impl SelectRequest {
    fn into_validated(self, rules: &LayoutRules) -> Result<ValidatedSelectRequest, ValidationError> {
        self.enclosure.check()?;
        for (i, source) in self.sources.iter().enumerate() {
            if !source.position.is_finite() {
                return Err(ValidationError::NonFiniteValue(format!(
                    "Source {} position must be finite",
                    i + 1
                )));
            }
        }

        let candidates = match self.candidates {
            Some(points) => {
                if let Some(index) = points.iter().position(|p| !p.is_finite()) {
                    return Err(ValidationError::NonFiniteValue(format!(
                        "Candidate {} must be finite",
                        index + 1
                    )));
                }
                let supplied = points.len();
                let space =
                    CandidateSpace::from_points_within(points, &self.enclosure, rules.margin);
                if space.len() < supplied {
                    info!(
                        "Kept {} of {} supplied candidates inside the room margins",
                        space.len(),
                        supplied
                    );
                }
                space
            }
            None => build_candidates(&self.enclosure, rules.margin, LayoutRules::DEFAULT_STEP)?,
        };

        Ok(ValidatedSelectRequest {
            enclosure: self.enclosure,
            sources: self
                .sources
                .into_iter()
                .map(|s| SourcePoint {
                    position: s.position.snapped(),
                    active: s.active,
                })
                .collect(),
            seed: self.seed,
            generation: self.generation,
            candidates,
        })
    }
}

#[derive(Serialize, ToSchema)]
pub struct SelectResponse {
    pub points: Vec<Vec3>,
    pub feasible: bool,
    pub diagnostics: SearchDiagnostics,
    /// Remaining rule violations of the returned points
    pub issues: Vec<String>,
}

/// Request to generate the next layout of a scene.
#[derive(Deserialize, ToSchema)]
pub struct GenerateRequest {
    pub scene: Scene,
    /// Skip one generation step first ("another combination")
    #[serde(default)]
    pub another: bool,
}

#[derive(Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
    details: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}

fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    details: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(error, details))).into_response()
}

fn json_deserialize_error(err: JsonRejection) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid JSON data",
        err.to_string(),
    )
}

fn validation_error(err: ValidationError) -> Response {
    let error = match err {
        ValidationError::InvalidStep(_) | ValidationError::InvalidMargin(_) => {
            "Invalid grid configuration"
        }
        _ => "Invalid input data",
    };
    error_response(StatusCode::UNPROCESSABLE_ENTITY, error, err.to_string())
}

fn worker_error(details: impl Into<String>) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Search task failed",
        details,
    )
}

fn unwrap_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(payload)) => Ok(payload),
        Err(err) => Err(json_deserialize_error(err)),
    }
}

fn run_select(
    request: ValidatedSelectRequest,
    rules: LayoutRules,
    search: SearchConfig,
) -> SelectResponse {
    let outcome = select_points(
        &SearchInput {
            sources: &request.sources,
            candidates: request.candidates.points(),
            seed: request.seed.as_deref(),
            generation: request.generation,
        },
        &rules,
        &search,
    );
    let issues = validate(&request.sources, &outcome.points, &request.enclosure, &rules).summary();
    SelectResponse {
        points: outcome.points,
        feasible: outcome.feasible,
        diagnostics: outcome.diagnostics,
        issues,
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handle_candidates,
        handle_validate,
        handle_select,
        handle_select_stream,
        handle_generate
    ),
    components(
        schemas(
            CandidatesRequest,
            CandidatesResponse,
            ValidateRequest,
            ValidateResponse,
            SelectRequest,
            SelectResponse,
            GenerateRequest,
            Generation,
            GenerationStatus,
            Scene,
            ErrorResponse,
            Enclosure,
            SourcePoint,
            Vec2,
            Vec3,
            ViolationReport,
            PointReport,
            AxisFlags,
            ZUniqueness,
            SearchDiagnostics,
            Termination,
            FallbackTier
        )
    ),
    tags((name = "planning", description = "Endpoints for measurement point planning"))
)]
struct ApiDoc;

fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/candidates", post(handle_candidates))
        .route("/validate", post(handle_validate))
        .route("/select", post(handle_select))
        .route("/select_stream", post(handle_select_stream))
        .route("/scene/generate", post(handle_generate))
        .route("/docs/openapi.json", get(serve_openapi_json))
        .route("/docs", get(serve_openapi_ui))
        .layer(cors)
        .with_state(state)
}

/// Starts the API server.
///
/// Blocks until the server is terminated.
pub async fn start_api_server(config: ApiConfig, planner: PlannerConfig) -> std::io::Result<()> {
    let app = router(ApiState { planner });

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        error!("Could not bind API server to {}: {}", addr, err);
        err
    })?;

    info!(
        "Server running on http://{}:{}",
        config.display_host(),
        config.port()
    );
    if config.binds_to_all_interfaces() {
        info!("Local access: http://localhost:{}", config.port());
    }
    info!("Endpoints: POST /candidates, /validate, /select, /select_stream, /scene/generate");
    info!("Documentation: GET /docs, /docs/openapi.json");

    axum::serve(listener, app).await
}

/// Handler for POST /candidates.
///
/// Builds the grid of admissible measurement positions of a room.
#[utoipa::path(
    post,
    path = "/candidates",
    request_body = CandidatesRequest,
    responses(
        (status = 200, description = "Candidate space of the room", body = CandidatesResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid room or grid", body = ErrorResponse)
    ),
    tag = "planning"
)]
async fn handle_candidates(
    State(state): State<ApiState>,
    payload: Result<Json<CandidatesRequest>, JsonRejection>,
) -> Response {
    let request = match unwrap_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let margin = request
        .margin
        .unwrap_or(state.planner.layout_rules().margin);
    let step = request.step.unwrap_or(LayoutRules::DEFAULT_STEP);
    let space = match request
        .enclosure
        .check()
        .and_then(|_| build_candidates(&request.enclosure, margin, step))
    {
        Ok(space) => space,
        Err(err) => return validation_error(err),
    };

    info!(
        "Candidate space: {} points ({} floor cells, {} levels)",
        space.len(),
        space.floor_cells(),
        space.z_levels().len()
    );
    let response = CandidatesResponse {
        count: space.len(),
        floor_cells: space.floor_cells(),
        z_levels: space.z_levels().to_vec(),
        area: request.enclosure.area(),
        volume: request.enclosure.volume(),
        points: space.into_points(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Handler for POST /validate.
///
/// Reports every rule violation of a set of sources and measurement points.
#[utoipa::path(
    post,
    path = "/validate",
    request_body = ValidateRequest,
    responses(
        (status = 200, description = "Violation report", body = ValidateResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid room", body = ErrorResponse)
    ),
    tag = "planning"
)]
async fn handle_validate(
    State(state): State<ApiState>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Response {
    let request = match unwrap_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    if let Err(err) = request.enclosure.check() {
        return validation_error(err);
    }

    let report = validate(
        &request.sources,
        &request.measurements,
        &request.enclosure,
        &state.planner.layout_rules(),
    );
    let response = ValidateResponse {
        clean: report.is_clean(),
        summary: report.summary(),
        report,
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// Handler for POST /select.
///
/// Searches five measurement points; infeasible rooms still yield a
/// best-effort layout with `feasible = false`.
#[utoipa::path(
    post,
    path = "/select",
    request_body = SelectRequest,
    responses(
        (status = 200, description = "Selected measurement points", body = SelectResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid request", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Search task failed", body = ErrorResponse)
    ),
    tag = "planning"
)]
async fn handle_select(
    State(state): State<ApiState>,
    payload: Result<Json<SelectRequest>, JsonRejection>,
) -> Response {
    let rules = state.planner.layout_rules();
    let request = match unwrap_payload(payload).and_then(|request| {
        request
            .into_validated(&rules)
            .map_err(validation_error)
    }) {
        Ok(request) => request,
        Err(response) => return response,
    };

    info!(
        "New select request: {} candidates, {} active sources, seeded: {}",
        request.candidates.len(),
        request.sources.iter().filter(|s| s.active).count(),
        request.seed.as_deref().is_some_and(|s| !s.is_empty())
    );
    let search = state.planner.search_config();
    match tokio::task::spawn_blocking(move || run_select(request, rules, search)).await {
        Ok(response) => {
            info!(
                "Search result: feasible = {}, {} issues, {:?}",
                response.feasible,
                response.issues.len(),
                response.diagnostics.termination
            );
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            error!("Search task failed: {}", err);
            worker_error(err.to_string())
        }
    }
}

/// Handler for POST /select_stream (SSE).
///
/// Streams search events as Server-Sent Events. Closing the connection
/// cancels the search.
#[utoipa::path(
    post,
    path = "/select_stream",
    request_body = SelectRequest,
    responses(
        (
            status = 200,
            description = "Streams search events in real-time",
            content_type = "text/event-stream",
            body = String
        ),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "planning"
)]
async fn handle_select_stream(
    State(state): State<ApiState>,
    payload: Result<Json<SelectRequest>, JsonRejection>,
) -> Response {
    let rules = state.planner.layout_rules();
    let request = match unwrap_payload(payload).and_then(|request| {
        request
            .into_validated(&rules)
            .map_err(validation_error)
    }) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let (tx, rx) = mpsc::channel::<String>(32);
    let search = state.planner.search_config();

    tokio::task::spawn_blocking(move || {
        let cancel = CancelFlag::new();
        let mut rng = SeededRandom::for_request(request.seed.as_deref(), request.generation);
        let input = SearchInput {
            sources: &request.sources,
            candidates: request.candidates.points(),
            seed: request.seed.as_deref(),
            generation: request.generation,
        };
        select_points_with(&input, &rules, &search, &mut rng, &cancel, |event| {
            if cancel.is_cancelled() {
                return;
            }
            match serde_json::to_string(event) {
                Ok(json) => {
                    if tx.blocking_send(json).is_err() {
                        warn!("Stream closed by client, cancelling search");
                        cancel.cancel();
                    }
                }
                Err(err) => warn!("Could not serialize search event: {}", err),
            }
        });
    });

    let stream = ReceiverStream::new(rx)
        .map(|msg| Ok::<_, std::convert::Infallible>(Event::default().data(msg)));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(10))
                .text("keep-alive"),
        )
        .into_response()
}

/// Handler for POST /scene/generate.
///
/// Returns the next scene snapshot with freshly generated measurement points.
#[utoipa::path(
    post,
    path = "/scene/generate",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Next scene snapshot", body = Generation),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid scene", body = ErrorResponse),
        (status = INTERNAL_SERVER_ERROR, description = "Search task failed", body = ErrorResponse)
    ),
    tag = "planning"
)]
async fn handle_generate(
    State(state): State<ApiState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let request = match unwrap_payload(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let rules = state.planner.layout_rules();
    let search = state.planner.search_config();
    let result = tokio::task::spawn_blocking(move || {
        if request.another {
            request.scene.generate_another(&rules, &search)
        } else {
            request.scene.generate(&rules, &search)
        }
    })
    .await;

    match result {
        Ok(Ok(generation)) => {
            info!(
                "Scene generated: {:?}, generation counter {}",
                generation.status, generation.scene.generation
            );
            (StatusCode::OK, Json(generation)).into_response()
        }
        Ok(Err(err)) => validation_error(err),
        Err(err) => {
            error!("Scene generation failed: {}", err);
            worker_error(err.to_string())
        }
    }
}

async fn serve_openapi_json(State(_state): State<ApiState>) -> impl IntoResponse {
    Json(openapi_doc())
}

async fn serve_openapi_ui(State(_state): State<ApiState>) -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}
