use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Json, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::core::{
    IndexSourceError, IndexTable, Quarter, RevisionError, RevisionRequest, VariancePolicy,
    compute_revision,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliVariancePolicy {
    Strict,
    Lenient,
}

impl From<CliVariancePolicy> for VariancePolicy {
    fn from(value: CliVariancePolicy) -> Self {
        match value {
            CliVariancePolicy::Strict => VariancePolicy::Strict,
            CliVariancePolicy::Lenient => VariancePolicy::Lenient,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiVariancePolicy {
    #[serde(alias = "Strict", alias = "STRICT")]
    Strict,
    #[serde(alias = "Lenient", alias = "LENIENT", alias = "fallback")]
    Lenient,
}

impl From<ApiVariancePolicy> for VariancePolicy {
    fn from(value: ApiVariancePolicy) -> Self {
        match value {
            ApiVariancePolicy::Strict => VariancePolicy::Strict,
            ApiVariancePolicy::Lenient => VariancePolicy::Lenient,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "ilc-revision",
    about = "Commercial lease rent revision on the ILC index, with the 3.5% temporary cap"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the revised rent for one revision quarter and print it as JSON
    Compute(ComputeArgs),
    /// List the quarters available in the index source, most recent first
    Quarters(SourceArgs),
    /// Serve the revision API over HTTP
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(
        long,
        env = "ILC_INDEX_FILE",
        help = "Index source: two-column CSV (quarter;index), JSON, or an .xlsx/.ods workbook"
    )]
    indices: PathBuf,
}

#[derive(Args, Debug)]
struct ComputeArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, help = "Current annual rent")]
    rent: f64,
    #[arg(long, help = "Revision quarter, e.g. 2025-T2")]
    quarter: String,
    #[arg(
        long,
        value_enum,
        default_value_t = CliVariancePolicy::Strict,
        help = "How to treat a missing N-1/N-2 index in the cap test"
    )]
    variance_policy: CliVariancePolicy,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, env = "ILC_PORT", default_value_t = 8080)]
    port: u16,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Source(#[from] IndexSourceError),

    #[error(transparent)]
    Revision(#[from] RevisionError),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Revision(err) => err.exit_code(),
            CommandError::Source(_) | CommandError::Encode(_) | CommandError::Server(_) => 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RevisionPayload {
    #[serde(alias = "currentRent", alias = "loyer")]
    rent: Option<f64>,
    #[serde(alias = "revisionQuarter", alias = "trimestre")]
    quarter: Option<String>,
    variance_policy: Option<ApiVariancePolicy>,
}

#[derive(Debug, Serialize)]
struct IndexRow {
    quarter: Quarter,
    value: f64,
}

#[derive(Debug, Serialize)]
struct IndicesResponse {
    indices: Vec<IndexRow>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    indices: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    Revision(RevisionError),
}

impl From<RevisionError> for ApiError {
    fn from(value: RevisionError) -> Self {
        ApiError::Revision(value)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        ApiError::InvalidRequest(value.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        ApiError::InvalidRequest(value.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidRequest(msg) => {
                error_response(StatusCode::BAD_REQUEST, msg, "invalid-request")
            }
            ApiError::Revision(err) => {
                let status = match &err {
                    RevisionError::MalformedQuarter(_)
                    | RevisionError::OffsetOutOfRange { .. }
                    | RevisionError::InvalidRent(_) => StatusCode::BAD_REQUEST,
                    RevisionError::EmptyIndexSource => StatusCode::SERVICE_UNAVAILABLE,
                    RevisionError::MissingReferenceIndex { .. }
                    | RevisionError::MissingRevisionIndex { .. }
                    | RevisionError::MissingIntermediateIndex { .. } => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                };
                error_response(status, err.to_string(), err.code())
            }
        }
    }
}

/// Runs the parsed command line; the returned value is the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let outcome = match cli.command {
        Command::Compute(args) => compute_command(args),
        Command::Quarters(args) => quarters_command(args),
        Command::Serve(args) => serve_command(args).await,
    };
    match outcome {
        Ok(()) => 0,
        Err(err) => {
            error!(code = err.exit_code(), "{err}");
            err.exit_code()
        }
    }
}

fn compute_command(args: ComputeArgs) -> Result<(), CommandError> {
    let table = IndexTable::from_path(&args.source.indices)?;
    let request =
        RevisionRequest::parse(args.rent, &args.quarter, args.variance_policy.into())?;
    let result = compute_revision(&table, &request)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn quarters_command(args: SourceArgs) -> Result<(), CommandError> {
    let table = IndexTable::from_path(&args.indices)?;
    println!("{}", serde_json::to_string_pretty(&indices_response(&table))?);
    Ok(())
}

async fn serve_command(args: ServeArgs) -> Result<(), CommandError> {
    let table = IndexTable::from_path(&args.source.indices)?;
    if table.is_empty() {
        warn!("serving with an empty index table; every revision will fail");
    }
    run_http_server(Arc::new(table), args.port).await?;
    Ok(())
}

pub fn router(table: Arc<IndexTable>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/indices", get(indices_handler))
        .route(
            "/api/revision",
            get(revision_get_handler).post(revision_post_handler),
        )
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(table)
}

pub async fn run_http_server(table: Arc<IndexTable>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(table);

    let listener = TcpListener::bind(addr).await?;
    info!("ILC revision API listening on http://{addr}");
    info!("Local access: http://127.0.0.1:{port}/api/revision");

    axum::serve(listener, app).await
}

async fn health_handler(State(table): State<Arc<IndexTable>>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            indices: table.len(),
        },
    )
}

async fn indices_handler(State(table): State<Arc<IndexTable>>) -> Response {
    json_response(StatusCode::OK, indices_response(&table))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found".to_string(), "not-found")
}

// Extractor rejections are taken as values so they answer in the JSON error shape.
async fn revision_get_handler(
    State(table): State<Arc<IndexTable>>,
    payload: Result<Query<RevisionPayload>, QueryRejection>,
) -> Response {
    revision_handler_impl(&table, payload.map(|Query(p)| p).map_err(ApiError::from))
}

async fn revision_post_handler(
    State(table): State<Arc<IndexTable>>,
    payload: Result<Json<RevisionPayload>, JsonRejection>,
) -> Response {
    revision_handler_impl(&table, payload.map(|Json(p)| p).map_err(ApiError::from))
}

fn revision_handler_impl(
    table: &IndexTable,
    payload: Result<RevisionPayload, ApiError>,
) -> Response {
    let outcome = payload
        .and_then(request_from_payload)
        .and_then(|request| compute_revision(table, &request).map_err(ApiError::from));
    match outcome {
        Ok(result) => json_response(StatusCode::OK, result),
        Err(err) => err.into_response(),
    }
}

fn request_from_payload(payload: RevisionPayload) -> Result<RevisionRequest, ApiError> {
    let rent = payload
        .rent
        .ok_or_else(|| ApiError::InvalidRequest("rent is required".to_string()))?;
    let quarter = payload
        .quarter
        .ok_or_else(|| ApiError::InvalidRequest("quarter is required".to_string()))?;
    let policy = payload
        .variance_policy
        .map(VariancePolicy::from)
        .unwrap_or_default();
    Ok(RevisionRequest::parse(rent, &quarter, policy)?)
}

fn indices_response(table: &IndexTable) -> IndicesResponse {
    IndicesResponse {
        indices: table
            .iter_desc()
            .map(|(quarter, value)| IndexRow { quarter, value })
            .collect(),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, error: String, code: &'static str) -> Response {
    json_response(status, ErrorResponse { error, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_table() -> Arc<IndexTable> {
        let rows = [
            ("2022-T1", 120.0),
            ("2023-T1", 125.0),
            ("2024-T1", 128.0),
            ("2025-T1", 137.0),
        ];
        Arc::new(
            rows.iter()
                .map(|(quarter, value)| (quarter.parse::<Quarter>().expect("valid"), *value))
                .collect(),
        )
    }

    async fn send(table: Arc<IndexTable>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(table)
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        assert_eq!(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
            Some("no-store")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body is readable");
        let body = serde_json::from_slice(&bytes).expect("body is JSON");
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("valid request")
    }

    #[test]
    fn request_from_payload_parses_web_keys() {
        let payload: RevisionPayload = serde_json::from_str(
            r#"{"currentRent": 2155.28, "revisionQuarter": "2025-T2", "variancePolicy": "lenient"}"#,
        )
        .expect("json should parse");
        let request = request_from_payload(payload).expect("valid request");

        assert_approx(request.current_rent, 2155.28);
        assert_eq!(request.revision_quarter.to_string(), "2025-T2");
        assert_eq!(request.variance_policy, VariancePolicy::Lenient);
    }

    #[test]
    fn request_from_payload_defaults_to_strict_policy() {
        let payload: RevisionPayload =
            serde_json::from_str(r#"{"rent": 1000, "quarter": "2025-T1"}"#).expect("parses");
        let request = request_from_payload(payload).expect("valid request");
        assert_eq!(request.variance_policy, VariancePolicy::Strict);
    }

    #[test]
    fn request_from_payload_requires_rent_and_quarter() {
        let err = request_from_payload(RevisionPayload::default()).expect_err("rent missing");
        assert!(matches!(err, ApiError::InvalidRequest(msg) if msg.contains("rent")));

        let payload = RevisionPayload {
            rent: Some(1000.0),
            ..RevisionPayload::default()
        };
        let err = request_from_payload(payload).expect_err("quarter missing");
        assert!(matches!(err, ApiError::InvalidRequest(msg) if msg.contains("quarter")));
    }

    #[test]
    fn command_error_exit_codes_follow_revision_errors() {
        let err = CommandError::from(RevisionError::EmptyIndexSource);
        assert_eq!(err.exit_code(), 5);
        let err = CommandError::from(RevisionError::MalformedQuarter("x".to_string()));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn cli_parses_compute_arguments() {
        let cli = Cli::try_parse_from([
            "ilc-revision",
            "compute",
            "--indices",
            "indices.csv",
            "--rent",
            "2155.28",
            "--quarter",
            "2025-T2",
            "--variance-policy",
            "lenient",
        ])
        .expect("valid arguments");
        let Command::Compute(args) = cli.command else {
            panic!("expected compute command");
        };
        assert_eq!(args.source.indices, PathBuf::from("indices.csv"));
        assert_approx(args.rent, 2155.28);
        assert_eq!(args.quarter, "2025-T2");
        assert_eq!(args.variance_policy, CliVariancePolicy::Lenient);
    }

    #[tokio::test]
    async fn revision_get_returns_result() {
        let (status, body) = send(
            sample_table(),
            get("/api/revision?rent=1000&quarter=2025-T1"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["regime"], "C");
        assert_eq!(body["capApplied"], false);
        assert_eq!(body["capStatus"], "under-cap");
        assert_eq!(body["varianceBasis"], "n1-over-n2");
        assert_eq!(body["referenceQuarter"], "2022-T1");
        assert_approx(
            body["revisedRent"].as_f64().expect("number"),
            1000.0 * 1.035 * (137.0 / 125.0),
        );
        assert_eq!(body["breakdown"][0]["label"], "Loyer actuel");
        assert_eq!(body["breakdown"][0]["value"]["kind"], "amount");
        assert_eq!(body["breakdown"][2]["value"]["kind"], "ratio");
    }

    #[tokio::test]
    async fn revision_post_accepts_json_body() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/revision")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"rent": 1000, "quarter": "2025-T1"}"#))
            .expect("valid request");
        let (status, body) = send(sample_table(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revisionQuarter"], "2025-T1");
    }

    #[tokio::test]
    async fn revision_reports_missing_reference_index() {
        let (status, body) = send(
            sample_table(),
            get("/api/revision?rent=1000&quarter=2024-T1"),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "missing-reference-index");
        assert!(body["error"].as_str().expect("text").contains("2021-T1"));
    }

    #[tokio::test]
    async fn revision_rejects_malformed_quarter() {
        let (status, body) = send(
            sample_table(),
            get("/api/revision?rent=1000&quarter=2025-T7"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "malformed-quarter");
    }

    #[tokio::test]
    async fn revision_rejects_quarter_too_early_for_reference() {
        let (status, body) = send(
            sample_table(),
            get("/api/revision?rent=1000&quarter=0001-T1"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "offset-out-of-range");
    }

    #[tokio::test]
    async fn undecodable_query_values_answer_with_json_errors() {
        for uri in [
            "/api/revision?rent=abc&quarter=2025-T1",
            "/api/revision?rent=1000&quarter=2025-T1&variancePolicy=bogus",
        ] {
            let (status, body) = send(sample_table(), get(uri)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["code"], "invalid-request", "{uri}");
            assert!(body["error"].as_str().is_some_and(|msg| !msg.is_empty()));
        }
    }

    #[tokio::test]
    async fn revision_post_rejections_answer_with_json_errors() {
        let without_content_type = Request::builder()
            .method("POST")
            .uri("/api/revision")
            .body(Body::from(r#"{"rent": 1000, "quarter": "2025-T1"}"#))
            .expect("valid request");
        let (status, body) = send(sample_table(), without_content_type).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid-request");

        let malformed_json = Request::builder()
            .method("POST")
            .uri("/api/revision")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"rent": "#))
            .expect("valid request");
        let (status, body) = send(sample_table(), malformed_json).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid-request");
    }

    #[tokio::test]
    async fn revision_on_empty_table_is_unavailable() {
        let (status, body) = send(
            Arc::new(IndexTable::default()),
            get("/api/revision?rent=1000&quarter=2025-T1"),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "empty-index-source");
    }

    #[tokio::test]
    async fn indices_are_listed_most_recent_first() {
        let (status, body) = send(sample_table(), get("/api/indices")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["indices"][0]["quarter"], "2025-T1");
        assert_eq!(body["indices"][3]["quarter"], "2022-T1");
        assert_eq!(body["indices"].as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn health_reports_table_size_and_unknown_routes_are_json() {
        let (status, body) = send(sample_table(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["indices"], 4);

        let (status, body) = send(sample_table(), get("/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not-found");
    }
}
