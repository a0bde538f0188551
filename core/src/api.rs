//! Transport-agnostic HTTP handlers.
//!
//! The binary adapts `tiny_http` requests into `ApiRequest` and writes the
//! returned `ApiResponse` back; tests call `Api::handle` directly.

use crate::{
    artifact::ArtifactKind,
    clock::Clock,
    config::PaginationConfig,
    error::{LineageError, LineageResult},
    orchestrator::{self, CreateSandboxExecution, CreateScenario, CreateSuiteExecution},
    runs::{self, CreateGameOutcomeRun, CreateMarketShareRun, CreateStrategyGenerationRun},
    store::{LineageStore, Page},
    suite::{EvaluationFilter, NewSuite},
    types::{canonical_id, Created, RunKind},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: String,
    pub request_id: String,
}

impl ApiRequest {
    /// Build from a raw request target such as `/suite-executions?limit=5`.
    pub fn new(method: &str, target: &str, body: impl Into<String>, request_id: impl Into<String>) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query,
            body: body.into(),
            request_id: request_id.into(),
        }
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Split `a=1&b=x%20y` into decoded pairs.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let hex = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `(status, code)` for an error, plus its `field` when it has one.
fn classify(e: &LineageError) -> (u16, &'static str, Option<String>) {
    match e {
        LineageError::InvalidInput { field, .. } => (400, "invalid_argument", Some(field.clone())),
        LineageError::NotFound { .. } => (404, "not_found", None),
        LineageError::MissingRun { .. } => (409, "missing_run", None),
        LineageError::Conflict(_)
        | LineageError::IllegalTransition { .. }
        | LineageError::LostClaim { .. } => (409, "conflict", None),
        LineageError::Database(_)
        | LineageError::Serialization(_)
        | LineageError::Io(_)
        | LineageError::UnsupportedSchema { .. }
        | LineageError::Other(_) => (500, "internal", None),
    }
}

pub fn error_response(e: &LineageError, request_id: &str) -> ApiResponse {
    let (status, code, field) = classify(e);
    let message = if status == 500 {
        log::error!("api: request {request_id} failed: {e}");
        "internal error".to_string()
    } else {
        e.to_string()
    };
    ApiResponse {
        status,
        body: json!({
            "error": {
                "code": code,
                "message": message,
                "field": field,
                "requestId": request_id,
            }
        }),
    }
}

fn respond<T: Serialize>(status: u16, value: &T) -> LineageResult<ApiResponse> {
    Ok(ApiResponse { status, body: serde_json::to_value(value)? })
}

fn respond_created<T: Serialize>(created: &Created<T>) -> LineageResult<ApiResponse> {
    respond(if created.created { 201 } else { 200 }, &created.value)
}

fn parse_body<T: DeserializeOwned>(body: &str) -> LineageResult<T> {
    serde_json::from_str(body).map_err(|e| LineageError::invalid("body", e.to_string()))
}

fn page_response<T: Serialize>(items: &[T], page: Page) -> LineageResult<ApiResponse> {
    respond(
        200,
        &json!({
            "items": serde_json::to_value(items)?,
            "limit": page.limit,
            "offset": page.offset,
        }),
    )
}

pub struct Api {
    store: LineageStore,
    clock: Arc<dyn Clock>,
    pagination: PaginationConfig,
}

impl Api {
    pub fn new(store: LineageStore, clock: Arc<dyn Clock>, pagination: PaginationConfig) -> Self {
        Self { store, clock, pagination }
    }

    pub fn store(&self) -> &LineageStore {
        &self.store
    }

    pub fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let response = self
            .route(request)
            .unwrap_or_else(|e| error_response(&e, &request.request_id));
        log::debug!(
            "api: {} {} -> {} ({})",
            request.method,
            request.path,
            response.status,
            request.request_id
        );
        response
    }

    fn page(&self, request: &ApiRequest) -> LineageResult<Page> {
        let limit = match request.param("limit") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| LineageError::invalid("limit", format!("'{raw}' is not a non-negative integer")))?,
            None => self.pagination.default_limit,
        };
        if limit == 0 || limit > self.pagination.max_limit {
            return Err(LineageError::invalid(
                "limit",
                format!("must be within [1, {}]", self.pagination.max_limit),
            ));
        }
        let offset = match request.param("offset") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| LineageError::invalid("offset", format!("'{raw}' is not a non-negative integer")))?,
            None => 0,
        };
        Ok(Page::new(limit, offset))
    }

    fn route(&self, request: &ApiRequest) -> LineageResult<ApiResponse> {
        let segments: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();
        let now = self.clock.now();
        let store = &self.store;
        match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["runs", kind]) => self.create_run(kind.parse()?, &request.body),
            ("GET", ["runs", kind, id]) => {
                let kind: RunKind = kind.parse()?;
                respond(200, &store.get_run(kind, &canonical_id(id, "runId")?)?)
            }
            ("GET", ["runs", kind, id, "artifacts"]) => {
                let kind: RunKind = kind.parse()?;
                respond(200, &runs::run_artifacts(store, kind, &canonical_id(id, "runId")?)?)
            }
            ("GET", ["runs", kind, id, "artifacts", artifact_kind]) => {
                let kind: RunKind = kind.parse()?;
                let artifact_kind: ArtifactKind = artifact_kind.parse()?;
                respond(200, &runs::run_artifact(store, kind, &canonical_id(id, "runId")?, artifact_kind)?)
            }
            ("GET", ["runs", kind, id, "progress"]) => {
                let kind: RunKind = kind.parse()?;
                respond(200, &runs::run_progress(store, kind, &canonical_id(id, "runId")?)?)
            }
            ("GET", ["artifacts", id]) => respond(200, &store.get_artifact(&canonical_id(id, "artifactId")?)?),

            ("POST", ["suites"]) => {
                let suite: NewSuite = parse_body(&request.body)?;
                respond(201, &orchestrator::create_suite(store, &suite, now)?)
            }
            ("GET", ["suites", id]) => respond(200, &store.get_suite(&canonical_id(id, "suiteId")?)?),

            ("POST", ["suite-scenarios"]) => {
                let scenario: CreateScenario = parse_body(&request.body)?;
                respond(201, &orchestrator::create_scenario(store, &scenario, now)?)
            }
            ("POST", ["suite-scenarios", id, "sandbox-executions"]) => {
                let body: CreateSandboxExecution = if request.body.trim().is_empty() {
                    CreateSandboxExecution::default()
                } else {
                    parse_body(&request.body)?
                };
                respond_created(&orchestrator::create_sandbox_execution(store, id, &body, now)?)
            }

            ("POST", ["suite-executions"]) => {
                let body: CreateSuiteExecution = parse_body(&request.body)?;
                respond_created(&orchestrator::create_suite_execution(store, &body, now)?)
            }
            ("GET", ["suite-executions"]) => {
                let page = self.page(request)?;
                let suite_id = request
                    .param("suite_id")
                    .map(|id| canonical_id(id, "suite_id"))
                    .transpose()?;
                page_response(&store.list_executions(suite_id.as_deref(), page)?, page)
            }
            ("GET", ["suite-executions", id]) => respond(
                200,
                &orchestrator::execution_detail(store, &canonical_id(id, "executionId")?)?,
            ),

            ("GET", ["suite-calcutta-evaluations"]) => {
                let page = self.page(request)?;
                let filter = EvaluationFilter {
                    suite_execution_id: request
                        .param("suite_execution_id")
                        .map(|id| canonical_id(id, "suite_execution_id"))
                        .transpose()?,
                    calcutta_id: request
                        .param("calcutta_id")
                        .map(|id| canonical_id(id, "calcutta_id"))
                        .transpose()?,
                };
                page_response(&store.list_evaluations(&filter, page)?, page)
            }
            ("GET", ["suite-calcutta-evaluations", id]) => respond(
                200,
                &store.get_evaluation(&canonical_id(id, "evaluationId")?)?,
            ),

            _ => Err(LineageError::not_found(
                "route",
                format!("{} {}", request.method, request.path),
            )),
        }
    }

    fn create_run(&self, kind: RunKind, body: &str) -> LineageResult<ApiResponse> {
        let now = self.clock.now();
        let created = match kind {
            RunKind::GameOutcome => {
                let request: CreateGameOutcomeRun = parse_body(body)?;
                runs::create_game_outcome_run(&self.store, &request, now)?
            }
            RunKind::MarketShare => {
                let request: CreateMarketShareRun = parse_body(body)?;
                runs::create_market_share_run(&self.store, &request, now)?
            }
            RunKind::StrategyGeneration => {
                let request: CreateStrategyGenerationRun = parse_body(body)?;
                runs::create_strategy_generation_run(&self.store, &request, now)?
            }
            RunKind::SuiteEvaluation => {
                return Err(LineageError::invalid(
                    "runKind",
                    "suite_evaluation runs are created by suite executions",
                ))
            }
        };
        respond_created(&created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_are_percent_decoded() {
        let pairs = parse_query("suite_id=abc&name=Big%20Dance+Pool&empty=&flag");
        assert_eq!(
            pairs,
            vec![
                ("suite_id".to_string(), "abc".to_string()),
                ("name".to_string(), "Big Dance Pool".to_string()),
                ("empty".to_string(), String::new()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn truncated_escape_is_kept_literally() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn errors_map_to_envelope_codes() {
        let e = LineageError::invalid("limit", "too big");
        let r = error_response(&e, "req-1");
        assert_eq!(r.status, 400);
        assert_eq!(r.body["error"]["code"], "invalid_argument");
        assert_eq!(r.body["error"]["field"], "limit");
        assert_eq!(r.body["error"]["requestId"], "req-1");

        let e = LineageError::MissingRun { kind: RunKind::MarketShare, scope: "x".into() };
        assert_eq!(error_response(&e, "r").body["error"]["code"], "missing_run");
        assert_eq!(error_response(&e, "r").status, 409);
    }

    #[test]
    fn request_target_splits_path_and_query() {
        let r = ApiRequest::new("get", "/suite-executions?limit=5", "", "id");
        assert_eq!(r.method, "GET");
        assert_eq!(r.path, "/suite-executions");
        assert_eq!(r.param("limit"), Some("5"));
    }
}
