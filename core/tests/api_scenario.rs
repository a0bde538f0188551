//! End-to-end scenarios through `Api::handle`, without a socket.

mod common;

use common::{new_suite, seed_pool, t0, upstream_for, GO_ALG, MS_ALG};
use lineage_core::{
    api::{Api, ApiRequest, ApiResponse},
    clock::ManualClock,
    config::ServiceConfig,
    types::new_id,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn api() -> Api {
    Api::new(
        common::store(),
        Arc::new(ManualClock::new(t0())),
        ServiceConfig::default_test().pagination,
    )
}

fn call(api: &Api, method: &str, target: &str, body: Value) -> ApiResponse {
    let body = if body.is_null() { String::new() } else { body.to_string() };
    api.handle(&ApiRequest::new(method, target, body, "req-test"))
}

fn get(api: &Api, target: &str) -> ApiResponse {
    call(api, "GET", target, Value::Null)
}

fn suite_body() -> Value {
    let suite = new_suite("march");
    json!({
        "name": suite.name,
        "gameOutcomeAlgorithmId": GO_ALG,
        "marketShareAlgorithmId": MS_ALG,
        "optimizerKey": suite.defaults.optimizer_key,
        "nSims": suite.defaults.n_sims,
        "seed": suite.defaults.seed,
        "startingStateKey": suite.defaults.starting_state_key,
    })
}

#[test]
fn suite_execution_happy_path() {
    let api = api();
    let pool = seed_pool(api.store(), &new_id(), &["Alice", "Bob"]);
    let ((go_run, _), (ms_run, _)) = upstream_for(api.store(), &pool, t0());

    let suite = call(&api, "POST", "/suites", suite_body());
    assert_eq!(suite.status, 201, "{}", suite.body);
    let suite_id = suite.body["id"].as_str().unwrap().to_string();

    let key = new_id();
    let body = json!({ "suiteId": suite_id, "calcuttaIds": [pool.calcutta_id], "runKey": key });
    let created = call(&api, "POST", "/suite-executions", body.clone());
    assert_eq!(created.status, 201, "{}", created.body);
    assert_eq!(created.body["executionId"], key.as_str());
    assert_eq!(created.body["evaluationCount"], 1);

    let replay = call(&api, "POST", "/suite-executions", body);
    assert_eq!(replay.status, 200);
    assert_eq!(replay.body["executionId"], key.as_str());

    let list = get(&api, &format!("/suite-calcutta-evaluations?suite_execution_id={key}"));
    assert_eq!(list.status, 200, "{}", list.body);
    let items = list.body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "pending");
    assert_eq!(items[0]["gameOutcomeRunId"], go_run.as_str());
    assert_eq!(items[0]["marketShareRunId"], ms_run.as_str());
    assert_eq!(list.body["limit"], 50);
    assert_eq!(list.body["offset"], 0);

    let eval_id = items[0]["id"].as_str().unwrap();
    let one = get(&api, &format!("/suite-calcutta-evaluations/{eval_id}"));
    assert_eq!(one.status, 200);
    assert_eq!(one.body["calcuttaId"], pool.calcutta_id.as_str());

    let detail = get(&api, &format!("/suite-executions/{key}"));
    assert_eq!(detail.status, 200, "{}", detail.body);
    assert_eq!(detail.body["status"], "pending");
    assert_eq!(detail.body["kind"], "batch");
    assert_eq!(detail.body["counts"]["pending"], 1);

    let executions = get(&api, &format!("/suite-executions?suite_id={suite_id}&limit=10"));
    assert_eq!(executions.body["items"].as_array().unwrap().len(), 1);
}

#[test]
fn run_creation_is_idempotent_per_run_key() {
    let api = api();
    let key = new_id();
    let body = json!({
        "runKey": key,
        "tournamentId": new_id(),
        "algorithmId": GO_ALG,
        "nSims": 1000,
        "seed": 7,
        "startingStateKey": "post_first_four",
    });

    let first = call(&api, "POST", "/runs/game_outcome", body.clone());
    assert_eq!(first.status, 201, "{}", first.body);
    assert_eq!(first.body["runId"], key.as_str());
    assert_eq!(first.body["status"], "pending");
    let second = call(&api, "POST", "/runs/game_outcome", body);
    assert_eq!(second.status, 200);

    let progress = get(&api, &format!("/runs/game_outcome/{key}/progress"));
    assert_eq!(progress.status, 200, "{}", progress.body);
    assert_eq!(progress.body["events"].as_array().unwrap().len(), 1);
    assert_eq!(progress.body["events"][0]["eventKind"], "enqueued");

    let artifacts = get(&api, &format!("/runs/game_outcome/{key}/artifacts"));
    assert_eq!(artifacts.body, json!([]));
    let missing = get(&api, &format!("/runs/game_outcome/{key}/artifacts/simulated_outcomes"));
    assert_eq!(missing.status, 404);
}

#[test]
fn error_envelopes() {
    let api = api();

    let r = get(&api, "/suite-executions?limit=500");
    assert_eq!(r.status, 400);
    assert_eq!(r.body["error"]["code"], "invalid_argument");
    assert_eq!(r.body["error"]["field"], "limit");
    assert_eq!(r.body["error"]["requestId"], "req-test");

    let r = get(&api, "/suite-executions?limit=0");
    assert_eq!(r.status, 400);

    let r = get(&api, "/suite-executions/not-a-uuid");
    assert_eq!(r.status, 400);
    assert_eq!(r.body["error"]["field"], "executionId");

    let r = get(&api, &format!("/suite-executions/{}", new_id()));
    assert_eq!(r.status, 404);
    assert_eq!(r.body["error"]["code"], "not_found");

    let r = call(&api, "POST", "/runs/suite_evaluation", json!({}));
    assert_eq!(r.status, 400);
    assert_eq!(r.body["error"]["field"], "runKind");

    let r = call(&api, "POST", "/runs/game_outcome", json!({ "algorithmId": GO_ALG }));
    assert_eq!(r.status, 400);
    assert_eq!(r.body["error"]["field"], "body");

    let r = get(&api, "/no/such/route");
    assert_eq!(r.status, 404);
}

#[test]
fn missing_pool_and_missing_upstream() {
    let api = api();
    let pool = seed_pool(api.store(), &new_id(), &["Alice"]);
    let suite = call(&api, "POST", "/suites", suite_body());
    let suite_id = suite.body["id"].as_str().unwrap().to_string();

    let r = call(
        &api,
        "POST",
        "/suite-executions",
        json!({ "suiteId": suite_id, "calcuttaIds": [new_id()] }),
    );
    assert_eq!(r.status, 404, "{}", r.body);
    assert_eq!(r.body["error"]["code"], "not_found");

    let r = call(
        &api,
        "POST",
        "/suite-executions",
        json!({ "suiteId": suite_id, "calcuttaIds": [pool.calcutta_id] }),
    );
    assert_eq!(r.status, 409, "{}", r.body);
    assert_eq!(r.body["error"]["code"], "missing_run");

    let r = get(&api, "/suite-calcutta-evaluations");
    assert_eq!(r.body["items"], json!([]));
}
