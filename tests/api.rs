//! Control-plane endpoint tests: status codes, error shapes, admin gating.
//! Exercised through the axum router with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use common::{Harness, plan_json, plan_with_models};
use ranklab::evaluator::scripted::ScriptedEvaluator;
use ranklab::server;
use ranklab::task::TaskStatus;

fn test_router(h: &Harness) -> Router {
    server::router(h.app_state(Arc::new(ScriptedEvaluator::new(vec![1.0]))))
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn admin_json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-admin", "1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// POST /evaluate
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_accepts_valid_plan_with_202() {
    let h = Harness::new();
    let router = test_router(&h);

    let plan = plan_json(&["m1"], 10);
    let response = router
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["cached"], false);
    assert!(body["task_id"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_rejects_unknown_enum_with_400() {
    let h = Harness::new();
    let router = test_router(&h);

    let mut plan = plan_json(&["m1"], 10);
    plan["profile"]["problem_type"] = serde_json::json!("essay");
    let response = router
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_rejects_empty_subjects_with_400() {
    let h = Harness::new();
    let router = test_router(&h);

    let mut plan = plan_json(&["m1"], 10);
    plan["profile"]["subject_types"] = serde_json::json!([]);
    let response = router
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_serves_cache_hit_with_200() {
    let h = Harness::new();
    let plan = plan_with_models(&["m1"], 10);
    h.seed_success(&plan, &[1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0])
        .await;
    let router = test_router(&h);

    let response = router
        .oneshot(json_request(
            "POST",
            "/evaluate",
            serde_json::to_value(&plan).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["cached"], true);
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(body["result"]["rows"][0]["model_name"], "m1");
}

#[tokio::test(flavor = "multi_thread")]
async fn evaluate_response_never_echoes_credentials() {
    let h = Harness::new();
    let router = test_router(&h);

    let plan = plan_json(&["m1"], 10);
    let response = router
        .clone()
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    let submit_body = body_json(response).await;
    let task_id = submit_body["task_id"].as_str().unwrap();

    let response = router
        .oneshot(get_request(&format!("/tasks/{task_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body_json(response).await.to_string();
    assert!(!bytes.contains("sk-m1"), "credential leaked: {bytes}");
}

// ---------------------------------------------------------------------------
// GET / PATCH /tasks/{id}
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn unknown_task_is_404() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router
        .oneshot(get_request("/tasks/no-such-task"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_pending_task_then_conflict_on_repeat() {
    let h = Harness::new();
    let router = test_router(&h);

    let plan = plan_json(&["m1"], 10);
    let response = router
        .clone()
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    let task_id = body_json(response).await["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = router
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/tasks/{task_id}"),
            serde_json::json!({"action": "cancel"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "CANCELLED");

    // Terminal now: a second cancel is a 409.
    let response = router
        .oneshot(json_request(
            "PATCH",
            &format!("/tasks/{task_id}"),
            serde_json::json!({"action": "cancel"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "conflict");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_patch_action_is_400() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router
        .oneshot(json_request(
            "PATCH",
            "/tasks/whatever",
            serde_json::json!({"action": "pause"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Leaderboard reads and admin mutations
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn leaderboard_filters_and_hides_quarantined_from_non_admin() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let worker = h.spawn_worker(
        Arc::new(ScriptedEvaluator::new(vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0])),
        &shutdown,
    );
    let router = test_router(&h);

    let plan = plan_json(&["alpha", "beta"], 10);
    let response = router
        .clone()
        .oneshot(json_request("POST", "/evaluate", plan))
        .await
        .unwrap();
    let task_id = body_json(response).await["task_id"]
        .as_str()
        .unwrap()
        .to_string();
    h.wait_terminal(&task_id, Duration::from_secs(10)).await;
    shutdown.cancel();
    let _ = worker.await;

    // Substring filter.
    let response = router
        .clone()
        .oneshot(get_request("/leaderboard?model_name=alph"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let rows = body["rows"].as_array().unwrap();
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r["model_name"] == "alpha"));

    // Quarantine one alpha row via the admin endpoint.
    let row_id = rows[0]["row_id"].as_str().unwrap().to_string();
    let response = router
        .clone()
        .oneshot(admin_json_request(
            "POST",
            "/leaderboard/quarantine",
            serde_json::json!({"row_ids": [row_id], "reason": "moderation"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = body_json(response).await;
    assert_eq!(outcome["affected"], 1);

    // Hidden from default reads, even when the caller asks for it without
    // the admin header.
    let response = router
        .clone()
        .oneshot(get_request("/leaderboard?include_quarantined=true"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(
        body["rows"]
            .as_array()
            .unwrap()
            .iter()
            .all(|r| r["row_id"] != row_id.as_str()),
        "non-admin must never see quarantined rows"
    );

    // Restore brings it back.
    let response = router
        .clone()
        .oneshot(admin_json_request(
            "POST",
            "/leaderboard/restore",
            serde_json::json!({"row_ids": [row_id]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(get_request("/leaderboard"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(
        body["rows"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["row_id"] == row_id.as_str())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_mutations_require_admin_header() {
    let h = Harness::new();
    let router = test_router(&h);

    for (method, uri, body) in [
        ("POST", "/leaderboard/quarantine", serde_json::json!({"row_ids": ["x"]})),
        ("POST", "/leaderboard/restore", serde_json::json!({"row_ids": ["x"]})),
        (
            "POST",
            "/maintenance/cleanup",
            serde_json::json!({"resources": ["tasks"], "days_old": 30}),
        ),
    ] {
        let response = router
            .clone()
            .oneshot(json_request(method, uri, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
    }

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/leaderboard/feedface")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_delete_unknown_row_is_404() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/leaderboard/feedface")
                .header("x-admin", "1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Health, stats, maintenance
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_component_status() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cache"], "ok");
    assert_eq!(body["queue"], "ok");
    assert_eq!(body["evaluator"], "available");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_degrades_without_item_bank() {
    let h = Harness::new();
    // The reference HTTP evaluator with no items is unavailable.
    let state = h.app_state(Arc::new(ranklab::evaluator::http::HttpEvaluator::new(
        ranklab::evaluator::http::ItemBank::default(),
    )));
    let router = server::router(state);

    let response = router.oneshot(get_request("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["evaluator"], "unavailable");
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_counts_tasks_and_queue() {
    let h = Harness::new();
    let router = test_router(&h);

    for _ in 0..2 {
        // Distinct plans: different sample sizes land in different buckets.
        let _ = h.dispatcher.submit(plan_with_models(&["m1"], 10)).await;
        let _ = h.dispatcher.submit(plan_with_models(&["m1"], 100)).await;
    }

    let response = router.oneshot(get_request("/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tasks"]["PENDING"], 2, "coalescing dedups resubmits");
    assert_eq!(body["in_flight"], 2);
    assert_eq!(body["queue_depth"], 2);
    assert_eq!(body["workers"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_endpoint_returns_tracking_task() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router
        .clone()
        .oneshot(admin_json_request(
            "POST",
            "/maintenance/cleanup",
            serde_json::json!({
                "dry_run": true,
                "resources": ["tasks", "cache"],
                "days_old": 30,
                "limit": 1000,
                "hard_delete": false
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    let task_id = body["task_id"].as_str().unwrap();

    // The same task mechanism tracks it.
    let response = router
        .oneshot(get_request(&format!("/tasks/{task_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let task = body_json(response).await;
    assert_eq!(task["job"], "cleanup");
    assert_eq!(task["status"], TaskStatus::Pending.as_str());
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_rejects_empty_resources() {
    let h = Harness::new();
    let router = test_router(&h);

    let response = router
        .oneshot(admin_json_request(
            "POST",
            "/maintenance/cleanup",
            serde_json::json!({"resources": [], "days_old": 30}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
