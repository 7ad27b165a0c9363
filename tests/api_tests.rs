
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use marionette::api::create_router;
use marionette::scheduler::job::JobStatus;
use test_harness::TestEnv;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

fn patch_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("PATCH")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn job_payload(name: &str) -> Value {
    json!({
        "name": name,
        "applicationPath": "calc",
        "steps": [
            { "order": 0, "type": "Click", "target": "5" }
        ]
    })
}

#[tokio::test]
async fn create_job_returns_created_when_capacity_exists() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &[]).await;
    let app = create_router(env.api_state());

    let response = app
        .oneshot(post_json("/jobs", &job_payload("happy")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert!(body["jobId"].is_string());
}

#[tokio::test]
async fn create_job_returns_accepted_without_capacity() {
    let env = TestEnv::new();
    let app = create_router(env.api_state());

    let response = app
        .oneshot(post_json("/jobs", &job_payload("waiting")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    // The queued job itself comes back.
    assert_eq!(body["status"], json!("Queued"));
}

#[tokio::test]
async fn create_job_without_steps_is_rejected() {
    let env = TestEnv::new();
    let app = create_router(env.api_state());

    let payload = json!({ "name": "empty", "applicationPath": "calc", "steps": [] });
    let response = app.oneshot(post_json("/jobs", &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert!(body["errorMessage"].is_string());
    assert!(body["errors"].is_array());
}

#[tokio::test]
async fn get_job_roundtrip_and_not_found() {
    let env = TestEnv::new();
    let job_id = env.submit_simple("lookup", "calc").await;
    let app = create_router(env.api_state());

    let response = app
        .clone()
        .oneshot(get(&format!("/jobs/{job_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], json!(job_id.to_string()));
    assert_eq!(body["name"], json!("lookup"));

    let missing = app
        .oneshot(get(&format!("/jobs/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_jobs_filters_by_status_and_orders_newest_first() {
    let env = TestEnv::new();
    let first = env.submit_simple("first", "calc").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = env.submit_simple("second", "calc").await;
    env.scheduler.cancel(first).await.unwrap();
    let app = create_router(env.api_state());

    let response = app.clone().oneshot(get("/jobs")).await.unwrap();
    let body = body_json(response).await;
    let listed: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        listed,
        vec![second.to_string().as_str(), first.to_string().as_str()]
    );

    let response = app
        .clone()
        .oneshot(get("/jobs?status=cancelled"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = app.oneshot(get("/jobs?status=bogus")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_endpoint_reports_effect() {
    let env = TestEnv::new();
    let job_id = env.submit_simple("cancel me", "calc").await;
    let app = create_router(env.api_state());

    let response = app
        .clone()
        .oneshot(post_json(&format!("/jobs/{job_id}/cancel"), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], json!(true));

    // Second cancel is a no-op.
    let response = app
        .oneshot(post_json(&format!("/jobs/{job_id}/cancel"), &json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["success"], json!(false));
}

#[tokio::test]
async fn status_callback_completes_the_job() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &[]).await;
    let job_id = env.submit_simple("callback", "calc").await;
    env.scheduler.dispatch_tick().await;
    let app = create_router(env.api_state());

    let response = app
        .oneshot(patch_json(
            &format!("/jobs/{job_id}/status"),
            &json!({ "status": "Success", "result": "8" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(env.job(job_id).await.status, JobStatus::Success);
}

#[tokio::test]
async fn templates_are_listed_and_executable() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &["calc"]).await;
    let app = create_router(env.api_state());

    let response = app.clone().oneshot(get("/templates")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(get("/templates/calculator-basic"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Numeric JSON parameters coerce to their string form.
    let response = app
        .clone()
        .oneshot(post_json(
            "/templates/calculator-basic/execute",
            &json!({ "parameters": { "num1": 5, "num2": 3, "operation": "add" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(post_json(
            "/templates/calculator-basic/execute",
            &json!({ "parameters": { "num1": 5 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_template_is_not_found() {
    let env = TestEnv::new();
    let app = create_router(env.api_state());
    let response = app
        .oneshot(post_json(
            "/templates/nope/execute",
            &json!({ "parameters": {} }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_heartbeat_unregister_agent_lifecycle() {
    let env = TestEnv::new();
    let app = create_router(env.api_state());

    let response = app
        .clone()
        .oneshot(post_json(
            "/agents",
            &json!({ "name": "A1", "user": "alice", "capabilities": { "supportedApplications": ["calc"] } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let agent = body_json(response).await;
    assert_eq!(agent["status"], json!("Idle"));
    let agent_id = agent["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(&format!("/agents/{agent_id}/heartbeat"), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/agents/{agent_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(env.sessions.live_count().await, 0);

    let response = app
        .oneshot(post_json(&format!("/agents/{agent_id}/heartbeat"), &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_fails_with_503_when_provisioning_fails() {
    let env = TestEnv::new();
    env.provisioner
        .fail_provision
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let app = create_router(env.api_state());

    let response = app
        .oneshot(post_json("/agents", &json!({ "name": "A1", "user": "alice" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn health_reports_component_counts() {
    let env = TestEnv::new();
    env.register_agent("a1", "alice", &[]).await;
    env.submit_simple("queued", "calc").await;
    let app = create_router(env.api_state());

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["agents"]["total"], json!(1));
    assert_eq!(body["jobs"]["queued"], json!(1));
    assert_eq!(body["queueDepth"], json!(1));
    assert_eq!(body["activeSessions"], json!(1));
}

#[tokio::test]
async fn queue_endpoint_lists_dispatch_order() {
    let env = TestEnv::new();
    let normal = env.submit_simple("normal", "calc").await;
    let critical = env
        .submit(TestEnv::job_spec(
            "critical",
            "calc",
            marionette::scheduler::job::JobPriority::Critical,
        ))
        .await;
    let app = create_router(env.api_state());

    let response = app.oneshot(get("/queue")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["depth"], json!(2));
    assert_eq!(
        body["jobIds"],
        json!([critical.to_string(), normal.to_string()])
    );
}
