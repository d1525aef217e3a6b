mod common;

use std::time::Duration;

use axum::{http::StatusCode, Router};
use serde_json::json;
use tower::ServiceExt;

use common::{
    admin, eventstream_payload, get_request, json_body, json_request, setup_app, submission,
    FlakySink, StaticSource,
};
use kobo_relay::{
    config::Config,
    models::streaming_session::{SessionState, SessionStatus, StopOutcome},
    AppState,
};

async fn configure(app: &Router) {
    let resp = tokio_test::assert_ok!(
        app.clone()
            .oneshot(json_request(
                "POST",
                "/api/configuration/eventstream",
                Some(&admin()),
                eventstream_payload(0),
            ))
            .await
    );
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/kobo",
            Some(&admin()),
            json!({ "server_url": "https://kf.kobotoolbox.org/", "api_token": "tok-123" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["kobo"]["server_url"], "https://kf.kobotoolbox.org");
    assert_eq!(json["kobo"]["api_token_configured"], true);
}

async fn wait_until<F>(state: &AppState, done: F) -> SessionStatus
where
    F: Fn(&SessionStatus) -> bool,
{
    for _ in 0..300 {
        let status = state.streaming.status().await;
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("streaming session never reached the expected state");
}

#[tokio::test]
async fn start_forward_stop_and_resume_from_checkpoint() {
    let source = StaticSource::new(vec![submission(1), submission(2), submission(3)]);
    let sink = FlakySink::new(0);
    let (app, state) = setup_app(Config::for_tests(), sink.clone(), source).await;
    configure(&app).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/start",
            Some(&admin()),
            json!({ "project_id": "aBcDeF123" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["state"], "active");
    assert_eq!(json["project_id"], "aBcDeF123");

    let again = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/start",
            Some(&admin()),
            json!({ "project_id": "aBcDeF123" }),
        ))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(again).await["error"], "session_active");

    let status = wait_until(&state, |s| s.forwarded == 3).await;
    assert_eq!(status.checkpoint.unwrap().last_submission_id, 3);
    assert_eq!(sink.calls(), 3);

    let resp = app
        .clone()
        .oneshot(get_request("/api/kobo/status", Some(&admin())))
        .await
        .unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["state"], "active");
    assert_eq!(json["forwarded"], 3);

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/kobo/stop", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["result"]["outcome"], "stopped");
    assert_eq!(json["result"]["forwarded"], 3);
    assert_eq!(state.streaming.status().await.state, SessionState::Idle);

    // A new session resumes after the persisted checkpoint.
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/start",
            Some(&admin()),
            json!({ "project_id": "aBcDeF123" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["checkpoint"]["last_submission_id"], 3);
    let status = wait_until(&state, |s| s.last_poll_at.is_some()).await;
    assert_eq!(status.forwarded, 0);

    let stopped = state.streaming.stop().await;
    assert!(matches!(
        stopped,
        StopOutcome::Stopped { forwarded: 0, .. }
    ));
    assert_eq!(sink.calls(), 3);
}

#[tokio::test]
async fn stop_without_session_returns_a_warning() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app
        .oneshot(json_request("POST", "/api/kobo/stop", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["result"]["outcome"], "not_active");
    assert_eq!(json["message"], "Streaming is not active");
}

#[tokio::test]
async fn streaming_aliases_reach_the_same_session() {
    let sink = FlakySink::new(0);
    let (app, state) = setup_app(
        Config::for_tests(),
        sink.clone(),
        StaticSource::new(vec![submission(1)]),
    )
    .await;
    configure(&app).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/start",
            Some(&admin()),
            json!({ "project_id": "aBcDeF123" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    wait_until(&state, |s| s.forwarded == 1).await;

    let resp = app
        .clone()
        .oneshot(get_request("/api/streaming/status", Some(&admin())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["state"], "active");
    assert_eq!(json["project_id"], "aBcDeF123");

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/streaming/stop", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["result"]["outcome"], "stopped");
    assert_eq!(state.streaming.status().await.state, SessionState::Idle);

    let resp = app
        .oneshot(get_request("/api/streaming/status", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn start_requires_project_and_credentials() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/kobo/start", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let message = json_body(resp).await["message"].as_str().unwrap().to_string();
    for field in ["project_id", "server_url", "api_token"] {
        assert!(message.contains(field), "{} missing from {}", field, message);
    }

    let resp = app
        .oneshot(get_request("/api/kobo/projects", Some(&admin())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "config_missing");
}

#[tokio::test]
async fn kobo_connection_test_and_project_listing() {
    let source = StaticSource::new(vec![submission(1)]);
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), source).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/test-connection",
            Some(&admin()),
            json!({ "server_url": "https://kf.kobotoolbox.org", "api_token": "bad-token" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["success"], false);
    assert!(json["message"].as_str().unwrap().contains("401"));

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/kobo/test-connection",
            Some(&admin()),
            json!({ "server_url": "https://kf.kobotoolbox.org" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    configure(&app).await;

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/kobo/test-connection", Some(&admin()), json!({})))
        .await
        .unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["project_count"], 1);

    let resp = app
        .oneshot(get_request("/api/kobo/projects", Some(&admin())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let projects = json_body(resp).await;
    assert_eq!(projects[0]["uid"], "aBcDeF123");
    assert_eq!(projects[0]["submission_count"], 1);
}
