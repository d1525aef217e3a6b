mod common;

use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

use common::{
    admin, bearer, eventstream_payload, get_request, json_body, json_request, setup_app,
    FlakySink, StaticSource,
};
use kobo_relay::config::Config;

#[tokio::test]
async fn dashboard_routes_require_a_bearer_token() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    for uri in ["/api/configuration", "/api/stats", "/api/recent-logs", "/api/kobo/status"] {
        let resp = app.clone().oneshot(get_request(uri, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", uri);
    }

    let resp = app
        .oneshot(get_request("/api/configuration", Some("Bearer not-a-jwt")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["error"], "auth_error");
}

#[tokio::test]
async fn health_is_public_and_healthy_on_a_fresh_instance() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app.oneshot(get_request("/health", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["storage"]["backend"], "memory");
    assert_eq!(json["eventstream"]["configured"], false);
    assert_eq!(json["streaming"]["state"], "idle");
}

#[tokio::test]
async fn configuration_is_redacted_unless_an_admin_unmasks_it() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;
    let operator = bearer(None);

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/eventstream",
            Some(&operator),
            eventstream_payload(3),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let saved = json_body(resp).await;
    assert_eq!(saved["version"], 1);
    assert_eq!(saved["eventstream"]["namespace"], "relay-test.servicebus.windows.net");
    assert_eq!(saved["eventstream"]["entity_path"], "kobo-submissions");

    let resp = app
        .clone()
        .oneshot(get_request("/api/configuration", Some(&operator)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let redacted = json_body(resp).await;
    assert_eq!(redacted["eventstream"]["key_value_configured"], true);
    assert!(!redacted.to_string().contains("c2VjcmV0"));
    assert!(redacted["webhook_url"]
        .as_str()
        .unwrap()
        .ends_with("/kobo-webhook"));

    let resp = app
        .clone()
        .oneshot(get_request("/api/configuration?unmask=true", Some(&operator)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .oneshot(get_request("/api/configuration?unmask=true", Some(&admin())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let unmasked = json_body(resp).await;
    assert_eq!(unmasked["outbound"]["endpoint"]["key_value"], "c2VjcmV0");
    assert_eq!(unmasked["version"], 1);
}

#[tokio::test]
async fn partial_eventstream_config_lists_every_missing_field() {
    let (app, state) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/configuration/eventstream",
            Some(&admin()),
            json!({ "namespace": "relay-test.servicebus.windows.net" }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let json = json_body(resp).await;
    assert_eq!(json["error"], "validation_error");
    let message = json["message"].as_str().unwrap();
    for field in ["entity_path", "key_name", "key_value"] {
        assert!(message.contains(field), "{} missing from {}", field, message);
    }
    assert!(state.settings.outbound().await.is_none());
    assert_eq!(state.settings.get().await.version, 0);
}

#[tokio::test]
async fn config_updates_without_every_setting_are_rejected() {
    let (app, state) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/eventstream",
            Some(&admin()),
            json!({
                "namespace": "relay-test.servicebus.windows.net",
                "entity_path": "kobo-submissions",
                "key_name": "send",
                "key_value": "c2VjcmV0"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let message = json_body(resp).await["message"].as_str().unwrap().to_string();
    assert!(message.contains("max_retries, retry_delay, timeout"), "{}", message);
    assert!(state.settings.outbound().await.is_none());

    let limit_before = state.settings.webhook().await.max_payload_size;
    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/configuration/webhook",
            Some(&admin()),
            json!({ "verify_signature": false }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let message = json_body(resp).await["message"].as_str().unwrap().to_string();
    assert!(message.contains("max_payload_size"), "{}", message);
    assert_eq!(state.settings.webhook().await.max_payload_size, limit_before);
    assert_eq!(state.settings.get().await.version, 0);
}

#[tokio::test]
async fn webhook_settings_keep_the_secret_until_cleared() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(0), StaticSource::new(vec![])).await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/webhook",
            Some(&admin()),
            json!({ "verify_signature": true, "kobo_secret": "s3cret", "max_payload_size": 2048 }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["webhook"]["kobo_secret_configured"], true);
    assert_eq!(json["webhook"]["max_payload_size"], 2048);

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/webhook",
            Some(&admin()),
            json!({ "verify_signature": true, "max_payload_size": 4096 }),
        ))
        .await
        .unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["webhook"]["kobo_secret_configured"], true);

    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/configuration/webhook",
            Some(&admin()),
            json!({ "verify_signature": true, "kobo_secret": "", "max_payload_size": 4096 }),
        ))
        .await
        .unwrap();
    let json = json_body(resp).await;
    assert_eq!(json["webhook"]["kobo_secret_configured"], false);
    assert_eq!(json["version"], 3);
}

#[tokio::test]
async fn test_eventstream_reports_failure_without_erroring() {
    let (app, _) = setup_app(Config::for_tests(), FlakySink::new(10), StaticSource::new(vec![])).await;

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/test-eventstream", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "config_missing");

    app.clone()
        .oneshot(json_request(
            "POST",
            "/api/configuration/eventstream",
            Some(&admin()),
            eventstream_payload(0),
        ))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/test-eventstream", Some(&admin()), json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = json_body(resp).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["outcome"]["status"], "failed");

    let logs = app
        .oneshot(get_request("/api/recent-logs?limit=5", Some(&admin())))
        .await
        .unwrap();
    let logs = json_body(logs).await;
    assert_eq!(logs["logs"].as_array().unwrap().len(), 1);
    assert!(logs["next_before"].is_null());
}
