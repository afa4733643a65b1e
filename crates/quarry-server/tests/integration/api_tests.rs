use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use tower::ServiceExt;

use quarry_core::models::JobSource;
use quarry_core::rate_limit::{ProviderLimits, RateLimitConfig, WindowLimit, WindowLimits};
use quarry_core::testutil::{MockAdapter, sample_job};
use quarry_core::{AppError, NewService, ServiceStatus};

use crate::common::{
    Options, TEST_ADMIN_TOKEN, default_adapters, json_body, setup_test_app,
    setup_test_app_no_auth, setup_with,
};

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn admin_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Health & sources
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let response = app.router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["sources"].as_array().unwrap().len(), 2);
    assert_eq!(json["sources"][0]["circuit"], "closed");
}

#[tokio::test]
async fn sources_report_circuit_and_quota() {
    let app = setup_test_app();

    let response = app.router.oneshot(get("/v1/sources")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let sources = json["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    for source in sources {
        assert_eq!(source["configured"], true);
        assert_eq!(source["circuit"]["state"], "closed");
        assert_eq!(source["rate_limit"]["short_window"], 60);
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_merges_sources_newest_first() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/jobs/search?q=engineer"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("traceparent"));

    let json = json_body(response).await;
    assert_eq!(json["total"], 3);
    assert_eq!(json["cached"], false);
    let ids: Vec<&str> = json["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["external_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["r1", "a1", "r2"]);

    let statuses: Vec<&str> = json["sources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["ok", "ok"]);
}

#[tokio::test]
async fn search_survives_a_failing_source() {
    let mut adapters = default_adapters();
    adapters[1] = MockAdapter::new(JobSource::Adzuna)
        .failing(|| AppError::provider("adzuna", "upstream exploded", Some(500), true));
    let app = setup_with(Options {
        adapters,
        ..Options::default()
    });

    let response = app
        .router
        .oneshot(get("/v1/jobs/search?q=rust"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    let failed = json["sources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["source"] == "adzuna")
        .unwrap();
    assert_eq!(failed["status"], "failed");
    assert!(failed["error_kind"].is_string());
}

#[tokio::test]
async fn search_reports_exhausted_quota_per_source() {
    let tight = ProviderLimits::new(WindowLimits::new(
        WindowLimit::per_minute(1),
        WindowLimit::per_day(100),
    ));
    let app = setup_with(Options {
        rate_limits: RateLimitConfig::default().with_provider("remoteok", tight),
        ..Options::default()
    });

    let first = app
        .router
        .clone()
        .oneshot(get("/v1/jobs/search?q=rust"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .router
        .oneshot(get("/v1/jobs/search?q=rust"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let json = json_body(second).await;
    let remoteok = json["sources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["source"] == "remoteok")
        .unwrap();
    assert_eq!(remoteok["status"], "failed");
    assert_eq!(remoteok["error_kind"], "rate_limited");
    assert_eq!(json["total"], 1);
}

#[tokio::test]
async fn per_user_quota_follows_user_header() {
    let per_user = WindowLimits::new(WindowLimit::per_minute(1), WindowLimit::per_day(100));
    let app = setup_with(Options {
        rate_limits: RateLimitConfig::new(
            ProviderLimits::new(WindowLimits::default()).with_per_user(per_user),
        ),
        ..Options::default()
    });
    let as_user = |user: &str| {
        Request::get("/v1/jobs/search?q=rust")
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    };

    let first = app.router.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(json_body(first).await["total"], 3);

    let again = app.router.clone().oneshot(as_user("alice")).await.unwrap();
    assert_eq!(json_body(again).await["total"], 0);

    let other = app.router.oneshot(as_user("bob")).await.unwrap();
    assert_eq!(json_body(other).await["total"], 3);
}

#[tokio::test]
async fn oversized_user_header_is_rejected() {
    let app = setup_test_app();
    let user = "u".repeat(300);

    for uri in ["/v1/jobs/search?q=rust", "/v1/sources", "/v1/jobs/remoteok/r1"] {
        let request = Request::get(uri)
            .header("x-user-id", user.as_str())
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(json_body(response).await["error"], "invalid_query");
    }

    let request = Request::get("/v1/jobs/search?q=rust")
        .header("x-user-id", "u".repeat(128))
        .body(Body::empty())
        .unwrap();
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn search_rejects_unknown_filter_value() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/jobs/search?q=rust&remote_type=orbital"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = json_body(response).await;
    assert_eq!(json["error"], "invalid_query");
}

#[tokio::test]
async fn search_rejects_zero_limit() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/jobs/search?q=rust&limit=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Details
// ---------------------------------------------------------------------------

#[tokio::test]
async fn details_returns_listing() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/jobs/remoteok/r1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["external_id"], "r1");
    assert_eq!(json["source"], "remoteok");
    assert_eq!(json["title"], "Rust Engineer");
}

#[tokio::test]
async fn details_for_missing_listing_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/jobs/remoteok/does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "not_found");
}

#[tokio::test]
async fn details_for_unregistered_source_returns_404() {
    let app = setup_test_app();

    for uri in ["/v1/jobs/indeed/1", "/v1/jobs/monster/1"] {
        let response = app.router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(json_body(response).await["error"], "unknown_source");
    }
}

#[tokio::test]
async fn details_fail_fast_once_circuit_opens() {
    let app = setup_with(Options {
        adapters: vec![
            MockAdapter::new(JobSource::RemoteOk)
                .failing(|| AppError::provider("remoteok", "boom", Some(503), true)),
        ],
        ..Options::default()
    });

    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(get("/v1/jobs/remoteok/r1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/jobs/remoteok/r1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(json_body(response).await["error"], "circuit_open");

    let health = json_body(app.router.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(health["status"], "degraded");
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn incoming_traceparent_is_continued_and_queryable() {
    let app = setup_test_app();
    let trace_id = "4bf92f3577b34da6a3ce929d0e0e4736";

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/v1/jobs/search?q=rust")
                .header("traceparent", format!("00-{trace_id}-00f067aa0ba902b7-01"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let echoed = response.headers()["traceparent"].to_str().unwrap().to_string();
    assert!(echoed.starts_with(&format!("00-{trace_id}-")));

    let response = app
        .router
        .oneshot(get(&format!("/v1/traces/{trace_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let operations: Vec<&str> = json["spans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["operation"].as_str().unwrap())
        .collect();
    assert!(operations.contains(&"http.search_jobs"));
    assert!(operations.contains(&"remoteok.search"));
    assert!(operations.contains(&"adzuna.search"));
}

#[tokio::test]
async fn unknown_trace_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(get("/v1/traces/0af7651916cd43dd8448eb211c80319c"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(app.tracer.spans_for_trace("0af7651916cd43dd8448eb211c80319c").is_empty());
}

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_without_token_returns_401() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/v1/services",
            serde_json::json!({"name": "matcher", "address": "http://m", "version": "1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.registry.get_services().is_empty());
}

#[tokio::test]
async fn register_with_wrong_token_returns_401() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::post("/v1/services")
                .header("authorization", "Bearer wrong-token")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"name":"matcher","address":"http://m","version":"1"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth();

    let response = app
        .router
        .oneshot(
            Request::delete(format!("/v1/services/{}", uuid::Uuid::new_v4()))
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "forbidden");
}

#[tokio::test]
async fn service_lifecycle() {
    let app = setup_test_app();

    // Register
    let response = app
        .router
        .clone()
        .oneshot(admin_json(
            "POST",
            "/v1/services",
            serde_json::json!({
                "name": "matcher",
                "address": "http://matcher:8080",
                "version": "1.2.0",
                "capabilities": ["job-matching"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    assert_eq!(created["status"], "unknown");
    let id = created["id"].as_str().unwrap().to_string();

    // Filter by capability
    let response = app
        .router
        .clone()
        .oneshot(get("/v1/services?capability=job-matching"))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["total"], 1);

    let response = app
        .router
        .clone()
        .oneshot(get("/v1/services?capability=geocoding"))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["total"], 0);

    // Status update
    let response = app
        .router
        .clone()
        .oneshot(admin_json(
            "PUT",
            &format!("/v1/services/{id}/status"),
            serde_json::json!({"status": "healthy", "response_time_ms": 42}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = json_body(response).await;
    assert_eq!(updated["status"], "healthy");
    assert_eq!(updated["response_time_ms"], 42);

    // Metrics
    let response = app
        .router
        .clone()
        .oneshot(get("/v1/services/metrics"))
        .await
        .unwrap();
    let metrics = json_body(response).await;
    assert_eq!(metrics["total_services"], 1);
    assert_eq!(metrics["healthy_services"], 1);
    assert_eq!(metrics["services_by_capability"]["job-matching"], 1);

    // Deregister
    let response = app
        .router
        .clone()
        .oneshot(
            Request::delete(format!("/v1/services/{id}"))
                .header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .router
        .oneshot(get(&format!("/v1/services/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_update_rejects_unknown_status() {
    let app = setup_test_app();
    let service = app
        .registry
        .register_service(NewService::new("matcher", "http://m", "1"));

    let response = app
        .router
        .oneshot(admin_json(
            "PUT",
            &format!("/v1/services/{}/status", service.id),
            serde_json::json!({"status": "sleepy"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_update_for_unknown_service_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(admin_json(
            "PUT",
            &format!("/v1/services/{}/status", uuid::Uuid::new_v4()),
            serde_json::json!({"status": "healthy"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Matches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn matches_served_by_matching_service() {
    let app = setup_test_app();
    app.registry.register_service(
        NewService::new("matcher", "http://matcher:8080", "1")
            .with_capability("job-matching")
            .with_status(ServiceStatus::Healthy),
    );
    let job = sample_job(
        JobSource::Adzuna,
        "a1",
        "Senior Rust Engineer",
        "Crab Labs",
        Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap(),
    );
    app.invoker.respond(
        "matcher",
        Ok(serde_json::json!({
            "matches": [{"job": job, "score": 1.7, "matched_keywords": ["rust"]}]
        })),
    );

    let response = app
        .router
        .oneshot(post_json(
            "/v1/matches",
            serde_json::json!({"profile_keywords": ["rust"], "keywords": "engineer"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["strategy"], "primary");
    assert_eq!(json["degraded"], false);
    assert_eq!(json["matches"][0]["score"], 1.0);

    let calls = app.invoker.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].headers.contains_key("traceparent"));
}

#[tokio::test]
async fn matches_fall_back_to_aggregator_scoring() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/v1/matches",
            serde_json::json!({"profile_keywords": ["rust"], "keywords": "engineer"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["strategy"], "aggregator");
    assert_eq!(json["degraded"], true);
    let ids: Vec<&str> = json["matches"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["job"]["external_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"r1"));
    assert!(ids.contains(&"a1"));
}

#[tokio::test]
async fn matches_reject_invalid_limit() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(post_json(
            "/v1/matches",
            serde_json::json!({"keywords": "rust", "limit": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
