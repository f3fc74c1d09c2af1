mod common;

use axum::http::{Method, StatusCode};
use common::{body_json, create_and_start, file_backed_app, send_empty_request, send_json_request};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn full_campaign_flow_over_http() {
    let tmp = TempDir::new().unwrap();
    let app = file_backed_app(&tmp);
    let id = create_and_start(&app, 2, 1000).await;

    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}")).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["allocation"]["buckets"], json!([500, 500]));

    let resp = send_json_request(
        &app,
        Method::POST,
        &format!("/ab-tests/{id}/events"),
        json!({"events": [
            {"variantIndex": 0, "kind": "sent", "count": 500},
            {"variantIndex": 0, "kind": "delivered", "count": 490},
            {"variantIndex": 0, "kind": "opened", "count": 200},
            {"variantIndex": 1, "kind": "sent", "count": 500},
            {"variantIndex": 1, "kind": "delivered", "count": 480},
            {"variantIndex": 1, "kind": "opened", "count": 150}
        ]}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}/results")).await;
    let results = body_json(resp).await;
    let comparison = &results["data"]["comparisons"][0];
    assert!((comparison["chiSquare"].as_f64().unwrap() - 9.21).abs() < 0.01);
    assert!((comparison["pValue"].as_f64().unwrap() - 0.0024).abs() < 0.0001);
    assert_eq!(comparison["significant"], true);
    assert_eq!(results["data"]["suggestion"]["variantIndex"], 0);
    assert_eq!(results["data"]["suggestion"]["thresholdMet"], true);

    let resp = send_json_request(
        &app,
        Method::POST,
        &format!("/ab-tests/{id}/winner"),
        json!({"variantIndex": 0, "metric": "openRate"}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let winner = body_json(resp).await;
    let improvement = winner["data"]["improvementPercent"].as_f64().unwrap();
    let expected = (200.0 / 490.0 - 150.0 / 480.0) / (150.0 / 480.0) * 100.0;
    assert!((improvement - expected).abs() < 1e-9);
    assert!(winner["data"]["confidence"].as_f64().unwrap() > 99.0);

    let resp =
        send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/winner/apply")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["data"]["variantName"], "Variant A");

    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}")).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["status"], "completed");
    assert_eq!(json["data"]["winner"]["variantIndex"], 0);
    assert_eq!(json["data"]["winnerApplied"], true);
}

#[tokio::test]
async fn pause_drops_events_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let app = file_backed_app(&tmp);
    let id = create_and_start(&app, 2, 1000).await;
    let events_uri = format!("/ab-tests/{id}/events");

    let resp = send_json_request(
        &app,
        Method::POST,
        &events_uri,
        json!({"variantIndex": 0, "kind": "opened", "count": 100}),
    )
    .await;
    assert_eq!(body_json(resp).await["data"]["accepted"], true);

    send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/pause")).await;

    let resp = send_json_request(
        &app,
        Method::POST,
        &events_uri,
        json!({"variantIndex": 0, "kind": "opened", "count": 50}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(resp).await["data"]["accepted"], false);

    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}/results")).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["variants"][0]["opened"], 100);
    assert_eq!(json["data"]["status"], "paused");

    let resp = send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/resume")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    // nothing recorded while paused shows up after resuming
    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}/results")).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["status"], "running");
    assert_eq!(json["data"]["variants"][0]["opened"], 100);
}

#[tokio::test]
async fn completed_experiment_rejects_every_transition() {
    let tmp = TempDir::new().unwrap();
    let app = file_backed_app(&tmp);
    let id = create_and_start(&app, 3, 999).await;

    let resp = send_json_request(
        &app,
        Method::POST,
        &format!("/ab-tests/{id}/winner"),
        json!({"variantIndex": 2}),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    for action in ["start", "pause", "resume"] {
        let resp =
            send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/{action}")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT, "{action}");
        assert_eq!(body_json(resp).await["error"]["code"], "invalid_transition");
    }

    let resp = send_json_request(
        &app,
        Method::POST,
        &format!("/ab-tests/{id}/events"),
        json!({"variantIndex": 1, "kind": "clicked"}),
    )
    .await;
    assert_eq!(body_json(resp).await["data"]["accepted"], false);

    let resp = send_empty_request(&app, Method::DELETE, &format!("/ab-tests/{id}")).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn experiments_survive_restart() {
    let tmp = TempDir::new().unwrap();
    let id = {
        let app = file_backed_app(&tmp);
        let id = create_and_start(&app, 2, 10).await;
        send_json_request(
            &app,
            Method::POST,
            &format!("/ab-tests/{id}/events"),
            json!({"variantIndex": 1, "kind": "sent", "count": 5}),
        )
        .await;
        id
    };

    let app = file_backed_app(&tmp);
    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    assert_eq!(json["data"]["status"], "running");
    assert_eq!(json["data"]["variants"][1]["sent"], 5);
    assert_eq!(json["data"]["revision"], 2);
}

#[tokio::test]
async fn allocation_remainder_goes_to_lowest_indices() {
    let tmp = TempDir::new().unwrap();
    let app = file_backed_app(&tmp);
    let resp = send_json_request(
        &app,
        Method::POST,
        "/ab-tests",
        json!({
            "campaignId": "c",
            "name": "tiny",
            "testType": "comprehensive",
            "variants": [{"name": "A"}, {"name": "B"}, {"name": "C"}],
            "totalAudience": 10
        }),
    )
    .await;
    let id = body_json(resp).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let resp = send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/start")).await;
    let json = body_json(resp).await;
    assert_eq!(json["data"]["allocation"]["buckets"], json!([4, 3, 3]));
}

#[tokio::test]
async fn audience_smaller_than_variant_count_cannot_start() {
    let tmp = TempDir::new().unwrap();
    let app = file_backed_app(&tmp);
    let resp = send_json_request(
        &app,
        Method::POST,
        "/ab-tests",
        common::subject_test_body(4, 3),
    )
    .await;
    let id = body_json(resp).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let resp = send_empty_request(&app, Method::POST, &format!("/ab-tests/{id}/start")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"]["code"], "audience_too_small");

    let resp = send_empty_request(&app, Method::GET, &format!("/ab-tests/{id}")).await;
    assert_eq!(body_json(resp).await["data"]["status"], "draft");
}
