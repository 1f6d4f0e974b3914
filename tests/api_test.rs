mod common;

use bundle_relay::providers::PaymentStatus;
use common::{spawn_app, test_config, FulfillMode, TestApp};
use reqwest::StatusCode;
use serde_json::{json, Value};

fn purchase() -> Value {
    json!({
        "productCode": "mtn-1gb",
        "targetContact": "0551234567",
        "volume": "1000",
        "amount": 5.50,
        "purchaserEmail": "a@b.com"
    })
}

async fn initiate(app: &TestApp) -> String {
    let res = app
        .client
        .post(format!("{}/api/initiate-payment", app.base_url))
        .json(&purchase())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    body["data"]["reference"].as_str().unwrap().to_string()
}

async fn verify(app: &TestApp, reference: &str) -> (StatusCode, Value) {
    let res = app
        .client
        .get(format!("{}/api/verify-payment/{}", app.base_url, reference))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn test_checkout_to_delivery_flow() {
    let app = spawn_app(test_config()).await;

    let res = app
        .client
        .post(format!("{}/api/initiate-payment", app.base_url))
        .json(&purchase())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "success");
    let reference = body["data"]["reference"].as_str().unwrap().to_string();
    assert!(reference.starts_with("MTN_DATA_"));
    assert!(body["data"]["authorizationUrl"]
        .as_str()
        .unwrap()
        .ends_with(&reference));

    let (status, body) = verify(&app, &reference).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(app.fulfillment.calls(), 0);

    app.gateway.set_status(PaymentStatus::Success);
    let (status, first) = verify(&app, &reference).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "success");
    assert_eq!(first["data"]["transaction_id"], "HUB-1");
    assert_eq!(app.fulfillment.calls(), 1);

    let (status, replay) = verify(&app, &reference).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, first);
    assert_eq!(app.fulfillment.calls(), 1);

    let res = app
        .client
        .get(format!(
            "{}/api/transaction-status/{}",
            app.base_url, reference
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["phase"], "FULFILLED");
    assert_eq!(body["data"]["paymentStatus"], "success");
    assert_eq!(body["data"]["fulfillmentStatus"], "success");
    assert_eq!(body["data"]["transactionId"], "HUB-1");
}

#[tokio::test]
async fn test_paid_but_undelivered_returns_accepted() {
    let app = spawn_app(test_config()).await;
    let reference = initiate(&app).await;

    app.gateway.set_status(PaymentStatus::Success);
    app.fulfillment.set_mode(FulfillMode::TimeOut);

    let (status, body) = verify(&app, &reference).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["paymentStatus"], "success");
    assert_eq!(body["fulfillmentStatus"], "failed");
    assert_eq!(body["data"]["code"], "OUTCOME_UNKNOWN");
}

#[tokio::test]
async fn test_invalid_purchase_is_rejected() {
    let app = spawn_app(test_config()).await;

    let mut request = purchase();
    request["targetContact"] = json!("12345");
    let res = app
        .client
        .post(format!("{}/api/initiate-payment", app.base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let mut request = purchase();
    request["amount"] = json!(1.0);
    let res = app
        .client
        .post(format!("{}/api/initiate-payment", app.base_url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .client
        .post(format!("{}/api/initiate-payment", app.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.gateway.init_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(app.store.is_empty().await);
}

#[tokio::test]
async fn test_unknown_reference_is_not_found() {
    let app = spawn_app(test_config()).await;

    let (status, body) = verify(&app, "MTN_DATA_1700000000_ffff").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let res = app
        .client
        .get(format!(
            "{}/api/transaction-status/MTN_DATA_1700000000_ffff",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_reference_is_bad_request() {
    let app = spawn_app(test_config()).await;

    let (status, _) = verify(&app, "x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.gateway.verify_calls(), 0);
}

#[tokio::test]
async fn test_retry_requires_admin_key() {
    let mut config = test_config();
    config.admin_api_key = Some("operator-secret".to_string());
    let app = spawn_app(config).await;
    let reference = initiate(&app).await;

    let url = format!("{}/api/retry-transaction/{}", app.base_url, reference);
    let res = app.client.post(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .client
        .post(&url)
        .header("Authorization", "Bearer wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.gateway.verify_calls(), 0);

    app.gateway.set_status(PaymentStatus::Success);
    let res = app
        .client
        .post(&url)
        .header("Authorization", "Bearer operator-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(app.fulfillment.calls(), 1);
}

#[tokio::test]
async fn test_retry_is_disabled_without_admin_key() {
    let app = spawn_app(test_config()).await;
    let reference = initiate(&app).await;
    app.gateway.set_status(PaymentStatus::Success);

    let url = format!("{}/api/retry-transaction/{}", app.base_url, reference);
    for auth in [None, Some("Bearer "), Some("Bearer anything")] {
        let mut request = app.client.post(&url);
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }
        let res = request.send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    assert_eq!(app.gateway.verify_calls(), 0);
    assert_eq!(app.fulfillment.calls(), 0);
}

#[tokio::test]
async fn test_payment_callback_redirects_to_result_page() {
    let app = spawn_app(test_config()).await;
    let reference = initiate(&app).await;

    let res = app
        .client
        .get(format!(
            "{}/api/payment-callback?trxref={}&reference={}",
            app.base_url, reference, reference
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        res.headers()["location"],
        format!("http://shop.test/payment-pending.html?reference={}", reference).as_str()
    );

    app.gateway.set_status(PaymentStatus::Success);
    let res = app
        .client
        .get(format!(
            "{}/api/payment-callback?reference={}",
            app.base_url, reference
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(
        res.headers()["location"],
        format!("http://shop.test/payment-success.html?reference={}", reference).as_str()
    );
    assert_eq!(app.fulfillment.calls(), 1);

    let res = app
        .client
        .get(format!("{}/api/payment-callback", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(
        res.headers()["location"],
        "http://shop.test/payment-failed.html"
    );
}

#[tokio::test]
async fn test_check_balance() {
    let app = spawn_app(test_config()).await;

    let res = app
        .client
        .get(format!("{}/api/check-balance", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["data"]["balance"], 250.0);
}

#[tokio::test]
async fn test_health_and_request_id() {
    let app = spawn_app(test_config()).await;

    let res = app
        .client
        .get(format!("{}/health", app.base_url))
        .header("x-request-id", "req-123")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "req-123");

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"]["records"], 0);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_openapi_document_lists_routes() {
    let app = spawn_app(test_config()).await;

    let res = app
        .client
        .get(format!("{}/api-docs/openapi.json", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert!(body["paths"]["/api/initiate-payment"].is_object());
    assert!(body["paths"]["/api/verify-payment/{reference}"].is_object());
}
