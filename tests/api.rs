mod common;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

use common::{catalog, Harness};
use osb_manager::api::routes::create_app;
use osb_manager::api::AppState;
use osb_manager::model::{ObjectType, Operation, OperationState, OperationType, ServiceInstance};
use osb_manager::store::{Criterion, RepositoryExt};

// Test client wrapper for making API calls
struct TestClient {
    client: Client,
    base_url: String,
}

impl TestClient {
    async fn start(h: &Harness) -> Self {
        let scheduler = h.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });

        let app = create_app(AppState::new(h.scheduler.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            client: Client::new(),
            base_url: format!("http://{}", address),
        }
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    async fn patch(&self, path: &str, json: Value) -> reqwest::Response {
        self.client
            .patch(format!("{}{}", self.base_url, path))
            .json(&json)
            .send()
            .await
            .unwrap()
    }

    async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    async fn wait_for_operation(&self, id: &str) -> Value {
        for _ in 0..200 {
            let operation: Value = self
                .get(&format!("/v1/operations/{}", id))
                .await
                .json()
                .await
                .unwrap();
            if operation["state"] == "succeeded" || operation["state"] == "failed" {
                return operation;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("operation {} did not finish", id);
    }
}

async fn setup() -> (Harness, TestClient) {
    let h = Harness::new(catalog(&[("postgres", &["small", "large"])]));
    let client = TestClient::start(&h).await;
    let response = client
        .post(
            "/v1/service_brokers",
            json!({
                "name": "b1",
                "broker_url": "http://broker.example",
                "credentials": {"basic": {"username": "admin", "password": "secret"}}
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    (h, client)
}

async fn plan_id(client: &TestClient, catalog_id: &str) -> String {
    let plans: Value = client
        .get(&format!("/v1/service_plans?catalog_id={}", catalog_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(plans["total"], 1);
    plans["items"][0]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_check_reports_healthy() {
    let h = Harness::new(catalog(&[]));
    let client = TestClient::start(&h).await;
    let response = client.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn registered_broker_exposes_its_catalog_but_not_its_credentials() {
    let (_h, client) = setup().await;

    let brokers: Value = client.get("/v1/service_brokers").await.json().await.unwrap();
    assert_eq!(brokers["total"], 1);
    assert!(brokers["items"][0]["credentials"]["basic"].is_null());

    let offerings: Value = client
        .get("/v1/service_offerings")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(offerings["total"], 1);
    assert_eq!(offerings["items"][0]["catalog_id"], "postgres");

    let plans: Value = client.get("/v1/service_plans").await.json().await.unwrap();
    assert_eq!(plans["total"], 2);
}

#[tokio::test]
async fn duplicate_broker_name_conflicts() {
    let (_h, client) = setup().await;
    let response = client
        .post(
            "/v1/service_brokers",
            json!({"name": "b1", "broker_url": "http://other.example"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn broker_patch_resyncs_the_catalog() {
    let (h, client) = setup().await;
    let brokers: Value = client.get("/v1/service_brokers").await.json().await.unwrap();
    let id = brokers["items"][0]["id"].as_str().unwrap().to_string();

    h.broker
        .set_catalog(catalog(&[("postgres", &["small"]), ("redis", &["cache"])]));
    let response = client
        .patch(
            &format!("/v1/service_brokers/{}", id),
            json!({"description": "primary"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let broker: Value = response.json().await.unwrap();
    assert_eq!(broker["description"], "primary");

    let offerings: Value = client
        .get("/v1/service_offerings")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(offerings["total"], 2);
}

#[tokio::test]
async fn instance_creation_is_asynchronous_by_default() {
    let (h, client) = setup().await;
    let plan = plan_id(&client, "small").await;

    let response = client
        .client
        .post(format!("{}/v1/service_instances", client.base_url))
        .header("x-correlation-id", "corr-1")
        .json(&json!({"name": "db", "service_plan_id": plan}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let operation: Value = response.json().await.unwrap();
    assert_eq!(operation["type"], "create");
    assert_eq!(operation["correlation_id"], "corr-1");

    let operation = client
        .wait_for_operation(operation["id"].as_str().unwrap())
        .await;
    assert_eq!(operation["state"], "succeeded");

    let instance: Value = client
        .get(&format!(
            "/v1/service_instances/{}",
            operation["resource_id"].as_str().unwrap()
        ))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(instance["ready"], true);
    assert_eq!(h.broker.calls_to("provision"), 1);
}

#[tokio::test]
async fn synchronous_requests_return_the_result() {
    let (_h, client) = setup().await;
    let plan = plan_id(&client, "small").await;

    let response = client
        .post(
            "/v1/service_instances?async=false",
            json!({"name": "db", "service_plan_id": plan}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let instance: Value = response.json().await.unwrap();
    assert_eq!(instance["ready"], true);
    let id = instance["id"].as_str().unwrap().to_string();

    let response = client
        .delete(&format!("/v1/service_instances/{}?async=false", id))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = client.get(&format!("/v1/service_instances/{}", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_resources_return_an_error_body() {
    let (_h, client) = setup().await;
    let response = client.get("/v1/service_instances/missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "NotFound");
    assert!(body["description"].as_str().unwrap().contains("missing"));

    let response = client
        .post(
            "/v1/service_instances",
            json!({"name": "db", "service_plan_id": "no-such-plan"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mutation_during_running_operation_is_unprocessable() {
    let (h, client) = setup().await;
    let plan = plan_id(&client, "small").await;
    let instance: Value = client
        .post(
            "/v1/service_instances?async=false",
            json!({"name": "db", "service_plan_id": plan}),
        )
        .await
        .json()
        .await
        .unwrap();
    let id = instance["id"].as_str().unwrap().to_string();

    let mut running = Operation::new(
        OperationType::Update,
        ObjectType::ServiceInstance,
        id.clone(),
    );
    running.state = OperationState::InProgress;
    h.repository.create_typed(running).await.unwrap();

    let response = client.delete(&format!("/v1/service_instances/{}", id)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "ConcurrentOperationInProgress");
}

#[tokio::test]
async fn instance_patch_cannot_set_managed_fields() {
    let (h, client) = setup().await;
    let plan = plan_id(&client, "small").await;
    let mut instance = ServiceInstance::new("db".to_string(), plan);
    instance.ready = false;
    let instance = h.repository.create_typed(instance).await.unwrap();

    for patch in [json!({"ready": true}), json!({"platform_id": "cf-eu"})] {
        let response = client
            .patch(&format!("/v1/service_instances/{}", instance.id), patch)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "BadRequest");
    }

    let operations: Vec<Operation> = h
        .repository
        .list_typed(&[Criterion::equals("resource_id", &instance.id)])
        .await
        .unwrap();
    assert!(operations.is_empty());
    let stored: Value = client
        .get(&format!("/v1/service_instances/{}", instance.id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(stored["ready"], false);
    assert_eq!(stored["platform_id"], "service-manager");
}
