mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{catalog, Harness};
use osb_manager::context::RequestContext;
use osb_manager::model::{ObjectType, ServiceBroker, ServiceInstance, Visibility};
use osb_manager::osb::OsbError;
use osb_manager::store::{Criterion, RepositoryExt};

fn catalog_ids<T>(items: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
    let mut ids: Vec<String> = items.iter().map(|i| id(i).to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn resync_keeps_surviving_offerings_and_replaces_the_rest() {
    let h = Harness::new(catalog(&[
        ("svc-a", &["a-small"]),
        ("svc-b", &["b-small"]),
        ("svc-c", &["c-small"]),
    ]));
    let broker = h.register_broker("b1").await.unwrap();
    let before = h.offerings().await;
    let b_before = before.iter().find(|o| o.catalog_id == "svc-b").unwrap().clone();
    let c_before = before.iter().find(|o| o.catalog_id == "svc-c").unwrap().clone();
    let b_plan_before = h.plan("b-small").await;

    h.broker.set_catalog(catalog(&[
        ("svc-b", &["b-small"]),
        ("svc-c", &["c-small"]),
        ("svc-d", &["d-small"]),
    ]));
    h.resync_broker(&broker).await.unwrap();

    let after = h.offerings().await;
    assert_eq!(
        catalog_ids(&after, |o| &o.catalog_id),
        vec!["svc-b", "svc-c", "svc-d"]
    );
    let b_after = after.iter().find(|o| o.catalog_id == "svc-b").unwrap();
    let c_after = after.iter().find(|o| o.catalog_id == "svc-c").unwrap();
    assert_eq!(b_after.id, b_before.id);
    assert_eq!(b_after.created_at, b_before.created_at);
    assert_eq!(c_after.id, c_before.id);

    let b_plan_after = h.plan("b-small").await;
    assert_eq!(b_plan_after.id, b_plan_before.id);
    assert_eq!(
        catalog_ids(&h.plans().await, |p| &p.catalog_id),
        vec!["b-small", "c-small", "d-small"]
    );
}

#[tokio::test]
async fn plans_are_matched_within_their_offering() {
    let h = Harness::new(catalog(&[("svc-a", &["small"]), ("svc-b", &["small"])]));
    let broker = h.register_broker("b1").await.unwrap();

    let offerings = h.offerings().await;
    let a = offerings.iter().find(|o| o.catalog_id == "svc-a").unwrap();
    let b = offerings.iter().find(|o| o.catalog_id == "svc-b").unwrap();
    let plans_before = h.plans().await;
    assert_eq!(plans_before.len(), 2);

    h.resync_broker(&broker).await.unwrap();

    let plans_after = h.plans().await;
    assert_eq!(plans_after.len(), 2);
    for plan in &plans_after {
        let before = plans_before.iter().find(|p| p.id == plan.id).unwrap();
        assert_eq!(plan.service_offering_id, before.service_offering_id);
    }
    assert!(plans_after.iter().any(|p| p.service_offering_id == a.id));
    assert!(plans_after.iter().any(|p| p.service_offering_id == b.id));
}

#[tokio::test]
async fn removing_a_plan_in_use_is_rejected_and_rolled_back() {
    let h = Harness::new(catalog(&[("svc-a", &["small", "large"])]));
    let broker = h.register_broker("b1").await.unwrap();
    let large = h.plan("large").await;
    h.repository
        .create_typed(ServiceInstance::new("db".to_string(), large.id.clone()))
        .await
        .unwrap();

    h.broker.set_catalog(catalog(&[("svc-a", &["small"])]));
    let err = h.resync_broker(&broker).await.unwrap_err();
    assert_eq!(err.status(), StatusCode::CONFLICT);

    // Nothing of the attempted resync was kept
    assert_eq!(
        catalog_ids(&h.plans().await, |p| &p.catalog_id),
        vec!["large", "small"]
    );
}

#[tokio::test]
async fn malformed_catalog_fails_registration() {
    let h = Harness::new(json!({"services": "not a list"}));
    let err = h.register_broker("b1").await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

    let brokers: Vec<ServiceBroker> = h.repository.list_typed(&[]).await.unwrap();
    assert!(brokers.is_empty());
    assert!(h.offerings().await.is_empty());
}

#[tokio::test]
async fn unreachable_broker_fails_registration() {
    let h = Harness::new(catalog(&[("svc-a", &["small"])]));
    *h.broker.catalog_error.lock() = Some(OsbError::http(500, "catalog unavailable"));
    let err = h.register_broker("b1").await.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert!(err.to_string().contains("catalog unavailable"));
}

#[tokio::test]
async fn deleting_a_broker_removes_its_catalog() {
    let h = Harness::new(catalog(&[("svc-a", &["small"]), ("svc-b", &["large"])]));
    let broker = h.register_broker("b1").await.unwrap();
    let visibilities: Vec<Visibility> = h.repository.list_typed(&[]).await.unwrap();
    assert_eq!(visibilities.len(), 2);

    h.interceptable
        .delete(
            &RequestContext::new(),
            ObjectType::ServiceBroker,
            &[Criterion::equals("id", &broker.id)],
        )
        .await
        .unwrap();

    assert!(h.offerings().await.is_empty());
    assert!(h.plans().await.is_empty());
    let visibilities: Vec<Visibility> = h.repository.list_typed(&[]).await.unwrap();
    assert!(visibilities.is_empty());
}

#[tokio::test]
async fn broker_with_instances_cannot_be_deleted() {
    let h = Harness::new(catalog(&[("svc-a", &["small"])]));
    let broker = h.register_broker("b1").await.unwrap();
    let small = h.plan("small").await;
    h.repository
        .create_typed(ServiceInstance::new("db".to_string(), small.id))
        .await
        .unwrap();

    let err = h
        .interceptable
        .delete(
            &RequestContext::new(),
            ObjectType::ServiceBroker,
            &[Criterion::equals("id", &broker.id)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::CONFLICT);
    assert!(h.repository.get_by_id::<ServiceBroker>(&broker.id).await.is_ok());
}

#[tokio::test]
async fn visibilities_follow_plan_pricing() {
    let h = Harness::new(catalog(&[("svc-a", &["small"])]));
    let broker = h.register_broker("b1").await.unwrap();
    let small = h.plan("small").await;

    let visibilities: Vec<Visibility> = h
        .repository
        .list_typed(&[Criterion::equals("service_plan_id", &small.id)])
        .await
        .unwrap();
    assert_eq!(visibilities.len(), 1);
    assert!(visibilities[0].is_public());

    h.broker.set_catalog(json!({
        "services": [{
            "id": "svc-a",
            "name": "svc-a-name",
            "bindable": true,
            "plans": [{"id": "small", "name": "small-name", "free": false}]
        }]
    }));
    h.resync_broker(&broker).await.unwrap();

    let visibilities: Vec<Visibility> = h
        .repository
        .list_typed(&[Criterion::equals("service_plan_id", &small.id)])
        .await
        .unwrap();
    assert!(visibilities.is_empty());
}
