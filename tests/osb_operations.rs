mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{accepted, catalog, failed, in_progress, succeeded, Harness};
use osb_manager::context::RequestContext;
use osb_manager::error::{DELETION_IN_PROGRESS, SERVICE_INSTANCE_NOT_READY};
use osb_manager::model::{
    ObjectType, Operation, OperationState, OperationType, Resource, ServiceBinding,
    ServiceInstance,
};
use osb_manager::operations::{start_operation, Job, JobAction};
use osb_manager::osb::types::{
    BindResponse, BindingDetails, DeleteResponse, UpdateInstanceResponse,
};
use osb_manager::osb::OsbError;
use osb_manager::store::RepositoryExt;

async fn harness_with_broker() -> Harness {
    let h = Harness::new(catalog(&[("postgres", &["small", "large"])]));
    h.register_broker("b1").await.unwrap();
    h
}

async fn ready_instance(h: &Harness) -> ServiceInstance {
    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let (operation, result) = h.create(instance.clone()).await;
    result.unwrap();
    assert_eq!(operation.state, OperationState::Succeeded);
    h.repository.get_by_id(&instance.id).await.unwrap()
}

#[tokio::test]
async fn async_provision_polls_until_succeeded() {
    let h = harness_with_broker().await;
    h.broker.provision.lock().push_back(Ok(accepted("prov-1")));
    h.broker.last_operation.lock().extend([Ok(in_progress()), Ok(succeeded())]);

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let (operation, result) = h.create(instance.clone()).await;
    result.unwrap();

    assert_eq!(operation.state, OperationState::Succeeded);
    assert_eq!(operation.external_id.as_deref(), Some("prov-1"));
    assert!(!operation.reschedule);
    assert_eq!(h.broker.calls_to("provision"), 1);
    assert_eq!(h.broker.calls_to("last_operation"), 2);
    assert!(h
        .broker
        .polled_keys
        .lock()
        .iter()
        .all(|key| key.as_deref() == Some("prov-1")));

    let stored: ServiceInstance = h.repository.get_by_id(&instance.id).await.unwrap();
    assert!(stored.ready);
    assert!(stored.usable);
}

#[tokio::test]
async fn failed_async_provision_schedules_orphan_mitigation() {
    let h = harness_with_broker().await;
    h.broker.provision.lock().push_back(Ok(accepted("prov-1")));
    h.broker
        .last_operation
        .lock()
        .push_back(Ok(failed("out of capacity")));

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let (operation, result) = h.create(instance.clone()).await;

    let err = result.unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(operation.state, OperationState::Failed);
    assert!(operation.deletion_scheduled.is_some());
    assert_eq!(operation.errors[0].error_type, "BrokerError");
    assert!(operation.errors[0].description.contains("out of capacity"));

    let stored: ServiceInstance = h.repository.get_by_id(&instance.id).await.unwrap();
    assert!(!stored.ready);
}

#[tokio::test]
async fn ambiguous_provision_failure_keeps_the_instance() {
    let h = harness_with_broker().await;
    h.broker.provision.lock().push_back(Err(OsbError::Transport {
        message: "connection reset".to_string(),
        timeout: false,
    }));

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let (operation, result) = h.create(instance.clone()).await;

    assert_eq!(result.unwrap_err().status(), StatusCode::BAD_GATEWAY);
    assert_eq!(operation.state, OperationState::Failed);
    assert!(operation.deletion_scheduled.is_some());

    let stored: ServiceInstance = h.repository.get_by_id(&instance.id).await.unwrap();
    assert!(!stored.ready);
    assert!(!stored.usable);
}

#[tokio::test]
async fn rejected_provision_stores_nothing() {
    let h = harness_with_broker().await;
    h.broker
        .provision
        .lock()
        .push_back(Err(OsbError::http(400, "bad parameters")));

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let (operation, result) = h.create(instance.clone()).await;

    assert!(result.unwrap_err().to_string().contains("bad parameters"));
    assert_eq!(operation.state, OperationState::Failed);
    assert!(operation.deletion_scheduled.is_none());
    assert!(h
        .repository
        .get_by_id::<ServiceInstance>(&instance.id)
        .await
        .is_err());
}

#[tokio::test]
async fn rescheduled_operation_resumes_polling_without_resending() {
    let h = harness_with_broker().await;
    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let ctx = RequestContext::new();

    let mut operation = start_operation(
        h.raw(),
        &ctx,
        Operation::new(
            OperationType::Create,
            ObjectType::ServiceInstance,
            instance.id.clone(),
        ),
    )
    .await
    .unwrap();
    operation.reschedule = true;
    operation.external_id = Some("prov-7".to_string());
    let operation = h.repository.update_typed(operation).await.unwrap();

    h.scheduler
        .execute(Job::new(
            &ctx,
            operation.id.clone(),
            JobAction::Create(instance.clone().into_object()),
        ))
        .await
        .unwrap();

    assert_eq!(h.broker.calls_to("provision"), 0);
    assert_eq!(*h.broker.polled_keys.lock(), vec![Some("prov-7".to_string())]);
    let operation: Operation = h.repository.get_by_id(&operation.id).await.unwrap();
    assert_eq!(operation.state, OperationState::Succeeded);
    let stored: ServiceInstance = h.repository.get_by_id(&instance.id).await.unwrap();
    assert!(stored.ready);
}

#[tokio::test]
async fn cancelled_polling_leaves_the_operation_resumable() {
    let h = harness_with_broker().await;
    h.broker.provision.lock().push_back(Ok(accepted("prov-1")));
    h.broker
        .last_operation
        .lock()
        .extend((0..10_000).map(|_| Ok(in_progress())));

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let ctx = RequestContext::new();
    let cancel = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let (operation, result) = h
        .run_with_context(
            &ctx,
            OperationType::Create,
            ObjectType::ServiceInstance,
            &instance.id,
            JobAction::Create(instance.clone().into_object()),
        )
        .await;

    result.unwrap();
    assert_eq!(operation.state, OperationState::InProgress);
    assert!(operation.reschedule);
    assert_eq!(operation.external_id.as_deref(), Some("prov-1"));
}

#[tokio::test]
async fn cancellation_interrupts_a_hanging_poll() {
    let h = harness_with_broker().await;
    h.broker.provision.lock().push_back(Ok(accepted("prov-1")));
    *h.broker.poll_delay.lock() = Some(Duration::from_secs(3600));

    let plan = h.plan("small").await;
    let instance = ServiceInstance::new("db".to_string(), plan.id);
    let ctx = RequestContext::new();
    let cancel = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let (operation, result) = tokio::time::timeout(
        Duration::from_secs(5),
        h.run_with_context(
            &ctx,
            OperationType::Create,
            ObjectType::ServiceInstance,
            &instance.id,
            JobAction::Create(instance.clone().into_object()),
        ),
    )
    .await
    .expect("cancellation should stop the poll");

    result.unwrap();
    assert_eq!(h.broker.calls_to("last_operation"), 1);
    assert_eq!(operation.state, OperationState::InProgress);
    assert!(operation.reschedule);
    assert!(operation.deletion_scheduled.is_none());
}

#[tokio::test]
async fn plan_polling_bound_fails_the_operation() {
    let h = Harness::new(json!({
        "services": [{
            "id": "postgres",
            "name": "postgres",
            "bindable": true,
            "plans": [{"id": "small", "name": "small", "maximum_polling_duration": 1}]
        }]
    }));
    h.register_broker("b1").await.unwrap();
    h.broker.provision.lock().push_back(Ok(accepted("prov-1")));
    h.broker
        .last_operation
        .lock()
        .extend((0..10_000).map(|_| Ok(in_progress())));

    let plan = h.plan("small").await;
    let (operation, result) = h
        .create(ServiceInstance::new("db".to_string(), plan.id))
        .await;

    assert!(result
        .unwrap_err()
        .to_string()
        .contains("maximum polling duration"));
    assert_eq!(operation.state, OperationState::Failed);
    assert!(operation.deletion_scheduled.is_some());
}

#[tokio::test]
async fn gone_on_deprovision_counts_as_success() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    h.broker
        .deprovision
        .lock()
        .push_back(Err(OsbError::http(410, "gone")));

    let (operation, result) = h.delete(ObjectType::ServiceInstance, &instance.id).await;
    result.unwrap();

    assert_eq!(operation.state, OperationState::Succeeded);
    assert!(h
        .repository
        .get_by_id::<ServiceInstance>(&instance.id)
        .await
        .is_err());
}

#[tokio::test]
async fn gone_while_polling_deprovision_counts_as_success() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    h.broker.deprovision.lock().push_back(Ok(DeleteResponse {
        is_async: true,
        operation_key: Some("deprov-1".to_string()),
    }));
    h.broker
        .last_operation
        .lock()
        .extend([Ok(in_progress()), Err(OsbError::http(410, "gone"))]);

    let (operation, result) = h.delete(ObjectType::ServiceInstance, &instance.id).await;
    result.unwrap();

    assert_eq!(operation.state, OperationState::Succeeded);
    assert!(!operation.reschedule);
    assert_eq!(h.broker.calls_to("last_operation"), 2);
    assert!(h
        .repository
        .get_by_id::<ServiceInstance>(&instance.id)
        .await
        .is_err());
}

#[tokio::test]
async fn gone_on_unbind_counts_as_success() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    let binding = ServiceBinding::new("app".to_string(), instance.id.clone());
    let (_, result) = h.create(binding.clone()).await;
    result.unwrap();
    h.broker
        .unbind
        .lock()
        .push_back(Err(OsbError::http(410, "gone")));

    let (operation, result) = h.delete(ObjectType::ServiceBinding, &binding.id).await;
    result.unwrap();

    assert_eq!(operation.state, OperationState::Succeeded);
    assert_eq!(h.broker.calls_to("unbind"), 1);
    assert!(h
        .repository
        .get_by_id::<ServiceBinding>(&binding.id)
        .await
        .is_err());
}

#[tokio::test]
async fn instance_with_bindings_cannot_be_deprovisioned() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    let (_, result) = h
        .create(ServiceBinding::new("app".to_string(), instance.id.clone()))
        .await;
    result.unwrap();

    let (operation, result) = h.delete(ObjectType::ServiceInstance, &instance.id).await;
    assert_eq!(result.unwrap_err().status(), StatusCode::BAD_REQUEST);
    assert_eq!(operation.state, OperationState::Failed);
    assert_eq!(h.broker.calls_to("deprovision"), 0);
}

#[tokio::test]
async fn failed_update_restores_the_previous_plan() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    let small_id = instance.service_plan_id.clone();
    let large = h.plan("large").await;

    h.broker.update.lock().push_back(Ok(UpdateInstanceResponse {
        is_async: true,
        dashboard_url: None,
        operation_key: Some("upd-1".to_string()),
    }));
    h.broker
        .last_operation
        .lock()
        .push_back(Ok(failed("plan change refused")));

    let mut updated = instance.clone();
    updated.service_plan_id = large.id.clone();
    let (operation, result) = h
        .run(
            OperationType::Update,
            ObjectType::ServiceInstance,
            &instance.id,
            JobAction::Update(updated.into_object()),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(operation.state, OperationState::Failed);
    let stored: ServiceInstance = h.repository.get_by_id(&instance.id).await.unwrap();
    assert_eq!(stored.service_plan_id, small_id);
    assert!(stored.previous_values.is_none());
    assert!(!stored.usable);
}

#[tokio::test]
async fn async_bind_fetches_credentials() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    h.broker.bind.lock().push_back(Ok(BindResponse {
        is_async: true,
        operation_key: Some("bind-1".to_string()),
        details: BindingDetails::default(),
    }));
    h.broker.binding.lock().push_back(Ok(BindingDetails {
        credentials: Some(json!({"user": "app", "password": "secret"})),
        ..BindingDetails::default()
    }));

    let binding = ServiceBinding::new("app".to_string(), instance.id.clone());
    let (operation, result) = h.create(binding.clone()).await;
    result.unwrap();

    assert_eq!(operation.state, OperationState::Succeeded);
    assert_eq!(h.broker.calls_to("binding_last_operation"), 1);
    let stored: ServiceBinding = h.repository.get_by_id(&binding.id).await.unwrap();
    assert!(stored.ready);
    assert_eq!(stored.credentials, Some(json!({"user": "app", "password": "secret"})));
}

#[tokio::test]
async fn binding_to_unbindable_plan_is_rejected() {
    let h = Harness::new(json!({
        "services": [{
            "id": "queue",
            "name": "queue",
            "bindable": false,
            "plans": [{"id": "small", "name": "small"}]
        }]
    }));
    h.register_broker("b1").await.unwrap();
    let instance = ready_instance(&h).await;

    let (operation, result) = h
        .create(ServiceBinding::new("app".to_string(), instance.id))
        .await;
    assert_eq!(result.unwrap_err().status(), StatusCode::BAD_GATEWAY);
    assert_eq!(operation.state, OperationState::Failed);
    assert_eq!(h.broker.calls_to("bind"), 0);
}

#[tokio::test]
async fn binding_to_unready_instance_is_rejected() {
    let h = harness_with_broker().await;
    let plan = h.plan("small").await;
    let instance = h
        .repository
        .create_typed(ServiceInstance::new("db".to_string(), plan.id))
        .await
        .unwrap();

    let (_, result) = h
        .create(ServiceBinding::new("app".to_string(), instance.id))
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err.error_type(), SERVICE_INSTANCE_NOT_READY);
}

#[tokio::test]
async fn binding_during_instance_deletion_is_rejected() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    let mut deletion = Operation::new(
        OperationType::Delete,
        ObjectType::ServiceInstance,
        instance.id.clone(),
    );
    deletion.state = OperationState::InProgress;
    h.repository.create_typed(deletion).await.unwrap();

    let (_, result) = h
        .create(ServiceBinding::new("app".to_string(), instance.id))
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err.error_type(), DELETION_IN_PROGRESS);
}

#[tokio::test]
async fn concurrent_delete_is_rejected_by_the_guard() {
    let h = harness_with_broker().await;
    let instance = ready_instance(&h).await;
    let mut running = Operation::new(
        OperationType::Update,
        ObjectType::ServiceInstance,
        instance.id.clone(),
    );
    running.state = OperationState::InProgress;
    h.repository.create_typed(running).await.unwrap();

    let ctx = RequestContext::new();
    let err = start_operation(
        h.raw(),
        &ctx,
        Operation::new(
            OperationType::Delete,
            ObjectType::ServiceInstance,
            instance.id.clone(),
        ),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(h.broker.calls_to("deprovision"), 0);
}
