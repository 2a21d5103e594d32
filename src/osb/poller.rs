use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::model::{now, Operation, OperationType};
use crate::osb::driver::{broker_error, call_broker, BrokerTarget, DriverContext};
use crate::osb::types::{LastOperationRequest, LastOperationState};
use crate::osb::OsbError;

const NO_DESCRIPTION: &str = "no description provided by broker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded,
    /// The broker no longer knows the resource; only reported for delete operations
    Gone,
    /// Polling stopped because the request was cancelled. The operation stays resumable.
    Canceled,
}

pub struct PollRequest<'a> {
    pub target: &'a BrokerTarget,
    pub instance_id: &'a str,
    pub binding_id: Option<&'a str>,
    /// Schedule a compensating delete when the broker reports failure
    pub orphan_mitigation: bool,
}

/// Polls the broker's last operation endpoint until the operation reaches a terminal state.
///
/// Runs inline on the caller's task. The operation is stored whenever its polling state
/// changes; failures leave `reschedule` cleared so a retry sends the request again.
pub async fn poll_operation(
    driver: &DriverContext,
    ctx: &RequestContext,
    operation: &mut Operation,
    request: PollRequest<'_>,
) -> Result<PollOutcome, ApiError> {
    let target = request.target;
    let last_operation = LastOperationRequest {
        instance_id: request.instance_id.to_string(),
        binding_id: request.binding_id.map(str::to_string),
        service_id: target.offering.catalog_id.clone(),
        plan_id: target.plan.catalog_id.clone(),
        operation_key: operation.external_id.clone(),
    };
    let max_duration = driver.settings.max_polling_for(&target.plan);
    let interval = driver.settings.polling_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::debug!(
        "[{}] Polling {} operation {} of {} at broker {}",
        ctx.correlation_id,
        operation.op_type,
        operation.id,
        operation.resource_id,
        target.broker.name
    );

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Ok(cancelled(ctx, operation)),
            _ = ticker.tick() => {}
        }

        if let Some(max) = max_duration {
            let elapsed = (now() - operation.created_at).to_std().unwrap_or_default();
            if elapsed > max {
                let description = format!(
                    "operation {} exceeded the maximum polling duration of {}s",
                    operation.id,
                    max.as_secs()
                );
                return fail(driver, operation, request.orphan_mitigation, description).await;
            }
        }

        let response = if last_operation.binding_id.is_some() {
            call_broker(ctx, target.client.poll_binding_last_operation(&last_operation)).await
        } else {
            call_broker(ctx, target.client.poll_last_operation(&last_operation)).await
        };
        if ctx.cancellation.is_cancelled() {
            return Ok(cancelled(ctx, operation));
        }

        match response {
            Ok(response) => match response.state {
                LastOperationState::InProgress => continue,
                LastOperationState::Succeeded => {
                    operation.reschedule = false;
                    driver.save_operation(operation).await?;
                    return Ok(PollOutcome::Succeeded);
                }
                LastOperationState::Failed => {
                    let description = response
                        .description
                        .unwrap_or_else(|| NO_DESCRIPTION.to_string());
                    return fail(driver, operation, request.orphan_mitigation, description).await;
                }
            },
            Err(err) if err.is_gone() && operation.op_type == OperationType::Delete => {
                operation.reschedule = false;
                driver.save_operation(operation).await?;
                return Ok(PollOutcome::Gone);
            }
            Err(OsbError::Transport { message, .. }) => {
                log::warn!(
                    "[{}] Polling broker {} failed, retrying: {}",
                    ctx.correlation_id,
                    target.broker.name,
                    message
                );
            }
            Err(err) => {
                operation.reschedule = false;
                if request.orphan_mitigation {
                    operation.deletion_scheduled = Some(now());
                }
                driver.save_operation(operation).await?;
                return Err(broker_error(&target.broker, "last operation poll", &err));
            }
        }
    }
}

fn cancelled(ctx: &RequestContext, operation: &Operation) -> PollOutcome {
    log::info!(
        "[{}] Polling of operation {} cancelled; it will be resumed later",
        ctx.correlation_id,
        operation.id
    );
    PollOutcome::Canceled
}

async fn fail(
    driver: &DriverContext,
    operation: &mut Operation,
    orphan_mitigation: bool,
    description: String,
) -> Result<PollOutcome, ApiError> {
    operation.reschedule = false;
    if orphan_mitigation {
        operation.deletion_scheduled = Some(now());
    }
    driver.save_operation(operation).await?;
    Err(ApiError::broker(description))
}
