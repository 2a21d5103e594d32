use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::model::{now, ObjectType, Operation, OperationState, OperationType};
use crate::operations::scheduler::Scheduler;
use crate::operations::start_operation;
use crate::store::{Criterion, RepositoryExt, TransactionalRepository};

#[derive(Debug, Clone)]
pub struct MaintainerSettings {
    /// How often finished operations are reaped
    pub cleanup_interval: Duration,
    /// Age after which finished operations may be deleted
    pub lifespan: Duration,
    pub job_timeout: Duration,
    /// How often pending orphan mitigations are scheduled
    pub rescheduling_interval: Duration,
}

impl Default for MaintainerSettings {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(3600),
            lifespan: Duration::from_secs(7 * 24 * 3600),
            job_timeout: Duration::from_secs(3600),
            rescheduling_interval: Duration::from_secs(300),
        }
    }
}

fn before(age: Duration) -> String {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .to_rfc3339()
}

/// Periodic sweeps over the operation table.
pub struct Maintainer {
    scheduler: Arc<Scheduler>,
    settings: MaintainerSettings,
}

impl Maintainer {
    pub fn new(scheduler: Arc<Scheduler>, settings: MaintainerSettings) -> Self {
        Self {
            scheduler,
            settings,
        }
    }

    fn repository(&self) -> &dyn TransactionalRepository {
        self.scheduler.repository().raw().as_ref()
    }

    async fn resource_exists(&self, resource_type: ObjectType, id: &str) -> Result<bool, ApiError> {
        let count = self
            .repository()
            .count(resource_type, &[Criterion::equals("id", id)])
            .await?;
        Ok(count > 0)
    }

    /// Deletes finished operations older than the lifespan.
    ///
    /// The newest operation of each type per resource is kept while the resource exists.
    pub async fn cleanup_old_operations(&self) -> Result<usize, ApiError> {
        let expired: Vec<Operation> = self
            .repository()
            .list_typed(&[
                Criterion::in_values(
                    "state",
                    [
                        OperationState::Succeeded.as_str(),
                        OperationState::Failed.as_str(),
                    ],
                ),
                Criterion::less_than("created_at", before(self.settings.lifespan)),
            ])
            .await?;
        let expired: Vec<Operation> = expired
            .into_iter()
            .filter(|op| op.deletion_scheduled.is_none())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let resource_ids: Vec<String> = expired
            .iter()
            .map(|op| op.resource_id.clone())
            .unique()
            .collect();
        let history: Vec<Operation> = self
            .repository()
            .list_typed(&[Criterion::in_values("resource_id", resource_ids)])
            .await?;
        let newest: HashMap<(String, OperationType), String> = history
            .into_iter()
            .into_group_map_by(|op| (op.resource_id.clone(), op.op_type))
            .into_iter()
            .filter_map(|(key, ops)| {
                ops.into_iter()
                    .max_by_key(|op| op.created_at)
                    .map(|op| (key, op.id))
            })
            .collect();

        let mut doomed = Vec::new();
        for op in expired {
            let is_newest = newest
                .get(&(op.resource_id.clone(), op.op_type))
                .is_some_and(|id| *id == op.id);
            if is_newest && self.resource_exists(op.resource_type, &op.resource_id).await? {
                continue;
            }
            doomed.push(op.id);
        }
        if doomed.is_empty() {
            return Ok(0);
        }
        let deleted = self
            .repository()
            .delete_matching(ObjectType::Operation, &[Criterion::in_values("id", doomed)])
            .await?;
        log::info!("Deleted {} expired operation(s)", deleted);
        Ok(deleted)
    }

    /// Deletes operations in progress for longer than twice the job timeout. Operations
    /// waiting to resume polling are left to [`Maintainer::resume_rescheduled_operations`].
    pub async fn cleanup_stuck_operations(&self) -> Result<usize, ApiError> {
        let deleted = self
            .repository()
            .delete_matching(
                ObjectType::Operation,
                &[
                    Criterion::equals("state", OperationState::InProgress.as_str()),
                    Criterion::equals("reschedule", "false"),
                    Criterion::less_than("created_at", before(self.settings.job_timeout * 2)),
                ],
            )
            .await?;
        if deleted > 0 {
            log::warn!("Deleted {} stuck operation(s)", deleted);
        }
        Ok(deleted)
    }

    /// Schedules another run for unfinished operations that were interrupted while polling
    /// and untouched for `idle_for`. The run resumes polling with the stored operation key.
    pub async fn resume_rescheduled_operations(
        &self,
        idle_for: Duration,
    ) -> Result<usize, ApiError> {
        let interrupted: Vec<Operation> = self
            .repository()
            .list_typed(&[
                Criterion::in_values(
                    "state",
                    [
                        OperationState::Pending.as_str(),
                        OperationState::InProgress.as_str(),
                    ],
                ),
                Criterion::equals("reschedule", "true"),
                Criterion::less_than("updated_at", before(idle_for)),
            ])
            .await?;

        let mut resumed = 0;
        for mut op in interrupted {
            let ctx = RequestContext::new().with_correlation_id(op.correlation_id.clone());
            let resource = match self
                .repository()
                .get(op.resource_type, &[Criterion::equals("id", &op.resource_id)])
                .await
            {
                Ok(resource) => Some(resource),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };

            let Some(resource) = resource else {
                if op.op_type == OperationType::Delete {
                    op.state = OperationState::Succeeded;
                    op.reschedule = false;
                } else {
                    op.fail(
                        "NotFound",
                        format!("{} {} no longer exists", op.resource_type, op.resource_id),
                    );
                }
                log::warn!(
                    "[{}] Operation {} cannot resume: {} {} is gone; marked {}",
                    ctx.correlation_id,
                    op.id,
                    op.resource_type,
                    op.resource_id,
                    op.state
                );
                self.repository().update_typed(op).await?;
                continue;
            };

            // Refreshes updated_at so the next sweep leaves the queued run alone
            let op = self.repository().update_typed(op).await?;
            match op.op_type {
                OperationType::Create => {
                    self.scheduler.schedule_create(&ctx, resource, op.id.clone())
                }
                OperationType::Update => {
                    self.scheduler.schedule_update(&ctx, resource, op.id.clone())
                }
                OperationType::Delete => self.scheduler.schedule_delete(
                    &ctx,
                    op.resource_type,
                    vec![Criterion::equals("id", &op.resource_id)],
                    op.id.clone(),
                ),
            }
            log::info!(
                "[{}] Resuming {} operation {} on {} {}",
                ctx.correlation_id,
                op.op_type,
                op.id,
                op.resource_type,
                op.resource_id
            );
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Schedules a delete for every resource left behind by a failed create or delete.
    pub async fn reschedule_orphan_mitigation(&self) -> Result<usize, ApiError> {
        let failed: Vec<Operation> = self
            .repository()
            .list_typed(&[
                Criterion::equals("state", OperationState::Failed.as_str()),
                Criterion::in_values(
                    "type",
                    [
                        OperationType::Create.to_string(),
                        OperationType::Delete.to_string(),
                    ],
                ),
            ])
            .await?;

        let mut scheduled = 0;
        for mut op in failed.into_iter().filter(|op| op.deletion_scheduled.is_some()) {
            let ctx = RequestContext::new().with_correlation_id(op.correlation_id.clone());
            let exists = matches!(
                op.resource_type,
                ObjectType::ServiceInstance | ObjectType::ServiceBinding
            ) && self.resource_exists(op.resource_type, &op.resource_id).await?;

            if exists {
                let mitigation = Operation::new(
                    OperationType::Delete,
                    op.resource_type,
                    op.resource_id.clone(),
                );
                let mitigation = match start_operation(self.repository(), &ctx, mitigation).await {
                    Ok(mitigation) => mitigation,
                    Err(err) => {
                        log::warn!(
                            "[{}] Could not start orphan mitigation for {} {}: {}",
                            ctx.correlation_id,
                            op.resource_type,
                            op.resource_id,
                            err
                        );
                        continue;
                    }
                };
                self.scheduler.schedule_delete(
                    &ctx,
                    op.resource_type,
                    vec![Criterion::equals("id", &op.resource_id)],
                    mitigation.id,
                );
                scheduled += 1;
                log::info!(
                    "[{}] Scheduled orphan mitigation for {} {}",
                    ctx.correlation_id,
                    op.resource_type,
                    op.resource_id
                );
            }

            op.deletion_scheduled = None;
            self.repository().update_typed(op).await?;
        }
        Ok(scheduled)
    }

    /// Runs the sweeps on their intervals until shutdown. Sweep failures are logged and retried.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut cleanup = interval(self.settings.cleanup_interval.max(Duration::from_millis(1)));
        let mut stuck = interval(self.settings.job_timeout.max(Duration::from_millis(1)));
        let mut orphans = interval(
            self.settings
                .rescheduling_interval
                .max(Duration::from_millis(1)),
        );
        for ticker in [&mut cleanup, &mut stuck, &mut orphans] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = cleanup.tick() => {
                    if let Err(err) = self.cleanup_old_operations().await {
                        log::error!("Operation cleanup failed: {}", err);
                    }
                }
                _ = stuck.tick() => {
                    let idle_for = self.settings.job_timeout;
                    if let Err(err) = self.resume_rescheduled_operations(idle_for).await {
                        log::error!("Resuming interrupted operations failed: {}", err);
                    }
                    if let Err(err) = self.cleanup_stuck_operations().await {
                        log::error!("Stuck operation cleanup failed: {}", err);
                    }
                }
                _ = orphans.tick() => {
                    if let Err(err) = self.reschedule_orphan_mitigation().await {
                        log::error!("Orphan mitigation rescheduling failed: {}", err);
                    }
                }
            }
        }
        log::info!("Operation maintainer stopped");
    }
}
