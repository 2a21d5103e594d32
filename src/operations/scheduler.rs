use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::InterceptableRepository;
use crate::model::{Id, Object, ObjectType, Operation, OperationState};
use crate::store::{Criterion, RepositoryExt};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pool_size: usize,
    pub queue_size: usize,
    pub job_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            pool_size: 20,
            queue_size: 1000,
            job_timeout: Duration::from_secs(3600),
        }
    }
}

/// The mutation a job performs.
#[derive(Debug, Clone)]
pub enum JobAction {
    Create(Object),
    Update(Object),
    Delete {
        object_type: ObjectType,
        criteria: Vec<Criterion>,
    },
}

/// One scheduled mutation together with the operation tracking it.
#[derive(Debug, Clone)]
pub struct Job {
    pub operation_id: Id,
    pub context: RequestContext,
    pub action: JobAction,
}

impl Job {
    pub fn new(ctx: &RequestContext, operation_id: Id, action: JobAction) -> Self {
        Self {
            context: ctx.clone().with_operation(operation_id.clone()),
            operation_id,
            action,
        }
    }

    /// Runs the action and records the outcome on the operation.
    ///
    /// The action runs with a child context that is cancelled when `timeout` elapses. An
    /// operation whose `reschedule` flag is still set afterwards stays IN_PROGRESS.
    pub async fn execute(
        self,
        repository: &InterceptableRepository,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        let raw = repository.raw();
        let mut operation: Operation = raw.get_by_id(&self.operation_id).await?;
        operation.state = OperationState::InProgress;
        raw.update_typed(operation).await?;

        let ctx = self.context.child();
        let result = {
            let action = run_action(repository, &ctx, self.action);
            tokio::pin!(action);
            tokio::select! {
                result = &mut action => result,
                _ = tokio::time::sleep(timeout) => {
                    log::warn!(
                        "[{}] Operation {} exceeded the job timeout of {}s, cancelling",
                        ctx.correlation_id,
                        self.operation_id,
                        timeout.as_secs()
                    );
                    ctx.cancellation.cancel();
                    action.await
                }
            }
        };

        let mut operation: Operation = raw.get_by_id(&self.operation_id).await?;
        match &result {
            Ok(()) if operation.reschedule => {
                log::info!(
                    "[{}] Operation {} left in progress; polling resumes on the next run",
                    ctx.correlation_id,
                    operation.id
                );
                return Ok(());
            }
            Ok(()) => operation.state = OperationState::Succeeded,
            Err(err) => operation.fail(err.error_type(), err.to_string()),
        }
        log::info!(
            "[{}] {} operation {} on {} {} is {}",
            ctx.correlation_id,
            operation.op_type,
            operation.id,
            operation.resource_type,
            operation.resource_id,
            operation.state
        );
        raw.update_typed(operation).await?;
        result
    }
}

async fn run_action(
    repository: &InterceptableRepository,
    ctx: &RequestContext,
    action: JobAction,
) -> Result<(), ApiError> {
    match action {
        JobAction::Create(object) => repository.create(ctx, object).await.map(drop),
        JobAction::Update(object) => repository.update(ctx, object).await.map(drop),
        JobAction::Delete {
            object_type,
            criteria,
        } => repository.delete(ctx, object_type, &criteria).await,
    }
}

/// Bounded worker pool executing scheduled jobs.
pub struct Scheduler {
    repository: Arc<InterceptableRepository>,
    settings: SchedulerSettings,
    sender: mpsc::Sender<Job>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// `shutdown` stops the pool and cancels running jobs.
    pub fn new(
        repository: Arc<InterceptableRepository>,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
        Self {
            repository,
            settings,
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
        }
    }

    pub fn repository(&self) -> &Arc<InterceptableRepository> {
        &self.repository
    }

    pub fn job_timeout(&self) -> Duration {
        self.settings.job_timeout
    }

    pub fn schedule_create(&self, ctx: &RequestContext, object: Object, operation_id: Id) {
        self.enqueue(self.job(ctx, operation_id, JobAction::Create(object)));
    }

    pub fn schedule_update(&self, ctx: &RequestContext, object: Object, operation_id: Id) {
        self.enqueue(self.job(ctx, operation_id, JobAction::Update(object)));
    }

    pub fn schedule_delete(
        &self,
        ctx: &RequestContext,
        object_type: ObjectType,
        criteria: Vec<Criterion>,
        operation_id: Id,
    ) {
        self.enqueue(self.job(
            ctx,
            operation_id,
            JobAction::Delete {
                object_type,
                criteria,
            },
        ));
    }

    /// Executes a job on the caller's task, bypassing the queue.
    pub async fn execute(&self, job: Job) -> Result<(), ApiError> {
        job.execute(&self.repository, self.settings.job_timeout).await
    }

    /// Jobs outlive the request that scheduled them; only shutdown cancels them.
    fn job(&self, ctx: &RequestContext, operation_id: Id, action: JobAction) -> Job {
        let context = RequestContext {
            correlation_id: ctx.correlation_id.clone(),
            operation_id: None,
            cancellation: self.shutdown.child_token(),
        };
        Job::new(&context, operation_id, action)
    }

    fn enqueue(&self, job: Job) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let operation_id = job.operation_id.clone();
            if sender.send(job).await.is_err() {
                log::error!("Scheduler stopped; dropping job for operation {}", operation_id);
            }
        });
    }

    /// Pulls jobs off the queue until shutdown, running at most `pool_size` at a time.
    pub async fn run(&self) {
        let Some(mut jobs) = self.receiver.lock().take() else {
            log::warn!("Scheduler is already running");
            return;
        };
        let workers = Arc::new(Semaphore::new(self.settings.pool_size.max(1)));
        let (errors, mut failures) = mpsc::unbounded_channel::<(Id, ApiError)>();
        tokio::spawn(async move {
            while let Some((operation_id, err)) = failures.recv().await {
                log::error!("Job for operation {} failed: {}", operation_id, err);
            }
        });

        log::info!(
            "Scheduler started with {} workers",
            self.settings.pool_size.max(1)
        );
        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let repository = self.repository.clone();
            let errors = errors.clone();
            let timeout = self.settings.job_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                let operation_id = job.operation_id.clone();
                if let Err(err) = job.execute(&repository, timeout).await {
                    let _ = errors.send((operation_id, err));
                }
            });
        }
        log::info!("Scheduler stopped");
    }
}
