use std::collections::HashSet;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::interceptors::{CreateInterceptor, OnCreateNext, OnUpdateNext, UpdateInterceptor};
use crate::model::{
    ObjectType, Platform, ServiceBroker, ServiceOffering, ServicePlan, Visibility, SM_PLATFORM,
};
use crate::store::{Criterion, Repository, RepositoryExt};

pub const PUBLIC_PLAN_VISIBILITY_INTERCEPTOR: &str = "public-plan-visibility";

/// Decides whether a plan is visible to every tenant.
pub type PublicPlanPredicate =
    Arc<dyn Fn(&ServiceBroker, &ServiceOffering, &ServicePlan) -> bool + Send + Sync>;

/// Free plans are public.
pub fn free_plans_are_public() -> PublicPlanPredicate {
    Arc::new(|_, _, plan| plan.free)
}

/// Rebuilds the visibilities of a broker's plans after its catalog was stored.
pub struct PublicPlanVisibilityInterceptor {
    is_public: PublicPlanPredicate,
    tenant_label_key: Option<String>,
}

impl PublicPlanVisibilityInterceptor {
    pub fn new(is_public: PublicPlanPredicate, tenant_label_key: Option<String>) -> Self {
        Self {
            is_public,
            tenant_label_key,
        }
    }

    fn is_tenant_scoped(&self, platform: &Platform) -> bool {
        self.tenant_label_key
            .as_ref()
            .is_some_and(|key| platform.labels.contains_key(key))
    }

    async fn resync(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        broker: &ServiceBroker,
    ) -> Result<(), ApiError> {
        let platforms: Vec<Platform> = tx
            .list_typed(&[Criterion::not_equals("id", SM_PLATFORM)])
            .await?;
        for offering in &broker.services {
            for plan in &offering.plans {
                let public = (self.is_public)(broker, offering, plan);
                let visibilities: Vec<Visibility> = tx
                    .list_typed(&[Criterion::equals("service_plan_id", &plan.id)])
                    .await?;
                if plan.supports_all_platforms() {
                    self.resync_unrestricted(tx, plan, public, visibilities).await?;
                } else {
                    self.resync_restricted(tx, plan, public, &platforms, visibilities)
                        .await?;
                }
            }
        }
        log::debug!(
            "[{}] Resynced plan visibilities of broker {}",
            ctx.correlation_id,
            broker.name
        );
        Ok(())
    }

    async fn resync_unrestricted(
        &self,
        tx: &dyn Repository,
        plan: &ServicePlan,
        public: bool,
        visibilities: Vec<Visibility>,
    ) -> Result<(), ApiError> {
        let mut stale = Vec::new();
        let mut has_public = false;
        for visibility in visibilities {
            if public {
                // Exactly one public row, nothing else
                if visibility.is_public() && !has_public {
                    has_public = true;
                } else {
                    stale.push(visibility.id);
                }
            } else if visibility.is_public() {
                stale.push(visibility.id);
            }
        }
        delete_visibilities(tx, stale).await?;
        if public && !has_public {
            tx.create_typed(Visibility::new(plan.id.clone(), None)).await?;
        }
        Ok(())
    }

    async fn resync_restricted(
        &self,
        tx: &dyn Repository,
        plan: &ServicePlan,
        public: bool,
        platforms: &[Platform],
        visibilities: Vec<Visibility>,
    ) -> Result<(), ApiError> {
        let mut stale = Vec::new();
        let mut covered = HashSet::new();
        for visibility in visibilities {
            let Some(platform_id) = visibility.platform_id.as_deref() else {
                stale.push(visibility.id);
                continue;
            };
            let platform = match platforms.iter().find(|p| p.id == platform_id) {
                Some(platform) if plan.supports_platform(platform) => platform,
                _ => {
                    stale.push(visibility.id);
                    continue;
                }
            };
            // Labelled rows and tenant platforms are paid access and survive a non-public plan
            if public || !visibility.labels.is_empty() || self.is_tenant_scoped(platform) {
                covered.insert(platform_id.to_string());
            } else {
                stale.push(visibility.id);
            }
        }
        delete_visibilities(tx, stale).await?;
        if public {
            for platform in platforms {
                if plan.supports_platform(platform) && !covered.contains(&platform.id) {
                    tx.create_typed(Visibility::new(plan.id.clone(), Some(platform.id.clone())))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

async fn delete_visibilities(tx: &dyn Repository, ids: Vec<String>) -> Result<(), ApiError> {
    if ids.is_empty() {
        return Ok(());
    }
    tx.delete_matching(ObjectType::Visibility, &[Criterion::in_values("id", ids)])
        .await?;
    Ok(())
}

#[async_trait::async_trait]
impl CreateInterceptor<ServiceBroker> for PublicPlanVisibilityInterceptor {
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        broker: ServiceBroker,
        next: OnCreateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        let broker = next.run(ctx, tx, broker).await?;
        self.resync(ctx, tx, &broker).await?;
        Ok(broker)
    }
}

#[async_trait::async_trait]
impl UpdateInterceptor<ServiceBroker> for PublicPlanVisibilityInterceptor {
    async fn on_tx(
        &self,
        ctx: &RequestContext,
        tx: &dyn Repository,
        old: &ServiceBroker,
        broker: ServiceBroker,
        next: OnUpdateNext<'_, ServiceBroker>,
    ) -> Result<ServiceBroker, ApiError> {
        let broker = next.run(ctx, tx, old, broker).await?;
        self.resync(ctx, tx, &broker).await?;
        Ok(broker)
    }
}
