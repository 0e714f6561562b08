//! Removal of APIServices whose owning ClusterServiceVersion is gone

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{info, instrument, warn};

use crate::controller::Context;
use crate::controller::apply::delete_if_present;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{APIService, ClusterServiceVersion};
use crate::resources::common::owner_of;

#[instrument(skip(api_service, ctx), fields(name = %api_service.name_any()))]
pub async fn reconcile(api_service: Arc<APIService>, ctx: Arc<Context>) -> Result<Action> {
    let Some(owner) = owner_of(&api_service.metadata) else {
        return Ok(Action::await_change());
    };

    let csvs: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), &owner.namespace);
    let owner_exists = csvs.get_opt(&owner.name).await?.is_some();
    if !owner_exists {
        let api: Api<APIService> = Api::all(ctx.client.clone());
        if delete_if_present(&api, &api_service.name_any()).await? {
            info!(owner = %owner, "Deleted orphaned APIService");
        }
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ctx.config.resync()))
}

pub fn error_policy(api_service: Arc<APIService>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(
        "Orphan check failed for APIService {}: {}, requeuing in {:?}",
        api_service.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
