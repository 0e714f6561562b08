//! Write helpers shared by the executors
//!
//! Managed objects are written with server-side apply under [`FIELD_MANAGER`]. Objects
//! that are created once and never diffed go through [`create_if_absent`].

use std::fmt::Debug;

use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::resources::FIELD_MANAGER;

/// Server-side apply `resource`, taking ownership of every field it sets
pub async fn apply_resource<T>(api: &Api<T>, resource: &T) -> Result<T>
where
    T: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let applied = api.patch(&name, &params, &Patch::Apply(resource)).await?;
    debug!("Applied {}", name);
    Ok(applied)
}

/// Create `resource` unless an object with its name exists. Returns whether it was created.
pub async fn create_if_absent<T>(api: &Api<T>, resource: &T) -> Result<bool>
where
    T: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    let params = PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    match api.create(&params, resource).await {
        Ok(created) => {
            debug!("Created {}", created.name_any());
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete by name, treating a missing object as already deleted
pub async fn delete_if_present<T>(api: &Api<T>, name: &str) -> Result<bool>
where
    T: Resource + DeserializeOwned + Clone + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!("Deleted {}", name);
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}
