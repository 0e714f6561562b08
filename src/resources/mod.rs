pub mod certificate;
pub mod common;
pub mod deployment;
pub mod rbac;
pub mod secret;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, OwnerKey, owner_of, owner_reference, standard_labels,
};
