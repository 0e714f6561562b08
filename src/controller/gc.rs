//! Replacement chains and upgrade garbage collection
//!
//! CSVs in a namespace form singly linked chains through `spec.replaces`. A CSV with a
//! valid successor is superseded; once the head of its chain succeeds, the CSV deletes
//! the Deployments the head no longer declares and then itself.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::Context;
use crate::controller::apply::delete_if_present;
use crate::controller::error::Result;
use crate::crd::{ClusterServiceVersion, CsvPhase};
use crate::resources::common::{OwnerKey, is_copied, owner_selector};

/// Creation order: timestamp, then name for a deterministic tie-break
fn creation_key(csv: &ClusterServiceVersion) -> (Option<&Time>, String) {
    (csv.metadata.creation_timestamp.as_ref(), csv.name_any())
}

/// Whether `a` was created before `b`
pub fn created_before(a: &ClusterServiceVersion, b: &ClusterServiceVersion) -> bool {
    creation_key(a) < creation_key(b)
}

/// The `replaces` graph of one namespace
pub struct ReplaceGraph<'a> {
    csvs: BTreeMap<String, &'a ClusterServiceVersion>,
}

impl<'a> ReplaceGraph<'a> {
    /// Build from every CSV in a namespace; copies never take part in replacement
    pub fn new(csvs: &'a [ClusterServiceVersion]) -> Self {
        Self {
            csvs: csvs
                .iter()
                .filter(|c| !is_copied(&c.metadata))
                .map(|c| (c.name_any(), c))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&'a ClusterServiceVersion> {
        self.csvs.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a ClusterServiceVersion> + '_ {
        self.csvs.values().copied()
    }

    /// Members of the `replaces` cycle running through `csv`, if it lies on one
    fn cycle_of(&self, csv: &ClusterServiceVersion) -> Option<Vec<&'a ClusterServiceVersion>> {
        let name = csv.name_any();
        let mut seen = BTreeSet::from([name.clone()]);
        let mut members = Vec::new();
        let mut next = csv.spec.replaces.clone();
        while let Some(current) = next {
            if current == name {
                return Some(members);
            }
            if !seen.insert(current.clone()) {
                return None;
            }
            let prev = self.get(&current)?;
            members.push(prev);
            next = prev.spec.replaces.clone();
        }
        None
    }

    /// Whether `csv` sits on a replace cycle with an earlier-created member
    fn loses_cycle(&self, csv: &ClusterServiceVersion) -> bool {
        self.cycle_of(csv)
            .is_some_and(|members| members.iter().any(|m| created_before(m, csv)))
    }

    /// Whether `csv` may supersede the CSV it names. A CSV re-created under a replaced
    /// name after its successor is not that successor's predecessor.
    pub fn may_replace(&self, csv: &ClusterServiceVersion) -> bool {
        match csv.spec.replaces.as_deref().and_then(|name| self.get(name)) {
            Some(target) => created_before(target, csv),
            None => true,
        }
    }

    /// CSVs naming `name` in `replaces`, oldest first; cycle losers never qualify
    fn candidates(&self, name: &str) -> Vec<&'a ClusterServiceVersion> {
        let mut found: Vec<_> = self
            .iter()
            .filter(|c| c.spec.replaces.as_deref() == Some(name) && c.name_any() != name)
            .filter(|c| self.may_replace(c) && !self.loses_cycle(c))
            .collect();
        found.sort_by(|a, b| creation_key(a).cmp(&creation_key(b)));
        found
    }

    /// The valid successor of `name`: the oldest CSV replacing it
    pub fn successor(&self, name: &str) -> Option<&'a ClusterServiceVersion> {
        self.candidates(name).into_iter().next()
    }

    /// Names this CSV transitively replaces that still exist, nearest first
    pub fn predecessors(&self, csv: &ClusterServiceVersion) -> Vec<String> {
        let mut seen = BTreeSet::from([csv.name_any()]);
        let mut chain = Vec::new();
        let mut current: &ClusterServiceVersion = csv;
        while let Some(name) = current.spec.replaces.clone() {
            if !seen.insert(name.clone()) {
                break;
            }
            match self.get(&name) {
                Some(prev) if created_before(prev, current) => {
                    chain.push(name);
                    current = prev;
                }
                _ => break,
            }
        }
        chain
    }

    /// Names of the successors of `csv`, nearest first
    pub fn successors(&self, csv: &ClusterServiceVersion) -> Vec<String> {
        let mut seen = BTreeSet::from([csv.name_any()]);
        let mut chain = Vec::new();
        let mut current = csv.name_any();
        while let Some(next) = self.successor(&current) {
            let name = next.name_any();
            if !seen.insert(name.clone()) {
                break;
            }
            chain.push(name.clone());
            current = name;
        }
        chain
    }

    /// The newest CSV of the chain `csv` belongs to
    pub fn chain_head(&self, csv: &ClusterServiceVersion) -> Option<&'a ClusterServiceVersion> {
        self.successors(csv)
            .last()
            .and_then(|name| self.get(name))
    }

    /// Whether `other` is `csv` or one of its predecessors or successors
    pub fn in_chain(&self, csv: &ClusterServiceVersion, other: &str) -> bool {
        csv.name_any() == other
            || self.predecessors(csv).iter().any(|n| n == other)
            || self.successors(csv).iter().any(|n| n == other)
    }

    /// Conflict in the `replaces` links of `csv`, if any.
    ///
    /// Two CSVs replacing the same name: the later-created one conflicts. On a cycle of
    /// replacements every member but the earliest-created conflicts.
    pub fn replacement_conflict(&self, csv: &ClusterServiceVersion) -> Option<String> {
        let replaces = csv.spec.replaces.as_deref()?;
        let name = csv.name_any();

        if replaces == name {
            return Some(format!("{} replaces itself", name));
        }

        if self.loses_cycle(csv) {
            return Some(format!("replacement chain of {} forms a cycle", name));
        }

        if !self.may_replace(csv) {
            return None;
        }

        if let Some(first) = self.successor(replaces)
            && first.name_any() != name
        {
            return Some(format!(
                "{} is already being replaced by {}",
                replaces,
                first.name_any()
            ));
        }
        None
    }

    /// Earlier-created CSV outside the chain of `csv` that also owns one of its CRDs
    pub fn crd_owner_conflict(&self, csv: &ClusterServiceVersion) -> Option<String> {
        for desc in &csv.spec.customresourcedefinitions.owned {
            let rival = self.iter().find(|other| {
                other.owns_crd(&desc.name)
                    && !self.in_chain(csv, &other.name_any())
                    && created_before(other, csv)
            });
            if let Some(rival) = rival {
                return Some(format!(
                    "CRD {} is already owned by {}",
                    desc.name,
                    rival.name_any()
                ));
            }
        }
        None
    }
}

/// Where a CSV stands in its replacement chain
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainState {
    pub has_successor: bool,
    pub chain_head_succeeded: bool,
    pub head: Option<String>,
}

/// A CSV in replacement conflict is not superseded by anything
pub fn chain_state(graph: &ReplaceGraph<'_>, csv: &ClusterServiceVersion) -> ChainState {
    let head = match graph.replacement_conflict(csv) {
        Some(_) => None,
        None => graph.chain_head(csv),
    };
    ChainState {
        has_successor: head.is_some(),
        chain_head_succeeded: head.is_some_and(|h| h.phase() == CsvPhase::Succeeded),
        head: head.map(|h| h.name_any()),
    }
}

/// Deployments owned by `csv` whose names `head` no longer declares
pub fn deployments_to_delete(
    owned: &[Deployment],
    csv: &ClusterServiceVersion,
    head: &ClusterServiceVersion,
) -> Vec<String> {
    let keep: BTreeSet<&str> = head.deployment_names().into_iter().collect();
    let me = OwnerKey::of(csv);
    owned
        .iter()
        .filter(|d| crate::resources::owner_of(&d.metadata).as_ref() == Some(&me))
        .map(|d| d.name_any())
        .filter(|name| !keep.contains(name.as_str()))
        .collect()
}

/// Delete the replaced CSV after removing Deployments the chain head dropped
pub async fn collect_replaced(
    csv: &ClusterServiceVersion,
    head: &ClusterServiceVersion,
    ctx: &Context,
) -> Result<()> {
    let ns = csv.namespace().unwrap_or_default();
    let name = csv.name_any();
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);

    let owned = deployments
        .list(&ListParams::default().labels(&owner_selector(&OwnerKey::of(csv))))
        .await?;
    for dep in deployments_to_delete(&owned.items, csv, head) {
        info!(deployment = %dep, head = %head.name_any(), "Deleting replaced Deployment");
        delete_if_present(&deployments, &dep).await?;
    }

    let csvs: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), &ns);
    info!(head = %head.name_any(), "Deleting replaced ClusterServiceVersion {}", name);
    delete_if_present(&csvs, &name).await?;
    Ok(())
}
