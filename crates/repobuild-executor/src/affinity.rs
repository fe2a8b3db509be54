//! Node placement for build pods.
//!
//! With sticky builds on, repeated builds of one repository are steered to
//! the same node so its image layer cache can be reused. Nodes are ranked by
//! rendezvous (highest random weight) hashing: each `(node, key)` pair gets a
//! score and the highest score wins, so adding or removing a node only moves
//! the keys that ranked that node first.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Pod, PodAffinityTerm,
    PodAntiAffinity, PreferredSchedulingTerm, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::cluster::{COMPONENT_LABEL, job_node};

pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Weight of the preferred scheduling terms. Preferences only: the
/// scheduler may still place the pod anywhere.
const PREFERENCE_WEIGHT: i32 = 100;

fn rendezvous_score(node: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(node.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Rank nodes for `key`, best first. Duplicate node names count once.
pub fn rendezvous_rank<I, S>(nodes: I, key: &str) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let unique: BTreeSet<String> = nodes
        .into_iter()
        .map(|node| node.as_ref().to_string())
        .collect();
    let mut scored: Vec<(u64, String)> = unique
        .into_iter()
        .map(|node| (rendezvous_score(&node, key), node))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, node)| node).collect()
}

/// Nodes that pods have been scheduled onto. Unscheduled pods are skipped.
pub fn active_nodes(pods: &[Pod]) -> BTreeSet<String> {
    pods.iter()
        .filter_map(job_node)
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityDecision {
    /// Prefer this node.
    PreferNode(String),
    /// Prefer nodes not already running a build.
    SpreadFromBuilds,
}

#[derive(Debug, Clone)]
pub struct NodeAffinityPolicy {
    sticky: bool,
    component_label: String,
}

impl NodeAffinityPolicy {
    pub fn new(sticky: bool, component_label: impl Into<String>) -> Self {
        Self {
            sticky,
            component_label: component_label.into(),
        }
    }

    pub fn decide<I, S>(&self, nodes: I, key: &str) -> AffinityDecision
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.sticky {
            return AffinityDecision::SpreadFromBuilds;
        }
        match rendezvous_rank(nodes, key).into_iter().next() {
            Some(best) => AffinityDecision::PreferNode(best),
            None => AffinityDecision::SpreadFromBuilds,
        }
    }

    pub fn affinity(&self, decision: &AffinityDecision) -> Affinity {
        match decision {
            AffinityDecision::PreferNode(node) => Affinity {
                node_affinity: Some(NodeAffinity {
                    preferred_during_scheduling_ignored_during_execution: Some(vec![
                        PreferredSchedulingTerm {
                            weight: PREFERENCE_WEIGHT,
                            preference: NodeSelectorTerm {
                                match_expressions: Some(vec![NodeSelectorRequirement {
                                    key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                                    operator: "In".to_string(),
                                    values: Some(vec![node.clone()]),
                                }]),
                                ..Default::default()
                            },
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            AffinityDecision::SpreadFromBuilds => Affinity {
                pod_anti_affinity: Some(PodAntiAffinity {
                    preferred_during_scheduling_ignored_during_execution: Some(vec![
                        WeightedPodAffinityTerm {
                            weight: PREFERENCE_WEIGHT,
                            pod_affinity_term: PodAffinityTerm {
                                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                                label_selector: Some(LabelSelector {
                                    match_labels: Some(
                                        [(
                                            COMPONENT_LABEL.to_string(),
                                            self.component_label.clone(),
                                        )]
                                        .into_iter()
                                        .collect(),
                                    ),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        },
                    ]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }
}
