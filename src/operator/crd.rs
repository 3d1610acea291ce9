//! `UrlPerformance` custom resource (`traefikofficer.io/v1alpha1`)

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use traefik_officer_common::TargetKind;

/// Per-target monitoring rules for one Ingress or IngressRoute
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "traefikofficer.io",
    version = "v1alpha1",
    kind = "UrlPerformance",
    plural = "urlperformances",
    shortname = "urlperf",
    namespaced,
    status = "UrlPerformanceStatus",
    printcolumn = r#"{"name":"Target Kind","type":"string","jsonPath":".spec.targetRef.kind","description":"The kind of target resource"}"#,
    printcolumn = r#"{"name":"Target Name","type":"string","jsonPath":".spec.targetRef.name","description":"The name of the target resource"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.targetRef.namespace","description":"The namespace of the target resource"}"#,
    printcolumn = r#"{"name":"Enabled","type":"boolean","jsonPath":".spec.enabled","description":"Whether monitoring is enabled"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase","description":"The current phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp","description":"The age of the resource"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UrlPerformanceSpec {
    pub target_ref: TargetReference,

    /// Only matching paths are monitored; empty means all paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whitelist_paths_regex: Vec<String>,

    /// Matching paths are never monitored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_paths_regex: Vec<String>,

    /// Paths under these prefixes have ids and query strings merged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_paths_with_extensions: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url_patterns: Vec<UrlPatternSpec>,

    /// Number of slowest paths that get per-endpoint series
    #[serde(default = "default_collect_n_top")]
    #[schemars(range(min = 1, max = 1000))]
    pub collect_n_top: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_collect_n_top() -> u32 {
    20
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    #[serde(default)]
    pub kind: TargetRefKind,
    pub name: String,
    /// Defaults to the namespace of the `UrlPerformance`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TargetRefKind {
    #[default]
    Ingress,
    IngressRoute,
}

impl From<TargetRefKind> for TargetKind {
    fn from(kind: TargetRefKind) -> Self {
        match kind {
            TargetRefKind::Ingress => TargetKind::Ingress,
            TargetRefKind::IngressRoute => TargetKind::IngressRoute,
        }
    }
}

impl fmt::Display for TargetRefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        TargetKind::from(*self).fmt(f)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct UrlPatternSpec {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UrlPerformanceStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Distinct endpoint paths seen for the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitored_paths: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Active,
    Error,
    Disabled,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    Ready,
    TargetExists,
    ConfigGenerated,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl UrlPerformance {
    /// `<namespace>/<name>` of this object
    pub fn object_ref(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Namespace of the target, defaulting to the object's own
    pub fn target_namespace(&self) -> &str {
        self.spec
            .target_ref
            .namespace
            .as_deref()
            .filter(|ns| !ns.trim().is_empty())
            .or(self.metadata.namespace.as_deref())
            .unwrap_or_default()
    }

    /// Config store key of the target
    pub fn target_key(&self) -> String {
        traefik_officer_common::target_key(self.target_namespace(), &self.spec.target_ref.name)
    }
}
