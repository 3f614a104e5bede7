//! Wire models for the function-management API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{FunctionName, Namespace, ProjectName};

/// Label carrying the project a function belongs to.
pub const PROJECT_NAME_LABEL: &str = "functions.io/project-name";

/// Resource keys with this suffix are GPU allocations (e.g. `nvidia.com/gpu`).
pub const GPU_RESOURCE_SUFFIX: &str = "/gpu";

/// A function as reported by the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionRecord {
    #[serde(default)]
    pub metadata: FunctionMetadata,
    #[serde(default)]
    pub spec: FunctionSpec,
    #[serde(default)]
    pub status: FunctionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionSpec {
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, Value>,
    #[serde(default)]
    pub limits: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionStatus {
    #[serde(default)]
    pub state: FunctionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FunctionRecord {
    pub fn name(&self) -> FunctionName {
        FunctionName::new(self.metadata.name.clone())
    }

    pub fn project(&self) -> Option<ProjectName> {
        self.metadata
            .labels
            .get(PROJECT_NAME_LABEL)
            .map(|p| ProjectName::new(p.clone()))
    }

    /// True when any GPU request or limit is a positive quantity.
    pub fn has_gpu(&self) -> bool {
        let resources = &self.spec.resources;
        resources
            .requests
            .iter()
            .chain(resources.limits.iter())
            .filter(|(key, _)| key.ends_with(GPU_RESOURCE_SUFFIX))
            .any(|(_, quantity)| quantity_is_positive(quantity))
    }
}

fn quantity_is_positive(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64().is_some_and(|v| v > 0.0),
        Value::String(s) => s.trim().parse::<f64>().is_ok_and(|v| v > 0.0),
        _ => false,
    }
}

/// Remote lifecycle state of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum FunctionState {
    Ready,
    Error,
    Unhealthy,
    ScaledToZero,
    Imported,
    Building,
    WaitingForResourceConfiguration,
    WaitingForScaleResourcesFromZero,
    WaitingForScaleResourcesToZero,
    #[default]
    Unknown,
    Other(String),
}

impl FunctionState {
    /// Terminal states stop a completion wait.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Error | Self::Unhealthy | Self::ScaledToZero
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Unhealthy => "unhealthy",
            Self::ScaledToZero => "scaledToZero",
            Self::Imported => "imported",
            Self::Building => "building",
            Self::WaitingForResourceConfiguration => "waitingForResourceConfiguration",
            Self::WaitingForScaleResourcesFromZero => "waitingForScaleResourcesFromZero",
            Self::WaitingForScaleResourcesToZero => "waitingForScaleResourcesToZero",
            Self::Unknown => "",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for FunctionState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ready" => Self::Ready,
            "error" => Self::Error,
            "unhealthy" => Self::Unhealthy,
            "scaledToZero" => Self::ScaledToZero,
            "imported" => Self::Imported,
            "building" => Self::Building,
            "waitingForResourceConfiguration" => Self::WaitingForResourceConfiguration,
            "waitingForScaleResourcesFromZero" => Self::WaitingForScaleResourcesFromZero,
            "waitingForScaleResourcesToZero" => Self::WaitingForScaleResourcesToZero,
            "" => Self::Unknown,
            _ => Self::Other(s),
        }
    }
}

impl fmt::Display for FunctionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

impl Serialize for FunctionState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FunctionState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}

/// State a batch operation may ask a function to converge to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesiredState {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "scaledToZero")]
    ScaledToZero,
}

impl DesiredState {
    /// The remote state that counts as "done" for this desired state.
    pub fn target_state(&self) -> FunctionState {
        match self {
            Self::Ready => FunctionState::Ready,
            Self::ScaledToZero => FunctionState::ScaledToZero,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target_state().as_str())
    }
}

/// Rejected desired-state argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredStateError(pub String);

impl fmt::Display for DesiredStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid desired state `{}` (expected `ready` or `scaledToZero`)",
            self.0
        )
    }
}

impl std::error::Error for DesiredStateError {}

impl FromStr for DesiredState {
    type Err = DesiredStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "scaledtozero" | "scaled-to-zero" | "scaled_to_zero" => Ok(Self::ScaledToZero),
            _ => Err(DesiredStateError(s.to_string())),
        }
    }
}

/// Body of a state-changing PATCH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPatch {
    pub desired_state: DesiredState,
}

/// A function selected for a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: FunctionName,
    pub namespace: Namespace,
    pub project: Option<ProjectName>,
    pub has_gpu: bool,
    pub state: FunctionState,
}

impl Target {
    pub fn from_record(record: &FunctionRecord, namespace: &Namespace) -> Self {
        let namespace = if record.metadata.namespace.is_empty() {
            namespace.clone()
        } else {
            Namespace::new(record.metadata.namespace.clone())
        };

        Self {
            name: record.name(),
            namespace,
            project: record.project(),
            has_gpu: record.has_gpu(),
            state: record.status.state.clone(),
        }
    }
}
