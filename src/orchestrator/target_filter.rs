//! Exclusion filtering for batch targets.
//!
//! Targets can be excluded by name, by owning project, by having a GPU
//! allocation, or (with `imported_only`) by not being in the `imported`
//! state. Exclusion always wins over a target being named explicitly.

use std::collections::HashSet;

use crate::api::{FunctionState, Target};
use crate::types::{FunctionName, ProjectName};

/// Exclusion rules for a batch run.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    /// Function names that are never processed.
    excluded_functions: HashSet<FunctionName>,
    /// Projects whose functions are never processed.
    excluded_projects: HashSet<ProjectName>,
    exclude_gpu: bool,
    imported_only: bool,
}

/// Why a target was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ExcludedFunction,
    ExcludedProject(ProjectName),
    HasGpu,
    NotImported(FunctionState),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExcludedFunction => write!(f, "function is excluded"),
            Self::ExcludedProject(p) => write!(f, "project `{}` is excluded", p),
            Self::HasGpu => write!(f, "function requests GPU resources"),
            Self::NotImported(state) => write!(f, "function is `{}`, not imported", state),
        }
    }
}

impl TargetFilter {
    /// A filter that keeps every target.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn exclude_functions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionName>,
    {
        self.excluded_functions.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude_projects<I, S>(mut self, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ProjectName>,
    {
        self.excluded_projects.extend(projects.into_iter().map(Into::into));
        self
    }

    pub fn exclude_gpu(mut self, exclude: bool) -> Self {
        self.exclude_gpu = exclude;
        self
    }

    pub fn imported_only(mut self, imported_only: bool) -> Self {
        self.imported_only = imported_only;
        self
    }

    /// Decide whether a target is skipped, and why.
    pub fn skip_reason(&self, target: &Target) -> Option<SkipReason> {
        if self.excluded_functions.contains(&target.name) {
            return Some(SkipReason::ExcludedFunction);
        }
        if let Some(project) = &target.project {
            if self.excluded_projects.contains(project) {
                return Some(SkipReason::ExcludedProject(project.clone()));
            }
        }
        if self.exclude_gpu && target.has_gpu {
            return Some(SkipReason::HasGpu);
        }
        if self.imported_only && target.state != FunctionState::Imported {
            return Some(SkipReason::NotImported(target.state.clone()));
        }
        None
    }

    /// Split targets into the ones to process and the ones to skip.
    pub fn partition(&self, targets: Vec<Target>) -> (Vec<Target>, Vec<(Target, SkipReason)>) {
        let mut keep = Vec::with_capacity(targets.len());
        let mut skip = Vec::new();

        for target in targets {
            match self.skip_reason(&target) {
                Some(reason) => skip.push((target, reason)),
                None => keep.push(target),
            }
        }

        (keep, skip)
    }

    pub fn is_empty(&self) -> bool {
        self.excluded_functions.is_empty()
            && self.excluded_projects.is_empty()
            && !self.exclude_gpu
            && !self.imported_only
    }
}
