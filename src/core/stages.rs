//! Stage arena
//!
//! Each build tier is a node with an edge to the tier it is layered on. A tier
//! is dirty when one of its own inputs changed or when its parent is dirty, so
//! marking a tier is enough to rebuild everything above it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One layer of the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The sandbox and its base image
    Base,
    /// System packages copied out of the sandbox
    System,
    /// Python packages installed into the output area
    Python,
    /// The final archive
    Bundle,
}

impl Tier {
    /// All tiers, parents before children
    pub const ALL: [Tier; 4] = [Tier::Base, Tier::System, Tier::Python, Tier::Bundle];

    /// The tier this one is layered on
    pub fn parent(self) -> Option<Tier> {
        match self {
            Tier::Base => None,
            Tier::System => Some(Tier::Base),
            Tier::Python => Some(Tier::System),
            Tier::Bundle => Some(Tier::Python),
        }
    }

    /// Position in the arena
    fn index(self) -> usize {
        self as usize
    }

    /// Whether `ancestor` is this tier or one it is layered on
    pub fn depends_on(self, ancestor: Tier) -> bool {
        let mut current = Some(self);
        while let Some(tier) = current {
            if tier == ancestor {
                return true;
            }
            current = tier.parent();
        }
        false
    }

    /// This tier followed by every tier built on top of it
    pub fn with_dependents(self) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|tier| tier.depends_on(self))
            .collect()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Base => write!(f, "base"),
            Tier::System => write!(f, "system"),
            Tier::Python => write!(f, "python"),
            Tier::Bundle => write!(f, "bundle"),
        }
    }
}

/// Why a tier must be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyReason {
    /// The sandbox was created from scratch
    SandboxRecreated,
    /// The caller asked for a rebuild
    Forced,
    /// An input fingerprint changed
    InputsChanged(&'static str),
    /// The archive prefix changed
    PrefixChanged,
    /// The artifact on disk no longer matches the recorded hash
    ArtifactMismatch,
    /// The last attempt at this tier never completed
    Incomplete,
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SandboxRecreated => write!(f, "sandbox recreated"),
            Self::Forced => write!(f, "rebuild requested"),
            Self::InputsChanged(what) => write!(f, "{what} changed"),
            Self::PrefixChanged => write!(f, "prefix changed"),
            Self::ArtifactMismatch => write!(f, "artifact modified or missing"),
            Self::Incomplete => write!(f, "previous attempt did not complete"),
        }
    }
}

#[derive(Debug, Clone)]
struct StageNode {
    parent: Option<usize>,
    reasons: Vec<DirtyReason>,
}

/// Arena of tiers with parent edges and per-tier dirty reasons
#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: Vec<StageNode>,
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl StageGraph {
    /// A graph with every tier clean
    pub fn new() -> Self {
        let nodes = Tier::ALL
            .into_iter()
            .map(|tier| StageNode {
                parent: tier.parent().map(Tier::index),
                reasons: Vec::new(),
            })
            .collect();
        Self { nodes }
    }

    /// Record a reason for rebuilding `tier`
    pub fn mark(&mut self, tier: Tier, reason: DirtyReason) {
        let node = &mut self.nodes[tier.index()];
        if !node.reasons.contains(&reason) {
            node.reasons.push(reason);
        }
    }

    /// Mark `tier` when `condition` holds
    pub fn mark_if(&mut self, condition: bool, tier: Tier, reason: DirtyReason) {
        if condition {
            self.mark(tier, reason);
        }
    }

    /// Reasons recorded directly on `tier`
    pub fn reasons(&self, tier: Tier) -> &[DirtyReason] {
        &self.nodes[tier.index()].reasons
    }

    /// Whether `tier` or anything below it must be rebuilt
    pub fn is_dirty(&self, tier: Tier) -> bool {
        let mut current = Some(tier.index());
        while let Some(index) = current {
            let node = &self.nodes[index];
            if !node.reasons.is_empty() {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Human readable explanation for a rebuild of `tier`
    pub fn explain(&self, tier: Tier) -> String {
        let own: Vec<String> = self.reasons(tier).iter().map(ToString::to_string).collect();
        if !own.is_empty() {
            return own.join(", ");
        }
        match tier.parent() {
            Some(parent) if self.is_dirty(parent) => format!("{parent} tier rebuilt"),
            _ => "up to date".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_graph() {
        let graph = StageGraph::new();
        assert!(Tier::ALL.iter().all(|tier| !graph.is_dirty(*tier)));
    }

    #[test]
    fn test_dirty_propagates_upward_only() {
        let mut graph = StageGraph::new();
        graph.mark(Tier::Python, DirtyReason::InputsChanged("requirements"));

        assert!(!graph.is_dirty(Tier::Base));
        assert!(!graph.is_dirty(Tier::System));
        assert!(graph.is_dirty(Tier::Python));
        assert!(graph.is_dirty(Tier::Bundle));
        assert_eq!(graph.explain(Tier::Bundle), "python tier rebuilt");
    }

    #[test]
    fn test_mark_if_and_duplicate_reasons() {
        let mut graph = StageGraph::new();
        graph.mark_if(false, Tier::System, DirtyReason::Forced);
        assert!(!graph.is_dirty(Tier::System));

        graph.mark(Tier::Bundle, DirtyReason::ArtifactMismatch);
        graph.mark(Tier::Bundle, DirtyReason::ArtifactMismatch);
        assert_eq!(graph.reasons(Tier::Bundle).len(), 1);
        assert_eq!(graph.explain(Tier::Bundle), "artifact modified or missing");
    }

    #[test]
    fn test_with_dependents() {
        assert_eq!(Tier::Base.with_dependents(), Tier::ALL.to_vec());
        assert_eq!(
            Tier::Python.with_dependents(),
            vec![Tier::Python, Tier::Bundle]
        );
        assert_eq!(Tier::Bundle.with_dependents(), vec![Tier::Bundle]);
    }
}
