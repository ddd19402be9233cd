//! Analyzer registry — the static table of declared units.
//!
//! Units are declared once at process start. A cycle or an unknown name
//! in a dependency list is a configuration error surfaced from
//! [`Registry::new`]; callers are expected to exit rather than serve
//! with a broken table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, Result};
use crate::store::ArtifactStore;
use crate::types::RepoId;

/// What a unit reports back after writing its artifact.
#[derive(Debug, Clone, Default)]
pub struct UnitOutput {
    pub finding_count: u64,
    pub output_file: Option<String>,
}

/// Everything a unit gets to work with. The unit owns writing its
/// artifact through the store; the scheduler owns everything else.
#[derive(Debug, Clone, Copy)]
pub struct UnitContext<'a> {
    pub repo: &'a RepoId,
    pub worktree: &'a Path,
    pub store: &'a ArtifactStore,
    pub cancel: &'a CancellationToken,
}

/// Common interface for all analyzer units. In-process fakes and
/// subprocess-wrapped analyzers sit behind the same trait.
#[async_trait::async_trait]
pub trait AnalyzerUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Run the analysis and write the artifact. Must honor
    /// `ctx.cancel` promptly at every suspension point.
    async fn run(&self, ctx: UnitContext<'_>) -> Result<UnitOutput>;
}

/// Static declaration of one unit.
#[derive(Clone)]
pub struct UnitSpec {
    pub name: String,
    pub description: String,
    /// Units that must have a current artifact before this one runs.
    pub dependencies: Vec<String>,
    /// Wall-clock cap; `None` falls back to the scheduler default.
    pub timeout: Option<Duration>,
    /// Fixed startup cost of the underlying analyzer.
    pub base_cost: Duration,
    /// Marginal cost per file in the working tree.
    pub per_file_cost: Duration,
    /// Profiles that include this unit.
    pub profiles: Vec<String>,
    pub runner: Arc<dyn AnalyzerUnit>,
}

impl std::fmt::Debug for UnitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSpec")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("profiles", &self.profiles)
            .finish_non_exhaustive()
    }
}

impl UnitSpec {
    pub fn new(name: impl Into<String>, runner: Arc<dyn AnalyzerUnit>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            dependencies: Vec::new(),
            timeout: None,
            base_cost: Duration::from_secs(5),
            per_file_cost: Duration::from_millis(2),
            profiles: Vec::new(),
            runner,
        }
    }

    /// Monotone non-decreasing estimate used for progress UX, the
    /// longest-first tie-break, and `skip_slow`.
    pub fn estimated_duration(&self, file_count: u64) -> Duration {
        self.base_cost + self.per_file_cost * u32::try_from(file_count.min(1_000_000)).unwrap_or(u32::MAX)
    }

    pub fn in_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p == profile)
    }
}

#[derive(Debug)]
pub struct Registry {
    units: BTreeMap<String, UnitSpec>,
}

impl Registry {
    /// Validate and index the declared unit table. Duplicate names,
    /// unknown dependencies, and dependency cycles are all fatal here.
    pub fn new(specs: Vec<UnitSpec>) -> std::result::Result<Self, ConfigError> {
        let mut units = BTreeMap::new();
        for spec in specs {
            if units.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate unit declaration: {}",
                    spec.name
                )));
            }
        }

        for spec in units.values() {
            for dep in &spec.dependencies {
                if !units.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        unit: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Cycle check over the dependency DAG
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index = HashMap::new();
        for name in units.keys() {
            index.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for spec in units.values() {
            for dep in &spec.dependencies {
                graph.add_edge(index[dep.as_str()], index[spec.name.as_str()], ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            return Err(ConfigError::DependencyCycle(
                graph[cycle.node_id()].to_string(),
            ));
        }

        Ok(Self { units })
    }

    pub fn get(&self, name: &str) -> Option<&UnitSpec> {
        self.units.get(name)
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitSpec> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// All profile names any unit declares.
    pub fn profiles(&self) -> BTreeSet<String> {
        self.units
            .values()
            .flat_map(|spec| spec.profiles.iter().cloned())
            .collect()
    }

    /// Units belonging to a profile, in name order.
    pub fn profile_units(&self, profile: &str) -> Vec<&UnitSpec> {
        self.units
            .values()
            .filter(|spec| spec.in_profile(profile))
            .collect()
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.units.values().any(|spec| spec.in_profile(profile))
    }

    /// Whether `a` transitively depends on `b`. Two units are
    /// independent iff neither transitively depends on the other.
    pub fn depends_on(&self, a: &str, b: &str) -> bool {
        let mut stack: Vec<&str> = match self.units.get(a) {
            Some(spec) => spec.dependencies.iter().map(String::as_str).collect(),
            None => return false,
        };
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == b {
                return true;
            }
            if seen.insert(current) {
                if let Some(spec) = self.units.get(current) {
                    stack.extend(spec.dependencies.iter().map(String::as_str));
                }
            }
        }
        false
    }
}
