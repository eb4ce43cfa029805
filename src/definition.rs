use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// Prefix marking a command token as a named placeholder, e.g. `Ref::symbol`.
pub const PARAMETER_PREFIX: &str = "Ref::";

/// Resources a single job instance needs from its compute environment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// vCPUs, fractional values allowed (e.g. 0.5)
    pub vcpus: f64,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Accelerator (GPU) count
    #[serde(default)]
    pub gpus: u32,
}

impl ResourceRequirements {
    pub fn new(vcpus: f64, memory_mib: u64, gpus: u32) -> Self {
        Self {
            vcpus,
            memory_mib,
            gpus,
        }
    }
}

/// Immutable template for a runnable unit: image, command, resources, timeout.
///
/// Definitions are never mutated in place. Registering a changed definition
/// under an existing name produces a new revision; running instances keep
/// referencing the revision they were created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// Assigned by the registry, starting at 1.
    pub revision: u32,
    /// Container image reference, opaque to the control plane.
    pub image: String,
    /// Ordered command tokens; tokens starting with `Ref::` are placeholders.
    pub command: Vec<String>,
    pub resources: ResourceRequirements,
    /// Execution window for a single instance, enforced by the queue.
    pub timeout: Duration,
    /// Environment variable bindings passed to the runnable unit verbatim.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Default values for placeholders; a submission may override them.
    #[serde(default)]
    pub default_parameters: BTreeMap<String, String>,
}

impl JobDefinition {
    /// Substitute every placeholder token with its bound value.
    ///
    /// Lookup order is submission bindings first, then definition defaults.
    /// Fails with [`BatchError::UnboundParameter`] on the first placeholder
    /// that has neither. Resolution is deterministic: the output depends only
    /// on the template and the bindings.
    pub fn resolve(&self, bindings: &BTreeMap<String, String>) -> Result<Vec<String>> {
        self.command
            .iter()
            .map(|token| match token.strip_prefix(PARAMETER_PREFIX) {
                Some(name) => bindings
                    .get(name)
                    .or_else(|| self.default_parameters.get(name))
                    .cloned()
                    .ok_or_else(|| BatchError::UnboundParameter(name.to_string())),
                None => Ok(token.clone()),
            })
            .collect()
    }

    /// Names of all placeholders referenced by the command template.
    pub fn placeholders(&self) -> Vec<&str> {
        self.command
            .iter()
            .filter_map(|token| token.strip_prefix(PARAMETER_PREFIX))
            .collect()
    }
}

/// Owning registry of job definitions keyed by name, all revisions retained.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Vec<JobDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, assigning its revision.
    ///
    /// If the latest revision under this name has identical attributes the
    /// registry keeps it and reports its revision; any attribute change
    /// creates a new revision rather than mutating the stored one.
    pub fn register(&mut self, mut definition: JobDefinition) -> u32 {
        let revisions = self.definitions.entry(definition.name.clone()).or_default();
        if let Some(latest) = revisions.last() {
            definition.revision = latest.revision;
            if *latest == definition {
                return latest.revision;
            }
            definition.revision = latest.revision + 1;
        } else {
            definition.revision = 1;
        }
        let revision = definition.revision;
        revisions.push(definition);
        revision
    }

    /// Latest revision registered under `name`.
    pub fn latest(&self, name: &str) -> Option<&JobDefinition> {
        self.definitions.get(name).and_then(|revs| revs.last())
    }

    /// A specific revision of `name`.
    pub fn get(&self, name: &str, revision: u32) -> Option<&JobDefinition> {
        self.definitions
            .get(name)
            .and_then(|revs| revs.iter().find(|d| d.revision == revision))
    }

    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock_definition() -> JobDefinition {
        JobDefinition {
            name: "stock-batch".to_string(),
            revision: 0,
            image: "stock-batch:latest".to_string(),
            command: vec![
                "python".to_string(),
                "./stock_data.py".to_string(),
                "--symbol".to_string(),
                "Ref::symbol".to_string(),
                "--timeframe".to_string(),
                "Ref::timeframe".to_string(),
            ],
            resources: ResourceRequirements::new(4.0, 8192, 1),
            timeout: Duration::from_secs(7200),
            environment: BTreeMap::new(),
            default_parameters: BTreeMap::from([(
                "timeframe".to_string(),
                "1Day".to_string(),
            )]),
        }
    }

    #[test]
    fn resolve_substitutes_placeholders() {
        let def = stock_definition();
        let bindings = BTreeMap::from([("symbol".to_string(), "AAPL".to_string())]);

        let resolved = def.resolve(&bindings).unwrap();
        assert_eq!(
            resolved,
            vec![
                "python",
                "./stock_data.py",
                "--symbol",
                "AAPL",
                "--timeframe",
                "1Day"
            ]
        );
    }

    #[test]
    fn resolve_binding_overrides_default() {
        let def = stock_definition();
        let bindings = BTreeMap::from([
            ("symbol".to_string(), "MSFT".to_string()),
            ("timeframe".to_string(), "1Min".to_string()),
        ]);

        let resolved = def.resolve(&bindings).unwrap();
        assert_eq!(resolved[5], "1Min");
    }

    #[test]
    fn resolve_unbound_parameter_fails() {
        let def = stock_definition();
        let err = def.resolve(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BatchError::UnboundParameter(name) if name == "symbol"));
    }

    #[test]
    fn resolve_is_deterministic() {
        let def = stock_definition();
        let bindings = BTreeMap::from([("symbol".to_string(), "AAPL".to_string())]);

        let first = def.resolve(&bindings).unwrap();
        let second = def.resolve(&bindings).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn placeholders_lists_referenced_names() {
        let def = stock_definition();
        assert_eq!(def.placeholders(), vec!["symbol", "timeframe"]);
    }

    #[test]
    fn register_assigns_first_revision() {
        let mut registry = DefinitionRegistry::new();
        let revision = registry.register(stock_definition());
        assert_eq!(revision, 1);
        assert_eq!(registry.latest("stock-batch").unwrap().revision, 1);
    }

    #[test]
    fn register_changed_definition_creates_new_revision() {
        let mut registry = DefinitionRegistry::new();
        registry.register(stock_definition());

        let mut changed = stock_definition();
        changed.timeout = Duration::from_secs(3600);
        let revision = registry.register(changed);

        assert_eq!(revision, 2);
        // Both revisions stay addressable.
        assert_eq!(
            registry.get("stock-batch", 1).unwrap().timeout,
            Duration::from_secs(7200)
        );
        assert_eq!(
            registry.get("stock-batch", 2).unwrap().timeout,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn register_identical_definition_keeps_revision() {
        let mut registry = DefinitionRegistry::new();
        registry.register(stock_definition());
        let revision = registry.register(stock_definition());
        assert_eq!(revision, 1);
    }
}
