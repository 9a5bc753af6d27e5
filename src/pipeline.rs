//! Pipeline model: an ordered set of declarative stage definitions with
//! inter-stage dependency links.
//!
//! The pipeline is a read-only derived view once constructed. Construction
//! validates the full dependency structure eagerly: unknown references,
//! forward references (declaration order must already be a valid
//! topological order) and cycles are all rejected before anything runs.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::errors::{KilnError, Result};

/// Declarative definition of a single stage.
///
/// Dependencies come from two places: the explicit `depends_on` list, and
/// *links* embedded in `params` - any string value of the form `"@stage"`
/// or `"@stage.attr"` references the output of an earlier stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSchema {
    /// Component the stage instantiates when it runs.
    pub component: String,
    /// Free-form component parameters, possibly containing links.
    #[serde(default)]
    pub params: Value,
    /// Explicit dependency stage names, in addition to any links.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StageSchema {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            params: Value::Null,
            depends_on: Vec::new(),
        }
    }

    /// Add a parameter. String values starting with `@` become links.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.params.is_object() {
            self.params = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.params.as_object_mut() {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Add an explicit dependency edge.
    pub fn with_dependency(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Immediate dependency names: explicit `depends_on` entries first,
    /// then link targets found in `params`. Duplicates removed, first-seen
    /// order preserved.
    pub fn dependencies(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for name in &self.depends_on {
            if seen.insert(name.clone()) {
                deps.push(name.clone());
            }
        }
        collect_links(&self.params, &mut |stage| {
            if seen.insert(stage.to_string()) {
                deps.push(stage.to_string());
            }
        });
        deps
    }
}

/// Parse a link of the form `@stage` or `@stage.attr`, returning the
/// referenced stage name.
pub fn parse_link(value: &str) -> Option<&str> {
    let rest = value.strip_prefix('@')?;
    let stage = rest.split('.').next().unwrap_or(rest);
    if stage.is_empty() {
        None
    } else {
        Some(stage)
    }
}

fn collect_links(value: &Value, on_link: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => {
            if let Some(stage) = parse_link(s) {
                on_link(stage);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_links(item, on_link);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_links(item, on_link);
            }
        }
        _ => {}
    }
}

/// Ordered mapping from stage name to [`StageSchema`].
///
/// Iteration order is the declaration order, which is guaranteed by
/// construction to be a topological order of the dependency graph.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<(String, StageSchema)>,
    index: HashMap<String, usize>,
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl Pipeline {
    /// Build and validate a pipeline from stage definitions in declaration
    /// order.
    pub fn new(stages: Vec<(String, StageSchema)>) -> Result<Self> {
        let mut index = HashMap::with_capacity(stages.len());
        for (pos, (name, _)) in stages.iter().enumerate() {
            if index.insert(name.clone(), pos).is_some() {
                return Err(KilnError::validation(format!(
                    "duplicate stage name '{}'",
                    name
                )));
            }
        }

        let mut graph = DiGraph::new();
        let mut nodes = HashMap::with_capacity(stages.len());
        for (name, _) in &stages {
            nodes.insert(name.clone(), graph.add_node(name.clone()));
        }

        for (pos, (name, schema)) in stages.iter().enumerate() {
            for dep in schema.dependencies() {
                let dep_pos = *index
                    .get(&dep)
                    .ok_or_else(|| KilnError::unknown_stage(&dep))?;
                if dep_pos >= pos {
                    // Declaration order must already be topological.
                    return Err(KilnError::unresolved_dependency(name, &dep));
                }
                graph.add_edge(nodes[&dep], nodes[name.as_str()], ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(KilnError::validation(
                "pipeline contains a dependency cycle",
            ));
        }

        debug!(
            stages = stages.len(),
            edges = graph.edge_count(),
            "pipeline validated"
        );

        Ok(Self {
            stages,
            index,
            graph,
            nodes,
        })
    }

    /// Load a pipeline from a YAML mapping of stage name to definition.
    /// Mapping order is the declaration order.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::new(parse_stages_yaml(yaml)?)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Stages as (name, definition) pairs in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &StageSchema)> {
        self.stages.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn schema(&self, name: &str) -> Result<&StageSchema> {
        let pos = self
            .index
            .get(name)
            .ok_or_else(|| KilnError::unknown_stage(name))?;
        Ok(&self.stages[*pos].1)
    }

    /// Immediate dependency names of `name`, first-seen order, deduplicated.
    pub fn immediate_dependencies(&self, name: &str) -> Result<Vec<String>> {
        Ok(self.schema(name)?.dependencies())
    }

    /// Derive the sub-pipeline rooted at `name`: the target stage plus
    /// everything it transitively depends on, in declaration order.
    pub fn sub_pipeline(&self, name: &str) -> Result<SubPipeline> {
        let target = *self
            .nodes
            .get(name)
            .ok_or_else(|| KilnError::unknown_stage(name))?;

        // Walking the reversed graph from the target visits exactly the
        // transitive dependency closure.
        let mut members = HashSet::new();
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, target);
        while let Some(node) = dfs.next(reversed) {
            members.insert(self.graph[node].clone());
        }

        let stages = self
            .stages
            .iter()
            .filter(|(n, _)| members.contains(n))
            .cloned()
            .collect();

        Ok(SubPipeline {
            target: name.to_string(),
            stages,
            dependencies: self.immediate_dependencies(name)?,
        })
    }
}

/// Parse a YAML mapping of stage name to definition into declaration-order
/// pairs, without validating the dependency structure.
pub fn parse_stages_yaml(yaml: &str) -> Result<Vec<(String, StageSchema)>> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml)?;
    let mut stages = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| KilnError::validation("stage names must be strings"))?
            .to_string();
        let schema: StageSchema = serde_yaml::from_value(value)?;
        stages.push((name, schema));
    }
    Ok(stages)
}

/// Dependency-closure view of a [`Pipeline`] rooted at one target stage.
///
/// Derived on demand; owned by the scheduler iteration that requested it
/// and handed to the stage it dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPipeline {
    target: String,
    stages: Vec<(String, StageSchema)>,
    dependencies: Vec<String>,
}

impl SubPipeline {
    /// Name of the stage this view is rooted at.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Closure members as (name, definition) pairs in pipeline order.
    /// The target stage is always the last entry.
    pub fn stages(&self) -> impl Iterator<Item = (&str, &StageSchema)> {
        self.stages.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Immediate dependency names of the target stage.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parse_link_accepts_stage_and_attribute_forms() {
        assert_eq!(parse_link("@train"), Some("train"));
        assert_eq!(parse_link("@train.model"), Some("train"));
        assert_eq!(parse_link("train"), None);
        assert_eq!(parse_link("@"), None);
    }

    #[test]
    fn dependencies_are_deduplicated_in_first_seen_order() {
        let schema = StageSchema::new("evaluator")
            .with_dependency("train")
            .with_param("model", "@train.model")
            .with_param("dataset", "@prepare.dataset")
            .with_param("seed", 7);
        assert_eq!(schema.dependencies(), vec!["train", "prepare"]);
    }

    #[test]
    fn links_are_found_in_nested_params() {
        let schema = StageSchema::new("ensemble").with_param(
            "members",
            json!([{ "model": "@a.model" }, { "model": "@b.model" }]),
        );
        assert_eq!(schema.dependencies(), vec!["a", "b"]);
    }

    #[test]
    fn forward_reference_is_rejected_at_construction() {
        let stages = vec![
            ("x".to_string(), StageSchema::new("c").with_dependency("y")),
            ("y".to_string(), StageSchema::new("c")),
        ];
        let err = Pipeline::new(stages).unwrap_err();
        match err {
            KilnError::UnresolvedDependency { stage, dependency } => {
                assert_eq!(stage, "x");
                assert_eq!(dependency, "y");
            }
            other => panic!("expected UnresolvedDependency, got {other:?}"),
        }
    }

    #[test]
    fn unknown_reference_is_rejected_at_construction() {
        let stages = vec![(
            "x".to_string(),
            StageSchema::new("c").with_param("input", "@ghost"),
        )];
        assert!(matches!(
            Pipeline::new(stages),
            Err(KilnError::UnknownStage { .. })
        ));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let stages = vec![("x".to_string(), StageSchema::new("c").with_dependency("x"))];
        assert!(matches!(
            Pipeline::new(stages),
            Err(KilnError::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let stages = vec![
            ("x".to_string(), StageSchema::new("a")),
            ("x".to_string(), StageSchema::new("b")),
        ];
        assert!(matches!(
            Pipeline::new(stages),
            Err(KilnError::Validation { .. })
        ));
    }

    #[test]
    fn sub_pipeline_is_the_transitive_closure_in_declaration_order() {
        let stages = vec![
            ("a".to_string(), StageSchema::new("c")),
            ("b".to_string(), StageSchema::new("c").with_dependency("a")),
            ("c".to_string(), StageSchema::new("c").with_dependency("a")),
            (
                "d".to_string(),
                StageSchema::new("c")
                    .with_dependency("b")
                    .with_dependency("c"),
            ),
        ];
        let pipeline = Pipeline::new(stages).unwrap();

        let sub = pipeline.sub_pipeline("d").unwrap();
        let names: Vec<&str> = sub.stages().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(sub.dependencies(), &["b", "c"]);

        let sub_b = pipeline.sub_pipeline("b").unwrap();
        let names: Vec<&str> = sub_b.stages().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn sub_pipeline_of_unknown_stage_fails() {
        let pipeline = Pipeline::new(vec![("a".to_string(), StageSchema::new("c"))]).unwrap();
        assert!(matches!(
            pipeline.sub_pipeline("nope"),
            Err(KilnError::UnknownStage { .. })
        ));
    }

    #[test]
    fn yaml_mapping_order_is_declaration_order() {
        let yaml = r#"
prepare:
  component: dataset
train:
  component: trainer
  params:
    data: "@prepare"
evaluate:
  component: evaluator
  params:
    model: "@train.model"
"#;
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        let names: Vec<&str> = pipeline.stages().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["prepare", "train", "evaluate"]);
        assert_eq!(
            pipeline.immediate_dependencies("evaluate").unwrap(),
            vec!["train"]
        );
    }
}
