//! Loading pipeline definitions.
//!
//! A definition is fetched as JSON, its step configs are templated with
//! `${var}` references, relative resource paths are anchored at the
//! definition's directory, and the result is validated against the
//! engine registry. Every failure is a `ConfigError` raised before any
//! side effect.

use super::definition::{validate_id, PipelineDefinition};
use crate::errors::{ConfigError, FlowgateError, Result};
use crate::registry::EngineRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, instrument};

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid template regex"));

/// A definition as stored, before templating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDefinition {
    /// JSON document.
    pub body: String,
    /// Directory relative resource paths are resolved against.
    pub base_dir: Option<PathBuf>,
}

/// Where pipeline definitions come from.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Fetches the definition of `pipeline_id` for `tenant_id`.
    async fn fetch(&self, tenant_id: &str, pipeline_id: &str) -> Result<RawDefinition>;
}

/// Reads `<root>/<tenant>/<pipeline>.json`, falling back to `<root>/<pipeline>.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Creates a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DefinitionSource for DirectorySource {
    async fn fetch(&self, tenant_id: &str, pipeline_id: &str) -> Result<RawDefinition> {
        validate_id(tenant_id, "tenant_id")?;
        validate_id(pipeline_id, "pipeline_id")?;

        let file = format!("{pipeline_id}.json");
        for dir in [self.root.join(tenant_id), self.root.clone()] {
            let path = dir.join(&file);
            match tokio::fs::read_to_string(&path).await {
                Ok(body) => {
                    debug!(path = %path.display(), "Loaded pipeline definition");
                    return Ok(RawDefinition {
                        body,
                        base_dir: Some(dir),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(FlowgateError::NotFound(format!(
            "pipeline '{pipeline_id}' under {}",
            self.root.display()
        )))
    }
}

/// Definitions held in memory, shared by every tenant.
#[derive(Debug, Default)]
pub struct MemorySource {
    definitions: RwLock<HashMap<String, String>>,
}

impl MemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a definition.
    pub fn insert(&self, definition: &PipelineDefinition) -> Result<()> {
        let body = serde_json::to_string(definition)?;
        self.insert_raw(&definition.pipeline_id, body);
        Ok(())
    }

    /// Stores a raw JSON document under `pipeline_id`.
    pub fn insert_raw(&self, pipeline_id: &str, body: impl Into<String>) {
        self.definitions.write().insert(pipeline_id.to_string(), body.into());
    }
}

#[async_trait]
impl DefinitionSource for MemorySource {
    async fn fetch(&self, _tenant_id: &str, pipeline_id: &str) -> Result<RawDefinition> {
        self.definitions
            .read()
            .get(pipeline_id)
            .map(|body| RawDefinition {
                body: body.clone(),
                base_dir: None,
            })
            .ok_or_else(|| FlowgateError::NotFound(format!("pipeline '{pipeline_id}'")))
    }
}

/// Replaces `${name}` references in every string of `value`.
///
/// A string that is exactly one reference takes the bound value with its
/// JSON type; otherwise references are spliced as text. All unbound
/// names are reported together.
pub fn substitute_templates(value: &mut Value, bindings: &HashMap<String, Value>) -> Result<()> {
    let mut missing = BTreeSet::new();
    substitute(value, bindings, &mut missing);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::new(format!(
            "undefined variable(s): {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        ))
        .with_field("variables")
        .into())
    }
}

fn substitute(value: &mut Value, bindings: &HashMap<String, Value>, missing: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            if let Some(replacement) = substitute_str(text, bindings, missing) {
                *value = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, bindings, missing);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, bindings, missing);
            }
        }
        _ => {}
    }
}

fn substitute_str(
    text: &str,
    bindings: &HashMap<String, Value>,
    missing: &mut BTreeSet<String>,
) -> Option<Value> {
    if !TEMPLATE_RE.is_match(text) {
        return None;
    }

    if let Some(caps) = TEMPLATE_RE.captures(text) {
        if caps[0].len() == text.len() {
            return match bindings.get(&caps[1]) {
                Some(bound) => Some(bound.clone()),
                None => {
                    missing.insert(caps[1].to_string());
                    None
                }
            };
        }
    }

    let replaced = TEMPLATE_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        match bindings.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.insert(caps[1].to_string());
                caps[0].to_string()
            }
        }
    });
    Some(Value::String(replaced.into_owned()))
}

/// Anchors relative `*_path` / `*_file` config values at `base_dir`.
pub fn resolve_resource_paths(definition: &mut PipelineDefinition, base_dir: &Path) {
    for step in &mut definition.steps {
        for (key, value) in step.config.iter_mut() {
            if !(key.ends_with("_path") || key.ends_with("_file")) {
                continue;
            }
            if let Value::String(path) = value {
                if Path::new(path.as_str()).is_relative() {
                    *path = base_dir.join(path.as_str()).to_string_lossy().into_owned();
                }
            }
        }
    }
}

/// Fetches, templates and validates definitions.
#[derive(Clone)]
pub struct PipelineLoader {
    source: Arc<dyn DefinitionSource>,
    registry: Arc<EngineRegistry>,
}

impl PipelineLoader {
    /// Creates a loader validating against `registry`.
    #[must_use]
    pub fn new(source: Arc<dyn DefinitionSource>, registry: Arc<EngineRegistry>) -> Self {
        Self { source, registry }
    }

    /// Loads `pipeline_id` for `tenant_id`.
    ///
    /// Templates see, in increasing precedence: the definition's
    /// variables, its default parameters, `parameters`, and the built-in
    /// `tenant_id` / `pipeline_id`.
    #[instrument(skip(self, parameters), fields(tenant_id = %tenant_id, pipeline_id = %pipeline_id))]
    pub async fn load(
        &self,
        pipeline_id: &str,
        tenant_id: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<PipelineDefinition> {
        let raw = self.source.fetch(tenant_id, pipeline_id).await?;
        let mut document: Value = serde_json::from_str(&raw.body).map_err(|e| {
            ConfigError::new(format!("malformed definition of '{pipeline_id}': {e}"))
        })?;

        let mut bindings = HashMap::new();
        for section in ["variables", "parameters"] {
            if let Some(Value::Object(map)) = document.get(section) {
                bindings.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        bindings.extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        bindings.insert("tenant_id".to_string(), Value::from(tenant_id));
        bindings.insert("pipeline_id".to_string(), Value::from(pipeline_id));

        if let Some(steps) = document.get_mut("steps") {
            substitute_templates(steps, &bindings)?;
        }

        let mut definition: PipelineDefinition = serde_json::from_value(document).map_err(|e| {
            ConfigError::new(format!("invalid definition of '{pipeline_id}': {e}"))
        })?;
        if definition.pipeline_id != pipeline_id {
            return Err(ConfigError::new(format!(
                "definition declares pipeline '{}' but '{pipeline_id}' was requested",
                definition.pipeline_id
            ))
            .with_field("pipeline_id")
            .into());
        }

        definition
            .parameters
            .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(base_dir) = raw.base_dir.as_deref() {
            resolve_resource_paths(&mut definition, base_dir);
        }
        definition.validate(&self.registry)?;

        debug!(steps = definition.steps.len(), "Pipeline definition loaded");
        Ok(definition)
    }
}

impl std::fmt::Debug for PipelineLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLoader")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::registry::{StepConfig, StepContext, StepEngine, StepResult};
    use serde_json::json;

    #[derive(Debug)]
    struct Nothing;

    #[async_trait]
    impl StepEngine for Nothing {
        async fn execute(&self, _config: &StepConfig, _ctx: &StepContext) -> StepResult {
            StepResult::success(0)
        }
    }

    fn registry() -> Arc<EngineRegistry> {
        let registry = EngineRegistry::new();
        registry.register("noop", Arc::new(Nothing));
        Arc::new(registry)
    }

    fn bindings(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_substitute_keeps_type_for_whole_reference() {
        let mut value = json!({"batch": "${size}", "label": "size=${size}"});
        substitute_templates(&mut value, &bindings(&[("size", json!(25))])).unwrap();
        assert_eq!(value, json!({"batch": 25, "label": "size=25"}));
    }

    #[test]
    fn test_substitute_nested_and_strings() {
        let mut value = json!({"tables": ["${ds}.raw", "${ds}.mart"], "n": 1});
        substitute_templates(&mut value, &bindings(&[("ds", json!("acme"))])).unwrap();
        assert_eq!(value, json!({"tables": ["acme.raw", "acme.mart"], "n": 1}));
    }

    #[test]
    fn test_substitute_reports_every_missing_name() {
        let mut value = json!(["${a}", "x ${b} ${a}"]);
        let err = substitute_templates(&mut value, &HashMap::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a, b"), "{message}");
    }

    #[test]
    fn test_resolve_relative_paths_only() {
        let mut def = PipelineDefinition::new(
            "p",
            vec![crate::pipeline::StepDefinition::new("s", "noop")
                .with_config("query_file", "sql/cost.sql")
                .with_config("schema_path", "/etc/schema.json")
                .with_config("name", "sql/not_a_path")],
        );
        resolve_resource_paths(&mut def, Path::new("/pipelines/acme"));

        let config = &def.steps[0].config;
        assert_eq!(config["query_file"], json!("/pipelines/acme/sql/cost.sql"));
        assert_eq!(config["schema_path"], json!("/etc/schema.json"));
        assert_eq!(config["name"], json!("sql/not_a_path"));
    }

    #[tokio::test]
    async fn test_load_from_memory_with_parameters() {
        let source = Arc::new(MemorySource::new());
        source.insert_raw(
            "daily_costs",
            json!({
                "pipeline_id": "daily_costs",
                "variables": {"dataset": "analytics", "region": "eu"},
                "steps": [
                    {"step_id": "ingest", "type": "noop", "config": {"table": "${dataset}.usage_${tenant_id}", "region": "${region}"}}
                ]
            })
            .to_string(),
        );
        let loader = PipelineLoader::new(source, registry());

        let params = bindings(&[("region", json!("us"))]);
        let def = loader.load("daily_costs", "acme", &params).await.unwrap();

        assert_eq!(def.steps[0].config["table"], json!("analytics.usage_acme"));
        assert_eq!(def.steps[0].config["region"], json!("us"));
        assert_eq!(def.parameters["region"], json!("us"));
    }

    #[tokio::test]
    async fn test_load_malformed_json_is_config_error() {
        let source = Arc::new(MemorySource::new());
        source.insert_raw("broken", "{ not json");
        let err = PipelineLoader::new(source, registry())
            .load("broken", "acme", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_load_unknown_step_type_is_config_error() {
        let source = Arc::new(MemorySource::new());
        source.insert_raw(
            "p",
            json!({"pipeline_id": "p", "steps": [{"step_id": "a", "type": "magic"}]}).to_string(),
        );
        let err = PipelineLoader::new(source, registry())
            .load("p", "acme", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("magic"));
    }

    #[tokio::test]
    async fn test_load_mismatched_id_rejected() {
        let source = Arc::new(MemorySource::new());
        source.insert_raw(
            "p",
            json!({"pipeline_id": "q", "steps": [{"step_id": "a", "type": "noop"}]}).to_string(),
        );
        let err = PipelineLoader::new(source, registry())
            .load("p", "acme", &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_directory_source_prefers_tenant_dir() {
        let dir = tempfile::tempdir().unwrap();
        let shared = json!({"pipeline_id": "p", "steps": [{"step_id": "shared", "type": "noop", "config": {"query_file": "q.sql"}}]});
        let tenant = json!({"pipeline_id": "p", "steps": [{"step_id": "custom", "type": "noop", "config": {"query_file": "q.sql"}}]});
        std::fs::write(dir.path().join("p.json"), shared.to_string()).unwrap();
        std::fs::create_dir(dir.path().join("acme")).unwrap();
        std::fs::write(dir.path().join("acme").join("p.json"), tenant.to_string()).unwrap();

        let loader = PipelineLoader::new(Arc::new(DirectorySource::new(dir.path())), registry());

        let acme = loader.load("p", "acme", &HashMap::new()).await.unwrap();
        assert_eq!(acme.steps[0].step_id, "custom");
        let expected = dir.path().join("acme").join("q.sql");
        assert_eq!(acme.steps[0].config["query_file"], json!(expected.to_string_lossy()));

        let other = loader.load("p", "globex", &HashMap::new()).await.unwrap();
        assert_eq!(other.steps[0].step_id, "shared");
    }

    #[tokio::test]
    async fn test_directory_source_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path());

        let err = source.fetch("acme", "../secrets").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = source.fetch("acme", "missing").await.unwrap_err();
        assert!(matches!(err, FlowgateError::NotFound(_)));
    }
}
