//! YAML pipeline definitions
//!
//! Declarative front door for command-line pipelines: each node wraps one
//! external tool as a [`CommandInterface`], edges wire output fields to
//! input fields, and everything is validated through the same `Workflow`
//! construction path the programmatic API uses.
//!
//! ```yaml
//! pipeline: axonflow/pipeline@0.1
//! name: preproc
//! nodes:
//!   - id: bet
//!     run: bet
//!     args: ["$in_file", "brain.nii", "-f $frac"]
//!     takes:
//!       in_file: file
//!       frac: { kind: float, default: 0.5 }
//!     produces:
//!       brain: brain.nii
//! edges:
//!   - from: bet.brain
//!     to: fast.in_file
//! ```
//!
//! The file format covers scalar and file fields; list and enum fields stay
//! API-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::EngineError;
use crate::interface::{ArgSpec, CommandInterface};
use crate::node::Node;
use crate::schema::{FieldKind, FieldSpec, FieldValue, Schema};
use crate::workflow::Workflow;

const SCHEMA_TAG: &str = "axonflow/pipeline@0.1";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    /// Format marker, must be `axonflow/pipeline@0.1`
    pub pipeline: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
    pub id: String,
    /// Executable to invoke
    pub run: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Command line template; `$field` substitutes an input, `-f $field`
    /// emits flag and value together (both dropped when the input is unset)
    #[serde(default)]
    pub args: Vec<String>,
    /// Input fields: `name: kind` or `name: {kind, default, optional}`
    #[serde(default)]
    pub takes: BTreeMap<String, FieldDef>,
    /// Output fields mapped to file names the tool writes in its workdir
    #[serde(default)]
    pub produces: BTreeMap<String, String>,
    /// Output field that receives the tool's trimmed stdout
    #[serde(default)]
    pub stdout: Option<String>,
    /// Literal input values bound at load time
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldDef {
    Kind(String),
    Full {
        kind: String,
        #[serde(default)]
        default: Option<serde_yaml::Value>,
        #[serde(default)]
        optional: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDef {
    /// `node.field` on the producing side
    pub from: String,
    /// `node.field` on the consuming side
    pub to: String,
}

/// Load a pipeline file and build the workflow it describes
pub fn load(path: &Path) -> Result<Workflow, EngineError> {
    let text = std::fs::read_to_string(path)?;
    let file: PipelineFile = serde_yaml::from_str(&text)?;
    debug!(path = %path.display(), name = %file.name, "loaded pipeline file");
    build(file)
}

/// Build a workflow from an already-parsed pipeline file
pub fn build(file: PipelineFile) -> Result<Workflow, EngineError> {
    if file.pipeline != SCHEMA_TAG {
        return Err(EngineError::PipelineFile(format!(
            "unsupported pipeline format '{}', expected '{}'",
            file.pipeline, SCHEMA_TAG
        )));
    }

    let mut workflow = Workflow::new(file.name);

    for def in file.nodes {
        let mut input_schema = Schema::new();
        let mut kinds: BTreeMap<String, FieldKind> = BTreeMap::new();
        for (field, fdef) in &def.takes {
            let (kind_name, default, optional) = match fdef {
                FieldDef::Kind(kind) => (kind.as_str(), None, false),
                FieldDef::Full {
                    kind,
                    default,
                    optional,
                } => (kind.as_str(), default.as_ref(), *optional),
            };
            let kind = parse_kind(kind_name, &def.id, field)?;
            let spec = match default {
                Some(value) => {
                    let value = yaml_literal(&kind, value, &def.id, field)?;
                    FieldSpec::with_default(kind.clone(), value)
                }
                None if optional => FieldSpec::optional(kind.clone()),
                None => FieldSpec::mandatory(kind.clone()),
            };
            kinds.insert(field.clone(), kind);
            input_schema = input_schema.field(field, spec);
        }

        let mut output_schema = Schema::new();
        for field in def.produces.keys() {
            output_schema = output_schema.field(field, FieldSpec::mandatory(FieldKind::FileRef));
        }
        if let Some(field) = &def.stdout {
            output_schema = output_schema.field(field, FieldSpec::mandatory(FieldKind::Str));
        }

        let args = def.args.iter().map(|a| parse_arg(a)).collect();
        let mut iface =
            CommandInterface::new(&def.id, &def.run, args, input_schema, output_schema);
        if let Some(version) = &def.version {
            iface = iface.with_version(version);
        }
        for (field, file_name) in &def.produces {
            iface = iface.output_file(field, file_name);
        }
        if let Some(field) = &def.stdout {
            iface = iface.stdout_into(field);
        }

        let mut node = Node::new(&def.id, Arc::new(iface)).with_retries(def.retries);
        for (field, value) in &def.inputs {
            let kind = kinds.get(field).ok_or_else(|| {
                EngineError::PipelineFile(format!(
                    "node '{}' binds undeclared input '{}'",
                    def.id, field
                ))
            })?;
            let value = yaml_literal(kind, value, &def.id, field)?;
            node.set_input(field, value)?;
        }
        workflow.add_node(node)?;
    }

    for edge in &file.edges {
        let (src, src_field) = split_endpoint(&edge.from)?;
        let (dst, dst_field) = split_endpoint(&edge.to)?;
        workflow.connect(src, src_field, dst, dst_field)?;
    }

    Ok(workflow)
}

fn split_endpoint(endpoint: &str) -> Result<(&str, &str), EngineError> {
    endpoint.split_once('.').ok_or_else(|| {
        EngineError::PipelineFile(format!(
            "edge endpoint '{}' must be 'node.field'",
            endpoint
        ))
    })
}

fn parse_kind(name: &str, node: &str, field: &str) -> Result<FieldKind, EngineError> {
    match name {
        "bool" => Ok(FieldKind::Bool),
        "int" => Ok(FieldKind::Int),
        "float" => Ok(FieldKind::Float),
        "str" => Ok(FieldKind::Str),
        "file" => Ok(FieldKind::FileRef),
        other => Err(EngineError::PipelineFile(format!(
            "node '{}' field '{}' has unknown kind '{}'",
            node, field, other
        ))),
    }
}

/// Convert a YAML scalar to a typed field value under the declared kind
fn yaml_literal(
    kind: &FieldKind,
    value: &serde_yaml::Value,
    node: &str,
    field: &str,
) -> Result<FieldValue, EngineError> {
    use serde_yaml::Value;

    let mismatch = || {
        EngineError::PipelineFile(format!(
            "node '{}' field '{}': value does not fit declared kind '{}'",
            node, field, kind
        ))
    };

    match (kind, value) {
        (FieldKind::Bool, Value::Bool(b)) => Ok(FieldValue::Bool(*b)),
        (FieldKind::Int, Value::Number(n)) => n.as_i64().map(FieldValue::Int).ok_or_else(mismatch),
        (FieldKind::Float, Value::Number(n)) => {
            n.as_f64().map(FieldValue::Float).ok_or_else(mismatch)
        }
        (FieldKind::Str, Value::String(s)) => Ok(FieldValue::Str(s.clone())),
        (FieldKind::FileRef, Value::String(s)) => Ok(FieldValue::File(PathBuf::from(s))),
        _ => Err(mismatch()),
    }
}

/// `$field` -> substituted input, `-f $field` -> flagged input, else literal
fn parse_arg(arg: &str) -> ArgSpec {
    if let Some(field) = arg.strip_prefix('$') {
        return ArgSpec::input(field);
    }
    if let Some((flag, rest)) = arg.split_once(" $") {
        if !flag.is_empty() && !rest.is_empty() && !rest.contains(' ') {
            return ArgSpec::flagged(flag, rest);
        }
    }
    ArgSpec::Literal(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Workflow, EngineError> {
        let file: PipelineFile = serde_yaml::from_str(text).unwrap();
        build(file)
    }

    #[test]
    fn minimal_pipeline_builds() {
        let wf = parse(
            r#"
pipeline: axonflow/pipeline@0.1
name: hello
nodes:
  - id: greet
    run: echo
    args: ["$text"]
    takes:
      text: str
    stdout: greeting
    inputs:
      text: hello
"#,
        )
        .unwrap();

        let node = wf.node("greet").unwrap();
        assert_eq!(node.interface().name(), "greet");
        assert!(node.bindings().contains_key("text"));
    }

    #[test]
    fn edges_are_wired_and_validated() {
        let err = parse(
            r#"
pipeline: axonflow/pipeline@0.1
name: broken
nodes:
  - id: a
    run: echo
    stdout: text
  - id: b
    run: cat
    takes:
      in_file: file
edges:
  - from: a.nope
    to: b.in_file
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::UnknownField { .. }));
    }

    #[test]
    fn wrong_schema_tag_is_rejected() {
        let err = parse("pipeline: axonflow/pipeline@9.9\nname: x\n").unwrap_err();
        assert!(matches!(err, EngineError::PipelineFile(_)));
    }

    #[test]
    fn literal_must_fit_declared_kind() {
        let err = parse(
            r#"
pipeline: axonflow/pipeline@0.1
name: typed
nodes:
  - id: a
    run: echo
    takes:
      count: int
    inputs:
      count: three
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PipelineFile(_)));
    }

    #[test]
    fn undeclared_literal_input_is_rejected() {
        let err = parse(
            r#"
pipeline: axonflow/pipeline@0.1
name: typed
nodes:
  - id: a
    run: echo
    inputs:
      ghost: 1
"#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PipelineFile(_)));
    }

    #[test]
    fn arg_template_forms() {
        assert!(matches!(parse_arg("$in_file"), ArgSpec::Input { flag: None, .. }));
        assert!(matches!(
            parse_arg("-f $frac"),
            ArgSpec::Input { flag: Some(_), .. }
        ));
        assert!(matches!(parse_arg("brain.nii"), ArgSpec::Literal(_)));
        assert!(matches!(parse_arg("a $b c"), ArgSpec::Literal(_)));
    }

    #[test]
    fn defaults_and_optional_fields() {
        let wf = parse(
            r#"
pipeline: axonflow/pipeline@0.1
name: smooth
nodes:
  - id: smooth
    run: fslmaths
    args: ["$in_file", "-s $sigma"]
    takes:
      in_file: file
      sigma: { kind: float, default: 2.0 }
      mask: { kind: file, optional: true }
"#,
        )
        .unwrap();

        let schema = wf.node("smooth").unwrap().interface().input_schema().clone();
        let sigma = schema.get("sigma").unwrap();
        assert_eq!(sigma.default, Some(FieldValue::Float(2.0)));
        let mask = schema.get("mask").unwrap();
        assert!(!mask.mandatory);
    }
}
