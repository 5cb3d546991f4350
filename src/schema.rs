//! Static I/O schemas and runtime values
//!
//! Interfaces declare their inputs and outputs as an explicit, typed schema
//! instead of runtime reflection. Connections are validated against these
//! declarations at connect() time so authoring errors fail fast.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Declared type of a schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    /// A reference to a file whose *content* (never its path) enters the
    /// cache fingerprint.
    FileRef,
    List(Box<FieldKind>),
    Enum(Vec<String>),
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Int => write!(f, "int"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Str => write!(f, "str"),
            FieldKind::FileRef => write!(f, "file"),
            FieldKind::List(inner) => write!(f, "list<{}>", inner),
            FieldKind::Enum(values) => write!(f, "enum({})", values.join("|")),
        }
    }
}

/// A concrete runtime value for a schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    File(PathBuf),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Check this value against a declared kind
    pub fn conforms_to(&self, kind: &FieldKind) -> bool {
        match (self, kind) {
            (FieldValue::Bool(_), FieldKind::Bool) => true,
            (FieldValue::Int(_), FieldKind::Int) => true,
            (FieldValue::Float(_), FieldKind::Float) => true,
            // Int literals are accepted where a float is declared
            (FieldValue::Int(_), FieldKind::Float) => true,
            (FieldValue::Str(_), FieldKind::Str) => true,
            (FieldValue::Str(s), FieldKind::Enum(values)) => values.iter().any(|v| v == s),
            (FieldValue::File(_), FieldKind::FileRef) => true,
            (FieldValue::List(items), FieldKind::List(inner)) => {
                items.iter().all(|item| item.conforms_to(inner))
            }
            _ => false,
        }
    }

    /// Render as a command-line argument
    pub fn to_arg(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(x) => x.to_string(),
            FieldValue::Str(s) => s.clone(),
            FieldValue::File(p) => p.display().to_string(),
            FieldValue::List(items) => items
                .iter()
                .map(|v| v.to_arg())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Per-field declaration: kind plus mandatory/default flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub mandatory: bool,
    pub default: Option<FieldValue>,
}

impl FieldSpec {
    pub fn mandatory(kind: FieldKind) -> Self {
        Self {
            kind,
            mandatory: true,
            default: None,
        }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self {
            kind,
            mandatory: false,
            default: None,
        }
    }

    pub fn with_default(kind: FieldKind, default: FieldValue) -> Self {
        Self {
            kind,
            mandatory: false,
            default: Some(default),
        }
    }
}

/// Ordered field name -> spec mapping for one side of an interface
///
/// BTreeMap keeps iteration order stable, which matters for canonical
/// fingerprint serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field registration
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn mandatory_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.mandatory)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Fully resolved input mapping handed to an interface run
pub type ResolvedInputs = BTreeMap<String, FieldValue>;

/// Output mapping produced by an interface run
pub type OutputMap = BTreeMap<String, FieldValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conformance_basic_kinds() {
        assert!(FieldValue::Bool(true).conforms_to(&FieldKind::Bool));
        assert!(FieldValue::Int(3).conforms_to(&FieldKind::Int));
        assert!(FieldValue::Int(3).conforms_to(&FieldKind::Float));
        assert!(!FieldValue::Float(3.0).conforms_to(&FieldKind::Int));
        assert!(FieldValue::Str("hi".into()).conforms_to(&FieldKind::Str));
        assert!(FieldValue::File("a.nii".into()).conforms_to(&FieldKind::FileRef));
        assert!(!FieldValue::Str("a.nii".into()).conforms_to(&FieldKind::FileRef));
    }

    #[test]
    fn conformance_enum_and_list() {
        let kind = FieldKind::Enum(vec!["NIFTI".into(), "NIFTI_GZ".into()]);
        assert!(FieldValue::Str("NIFTI".into()).conforms_to(&kind));
        assert!(!FieldValue::Str("ANALYZE".into()).conforms_to(&kind));

        let kind = FieldKind::List(Box::new(FieldKind::Int));
        assert!(FieldValue::List(vec![FieldValue::Int(1), FieldValue::Int(2)]).conforms_to(&kind));
        assert!(!FieldValue::List(vec![FieldValue::Str("x".into())]).conforms_to(&kind));
    }

    #[test]
    fn schema_builder_and_lookup() {
        let schema = Schema::new()
            .field("in_file", FieldSpec::mandatory(FieldKind::FileRef))
            .field(
                "sigma",
                FieldSpec::with_default(FieldKind::Float, FieldValue::Float(2.0)),
            );

        assert!(schema.contains("in_file"));
        assert!(!schema.contains("out_file"));
        assert_eq!(schema.mandatory_fields().collect::<Vec<_>>(), vec!["in_file"]);
        assert_eq!(
            schema.get("sigma").unwrap().default,
            Some(FieldValue::Float(2.0))
        );
    }

    #[test]
    fn field_value_to_arg() {
        assert_eq!(FieldValue::Int(7).to_arg(), "7");
        assert_eq!(FieldValue::Str("-v".into()).to_arg(), "-v");
        assert_eq!(FieldValue::File("sub/t1.nii".into()).to_arg(), "sub/t1.nii");
    }
}
