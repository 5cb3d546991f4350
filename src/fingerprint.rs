//! Content-addressed fingerprints for node computations
//!
//! A fingerprint is a SHA-256 digest over the interface identity and a
//! canonical serialization of the resolved inputs. File inputs contribute
//! their *content* digest, never their path or mtime, so cache hits survive
//! relocating the pipeline's base directory or moving between machines.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::schema::{FieldValue, ResolvedInputs};

/// Hex-encoded SHA-256 digest identifying one (interface, inputs) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint for one node computation
///
/// The serialization is canonical: `ResolvedInputs` is a BTreeMap so keys are
/// visited in sorted order, every value carries an explicit type tag, and
/// floats hash by bit pattern rather than display formatting.
pub fn fingerprint(
    interface_name: &str,
    interface_version: &str,
    inputs: &ResolvedInputs,
) -> Result<Fingerprint, EngineError> {
    let mut hasher = Sha256::new();
    hasher.update(b"interface:");
    hasher.update(interface_name.as_bytes());
    hasher.update(b"@");
    hasher.update(interface_version.as_bytes());

    for (name, value) in inputs {
        hasher.update(b"\x00field:");
        hasher.update(name.as_bytes());
        hash_value(&mut hasher, value)?;
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

fn hash_value(hasher: &mut Sha256, value: &FieldValue) -> Result<(), EngineError> {
    match value {
        FieldValue::Bool(b) => {
            hasher.update(b"\x01bool:");
            hasher.update([*b as u8]);
        }
        FieldValue::Int(i) => {
            hasher.update(b"\x01int:");
            hasher.update(i.to_be_bytes());
        }
        FieldValue::Float(x) => {
            hasher.update(b"\x01float:");
            hasher.update(x.to_bits().to_be_bytes());
        }
        FieldValue::Str(s) => {
            hasher.update(b"\x01str:");
            hasher.update(s.as_bytes());
        }
        FieldValue::File(path) => {
            hasher.update(b"\x01file:");
            hasher.update(digest_file(path)?.as_bytes());
        }
        FieldValue::List(items) => {
            hasher.update(b"\x01list:");
            hasher.update(items.len().to_be_bytes());
            for item in items {
                hash_value(hasher, item)?;
            }
        }
    }
    Ok(())
}

/// SHA-256 content digest of one file, streamed in 64 KiB chunks
pub fn digest_file(path: &Path) -> Result<String, EngineError> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        EngineError::Io(std::io::Error::new(
            e.kind(),
            format!("reading fingerprint input '{}': {}", path.display(), e),
        ))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn inputs(pairs: &[(&str, FieldValue)]) -> ResolvedInputs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn identical_inputs_identical_fingerprint() {
        let a = fingerprint("square", "0", &inputs(&[("x", FieldValue::Int(3))])).unwrap();
        let b = fingerprint("square", "0", &inputs(&[("x", FieldValue::Int(3))])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn changed_input_changes_fingerprint() {
        let a = fingerprint("square", "0", &inputs(&[("x", FieldValue::Int(3))])).unwrap();
        let b = fingerprint("square", "0", &inputs(&[("x", FieldValue::Int(4))])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn interface_identity_enters_fingerprint() {
        let ins = inputs(&[("x", FieldValue::Int(3))]);
        let a = fingerprint("square", "0", &ins).unwrap();
        let b = fingerprint("cube", "0", &ins).unwrap();
        let c = fingerprint("square", "1", &ins).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn type_tag_disambiguates_values() {
        // Int 1 and Bool true must not collide
        let a = fingerprint("f", "0", &inputs(&[("x", FieldValue::Int(1))])).unwrap();
        let b = fingerprint("f", "0", &inputs(&[("x", FieldValue::Bool(true))])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn file_inputs_hash_by_content_not_path() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.nii");
        let p2 = dir.path().join("moved").join("b.nii");
        std::fs::create_dir_all(p2.parent().unwrap()).unwrap();
        std::fs::write(&p1, b"voxels").unwrap();
        std::fs::write(&p2, b"voxels").unwrap();

        let a = fingerprint("f", "0", &inputs(&[("in", FieldValue::File(p1.clone()))])).unwrap();
        let b = fingerprint("f", "0", &inputs(&[("in", FieldValue::File(p2))])).unwrap();
        assert_eq!(a, b, "same content under different paths must collide");

        let mut f = std::fs::OpenOptions::new().append(true).open(&p1).unwrap();
        f.write_all(b"!").unwrap();
        drop(f);
        let c = fingerprint("f", "0", &inputs(&[("in", FieldValue::File(p1))])).unwrap();
        assert_ne!(a, c, "changed content must change the fingerprint");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = fingerprint(
            "f",
            "0",
            &inputs(&[("in", FieldValue::File("/nonexistent/t1.nii".into()))]),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
