//! Interface contract: the unit of work wrapped by a graph node
//!
//! An interface declares a typed input/output schema and a blocking `run`.
//! The engine never looks past this contract plus a stable identity
//! (name + version) used in cache fingerprints. Two implementations ship
//! with the engine: `CommandInterface` (external tool wrapper) and
//! `FnInterface` (in-process closure, the test workhorse).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[allow(unused_imports)]
use crate::schema::{FieldKind, FieldValue, OutputMap, ResolvedInputs, Schema};

/// Per-run execution context handed to an interface
///
/// The working directory is exclusively owned by the running node; interfaces
/// are free to write anything under it.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub work_dir: PathBuf,
}

/// Successful interface run: outputs plus captured process streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceOutput {
    pub outputs: OutputMap,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
}

impl InterfaceOutput {
    pub fn from_outputs(outputs: OutputMap) -> Self {
        Self {
            outputs,
            stdout: String::new(),
            stderr: String::new(),
            exit_status: Some(0),
        }
    }
}

/// Failure raised by an interface run
///
/// Carries enough context (streams, exit status) for the crash record to be
/// useful offline.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct InterfaceFailure {
    pub message: String,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl InterfaceFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_status: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// The unit-of-work contract consumed by the engine
///
/// `run` is blocking by design: interfaces typically wait on an external
/// process. Schedulers call it through `spawn_blocking` so the scheduling
/// loop itself never blocks on one node.
pub trait Interface: Send + Sync {
    /// Stable identity, part of the cache fingerprint
    fn name(&self) -> &str;

    /// Version string, part of the cache fingerprint
    fn version(&self) -> &str {
        "0"
    }

    fn input_schema(&self) -> &Schema;

    fn output_schema(&self) -> &Schema;

    fn run(&self, inputs: &ResolvedInputs, ctx: &RunContext)
        -> Result<InterfaceOutput, InterfaceFailure>;

    /// Batch-queue surface, if this interface can be expressed as a plain
    /// command line (see `plugin::batch`). Default: not batchable.
    fn as_batch(&self) -> Option<&dyn BatchInterface> {
        None
    }
}

impl std::fmt::Debug for dyn Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name())
            .field("version", &self.version())
            .finish()
    }
}

/// Extra surface for interfaces a batch queue can submit as a job script
pub trait BatchInterface: Send + Sync {
    /// Format the full argv (executable first) for the resolved inputs
    fn command_line(&self, inputs: &ResolvedInputs) -> Result<Vec<String>, InterfaceFailure>;

    /// Map declared outputs to values after the job finished in `work_dir`
    fn collect_outputs(
        &self,
        inputs: &ResolvedInputs,
        work_dir: &Path,
        stdout: &str,
    ) -> Result<OutputMap, InterfaceFailure>;
}

// ============================================================================
// COMMAND INTERFACE
// ============================================================================

/// One element of a command line template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArgSpec {
    /// Emitted verbatim
    Literal(String),
    /// Substituted from a resolved input field, optionally preceded by a flag
    Input {
        field: String,
        flag: Option<String>,
    },
}

impl ArgSpec {
    pub fn input(field: impl Into<String>) -> Self {
        ArgSpec::Input {
            field: field.into(),
            flag: None,
        }
    }

    pub fn flagged(flag: impl Into<String>, field: impl Into<String>) -> Self {
        ArgSpec::Input {
            field: field.into(),
            flag: Some(flag.into()),
        }
    }
}

/// Wraps an external command-line tool as an interface
///
/// Output fields of kind `FileRef` map to files the tool writes into the
/// working directory; one `Str` output may be wired to captured stdout.
pub struct CommandInterface {
    name: String,
    version: String,
    executable: String,
    args: Vec<ArgSpec>,
    input_schema: Schema,
    output_schema: Schema,
    /// output field -> file name produced under the working directory
    output_files: Vec<(String, String)>,
    /// output field that receives trimmed stdout, if declared
    stdout_output: Option<String>,
}

impl CommandInterface {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        args: Vec<ArgSpec>,
        input_schema: Schema,
        output_schema: Schema,
    ) -> Self {
        Self {
            name: name.into(),
            version: "0".to_string(),
            executable: executable.into(),
            args,
            input_schema,
            output_schema,
            output_files: Vec::new(),
            stdout_output: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Declare that `field` is produced as `file_name` under the workdir
    pub fn output_file(mut self, field: impl Into<String>, file_name: impl Into<String>) -> Self {
        self.output_files.push((field.into(), file_name.into()));
        self
    }

    /// Declare that `field` receives the tool's trimmed stdout
    pub fn stdout_into(mut self, field: impl Into<String>) -> Self {
        self.stdout_output = Some(field.into());
        self
    }
}

impl BatchInterface for CommandInterface {
    fn command_line(&self, inputs: &ResolvedInputs) -> Result<Vec<String>, InterfaceFailure> {
        let mut argv = vec![self.executable.clone()];
        for arg in &self.args {
            match arg {
                ArgSpec::Literal(s) => argv.push(s.clone()),
                ArgSpec::Input { field, flag } => {
                    let value = match inputs.get(field) {
                        Some(v) => v,
                        // Optional inputs without a value drop the whole arg
                        None => continue,
                    };
                    if let Some(flag) = flag {
                        argv.push(flag.clone());
                    }
                    argv.push(value.to_arg());
                }
            }
        }
        Ok(argv)
    }

    fn collect_outputs(
        &self,
        _inputs: &ResolvedInputs,
        work_dir: &Path,
        stdout: &str,
    ) -> Result<OutputMap, InterfaceFailure> {
        let mut outputs = OutputMap::new();
        for (field, file_name) in &self.output_files {
            let path = work_dir.join(file_name);
            if !path.exists() {
                return Err(InterfaceFailure::new(format!(
                    "declared output file '{}' was not produced",
                    file_name
                )));
            }
            outputs.insert(field.clone(), FieldValue::File(path));
        }
        if let Some(field) = &self.stdout_output {
            outputs.insert(field.clone(), FieldValue::Str(stdout.trim().to_string()));
        }
        Ok(outputs)
    }
}

impl Interface for CommandInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn as_batch(&self) -> Option<&dyn BatchInterface> {
        Some(self)
    }

    fn run(
        &self,
        inputs: &ResolvedInputs,
        ctx: &RunContext,
    ) -> Result<InterfaceOutput, InterfaceFailure> {
        let argv = self.command_line(inputs)?;
        debug!(cmd = %argv.join(" "), "spawning external tool");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&ctx.work_dir)
            .output()
            .map_err(|e| {
                InterfaceFailure::new(format!("failed to spawn '{}': {}", argv[0], e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code();

        if !output.status.success() {
            return Err(InterfaceFailure {
                message: format!(
                    "'{}' exited with status {}",
                    argv[0],
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
                ),
                exit_status: code,
                stdout,
                stderr,
            });
        }

        let outputs = self.collect_outputs(inputs, &ctx.work_dir, &stdout)?;
        Ok(InterfaceOutput {
            outputs,
            stdout,
            stderr,
            exit_status: code,
        })
    }
}

// ============================================================================
// FN INTERFACE
// ============================================================================

type NodeFn = dyn Fn(&ResolvedInputs) -> Result<OutputMap, InterfaceFailure> + Send + Sync;

/// Wraps a plain closure as an interface
///
/// Keeps an invocation counter so cache-correctness tests can assert exactly
/// how many times the computation actually ran.
pub struct FnInterface {
    name: String,
    input_schema: Schema,
    output_schema: Schema,
    func: Arc<NodeFn>,
    calls: Arc<AtomicUsize>,
}

impl FnInterface {
    pub fn new<F>(
        name: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
        func: F,
    ) -> Self
    where
        F: Fn(&ResolvedInputs) -> Result<OutputMap, InterfaceFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input_schema,
            output_schema,
            func: Arc::new(func),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle onto the invocation counter (clone before boxing)
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Interface for FnInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    fn run(
        &self,
        inputs: &ResolvedInputs,
        _ctx: &RunContext,
    ) -> Result<InterfaceOutput, InterfaceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outputs = (self.func)(inputs)?;
        Ok(InterfaceOutput::from_outputs(outputs))
    }
}
