use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::artifact::{Artifact, Table};
use crate::domain::{DataType, DatasetId, DatasetKind, MolecularType, Operation, RuntimeRef};
use crate::error::DromaError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("no runtime attached")]
    Unavailable,
    #[error("{0}")]
    Failure(String),
}

impl BridgeError {
    pub fn annotate(self, context: impl Into<String>) -> DromaError {
        match self {
            BridgeError::Unavailable => DromaError::BridgeUnavailable,
            BridgeError::Failure(message) => DromaError::RuntimeFailure {
                context: context.into(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub molecular_type: Option<MolecularType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drugs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap_only: Option<bool>,
    pub data_type: DataType,
    pub tumor_type: String,
    pub zscore: bool,
}

/// Contract the broker requires from the external statistical runtime.
///
/// Every call takes `&mut self`: the runtime accepts one in-flight call per
/// process, and holding the bridge mutably is how callers prove they own
/// that slot.
pub trait RuntimeBridge: Send {
    type Raw;

    fn materialize(
        &mut self,
        kind: DatasetKind,
        id: &DatasetId,
        source: &Utf8Path,
    ) -> Result<RuntimeRef, BridgeError>;

    fn release(&mut self, runtime_ref: &RuntimeRef) -> Result<(), BridgeError>;

    fn invoke(
        &mut self,
        operation: Operation,
        runtime_ref: &RuntimeRef,
        params: &OperationParams,
    ) -> Result<Self::Raw, BridgeError>;

    fn to_canonical(&self, raw: Self::Raw) -> Artifact;
}

const MATERIALIZE_SCRIPT: &str = r#"
args <- commandArgs(trailingOnly = TRUE)
suppressPackageStartupMessages({
  library(DROMA.Set)
  library(DROMA.R)
})
kind <- args[[1]]
db_path <- args[[2]]
out_path <- args[[3]]
projects <- args[4:length(args)]
obj <- if (kind == "single") {
  createDromaSetFromDatabase(projects[[1]], db_path)
} else {
  createMultiDromaSetFromDatabase(projects, db_path)
}
saveRDS(obj, out_path)
"#;

const INVOKE_SCRIPT: &str = r#"
args <- commandArgs(trailingOnly = TRUE)
suppressPackageStartupMessages({
  library(DROMA.Set)
  library(DROMA.R)
  library(jsonlite)
})
obj <- readRDS(args[[1]])
request <- fromJSON(args[[2]], simplifyVector = TRUE)
fn <- get(request$fn, mode = "function")
result <- do.call(fn, c(list(obj), request$args))
encode_table <- function(x) {
  m <- as.matrix(x)
  if (!(is.numeric(m) || is.logical(m))) {
    return(list(kind = "opaque", description = paste("non-numeric", class(x)[[1]])))
  }
  rows <- rownames(m)
  if (is.null(rows)) rows <- as.character(seq_len(nrow(m)))
  cols <- colnames(m)
  if (is.null(cols)) cols <- as.character(seq_len(ncol(m)))
  list(
    kind = "table",
    features = I(rows),
    samples = I(cols),
    values = lapply(seq_len(nrow(m)), function(i) I(unname(as.numeric(m[i, ]))))
  )
}
encode <- function(x) {
  if (is.matrix(x) || is.data.frame(x)) {
    encode_table(x)
  } else if (is.list(x) && !is.null(names(x))) {
    list(kind = "projects", tables = lapply(x, encode))
  } else {
    list(kind = "opaque", description = paste(class(x), collapse = "/"))
  }
}
cat(toJSON(encode(result), na = "null", digits = NA, auto_unbox = TRUE))
"#;

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    #[serde(rename = "fn")]
    function: &'static str,
    args: &'a OperationParams,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WireResult {
    Table {
        features: Vec<String>,
        samples: Vec<String>,
        values: Vec<Vec<Option<f64>>>,
    },
    Projects {
        tables: BTreeMap<String, Value>,
    },
    Opaque {
        description: String,
    },
}

#[derive(Debug, Clone)]
pub struct RscriptBridge {
    rscript: Option<PathBuf>,
    r_libs: Option<String>,
    workspace: Utf8PathBuf,
    sequence: u64,
}

impl RscriptBridge {
    pub fn new(rscript: Option<PathBuf>, r_libs: Option<String>, workspace: Utf8PathBuf) -> Self {
        Self {
            rscript: rscript.or_else(|| find_in_path("Rscript")),
            r_libs,
            workspace,
            sequence: 0,
        }
    }

    pub fn rscript(&self) -> Option<&Path> {
        self.rscript.as_deref()
    }

    pub fn workspace(&self) -> &Utf8Path {
        &self.workspace
    }

    pub fn runtime_version(&self) -> Option<String> {
        let rscript = self.rscript.as_ref()?;
        let output = Command::new(rscript).arg("--version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        // Rscript prints its version banner on stderr.
        let banner = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        let text = String::from_utf8_lossy(&banner).trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    fn require_rscript(&self) -> Result<&PathBuf, BridgeError> {
        self.rscript.as_ref().ok_or(BridgeError::Unavailable)
    }

    fn run_script(&self, script: &str, args: &[String]) -> Result<Vec<u8>, BridgeError> {
        let rscript = self.require_rscript()?;
        let mut cmd = Command::new(rscript);
        cmd.arg("-e").arg(script).args(args);
        if let Some(r_libs) = &self.r_libs {
            cmd.env("R_LIBS", r_libs);
        }
        let output = cmd
            .output()
            .map_err(|err| BridgeError::Failure(err.to_string()))?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", rscript.display())
        } else {
            stderr
        };
        Err(BridgeError::Failure(message))
    }

    fn next_object_path(&mut self, id: &DatasetId) -> Utf8PathBuf {
        self.sequence += 1;
        let stem = id.as_str().replace(',', "_");
        self.workspace.join(format!(
            "{stem}-{}-{}.rds",
            std::process::id(),
            self.sequence
        ))
    }
}

impl RuntimeBridge for RscriptBridge {
    type Raw = Value;

    fn materialize(
        &mut self,
        kind: DatasetKind,
        id: &DatasetId,
        source: &Utf8Path,
    ) -> Result<RuntimeRef, BridgeError> {
        self.require_rscript()?;
        fs::create_dir_all(self.workspace.as_std_path())
            .map_err(|err| BridgeError::Failure(err.to_string()))?;
        let object_path = self.next_object_path(id);
        let mut args = vec![
            kind.to_string(),
            source.to_string(),
            object_path.to_string(),
        ];
        args.extend(id.projects().into_iter().map(str::to_string));
        debug!(dataset = %id, %kind, path = %object_path, "materializing dataset");
        self.run_script(MATERIALIZE_SCRIPT, &args)?;
        if !object_path.as_std_path().exists() {
            return Err(BridgeError::Failure(format!(
                "runtime did not produce {object_path}"
            )));
        }
        Ok(RuntimeRef::new(object_path.into_string()))
    }

    fn release(&mut self, runtime_ref: &RuntimeRef) -> Result<(), BridgeError> {
        let path = Path::new(runtime_ref.as_str());
        if !path.starts_with(self.workspace.as_std_path()) {
            return Err(BridgeError::Failure(format!(
                "runtime ref outside workspace: {runtime_ref}"
            )));
        }
        fs::remove_file(path).map_err(|err| BridgeError::Failure(err.to_string()))
    }

    fn invoke(
        &mut self,
        operation: Operation,
        runtime_ref: &RuntimeRef,
        params: &OperationParams,
    ) -> Result<Value, BridgeError> {
        let request = InvokeRequest {
            function: operation.runtime_function(),
            args: params,
        };
        let payload =
            serde_json::to_vec(&request).map_err(|err| BridgeError::Failure(err.to_string()))?;
        let mut params_file = tempfile::Builder::new()
            .prefix("droma-params")
            .suffix(".json")
            .tempfile_in(self.workspace.as_std_path())
            .map_err(|err| BridgeError::Failure(err.to_string()))?;
        params_file
            .write_all(&payload)
            .map_err(|err| BridgeError::Failure(err.to_string()))?;

        let args = vec![
            runtime_ref.as_str().to_string(),
            params_file.path().to_string_lossy().to_string(),
        ];
        debug!(%operation, runtime_ref = %runtime_ref, "invoking runtime function");
        let stdout = self.run_script(INVOKE_SCRIPT, &args)?;
        serde_json::from_slice(&stdout)
            .map_err(|err| BridgeError::Failure(format!("unreadable runtime output: {err}")))
    }

    fn to_canonical(&self, raw: Value) -> Artifact {
        canonical_from_json(raw)
    }
}

pub fn canonical_from_json(raw: Value) -> Artifact {
    let wire: WireResult = match serde_json::from_value(raw) {
        Ok(wire) => wire,
        Err(err) => {
            return Artifact::Opaque {
                description: format!("unrecognized runtime result: {err}"),
            };
        }
    };
    match wire {
        WireResult::Table {
            features,
            samples,
            values,
        } => match Table::from_rows(features, samples, values) {
            Ok(table) => Artifact::Table(table),
            Err(description) => Artifact::Opaque { description },
        },
        WireResult::Projects { tables } => {
            let mut projects = BTreeMap::new();
            for (project, value) in tables {
                match canonical_from_json(value) {
                    Artifact::Table(table) => {
                        projects.insert(project, table);
                    }
                    _ => {
                        return Artifact::Opaque {
                            description: format!("project {project} is not a table"),
                        };
                    }
                }
            }
            Artifact::Projects(projects)
        }
        WireResult::Opaque { description } => Artifact::Opaque { description },
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
