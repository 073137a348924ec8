use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    CacheInfo, DatasetList, LoadResult, NormalizationCheck, OperationResult, SweepResult,
    UnloadResult,
};
use crate::error::{DromaError, ErrorCategory};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Pretty,
    Line,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub status: &'static str,
    pub category: &'static str,
    pub message: String,
}

impl From<&DromaError> for ErrorPayload {
    fn from(err: &DromaError) -> Self {
        let category = match err.category() {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::BridgeUnavailable => "bridge_unavailable",
            ErrorCategory::RuntimeFailure => "runtime_failure",
            ErrorCategory::EmptyData => "empty_data",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Internal => "internal",
        };
        Self {
            status: "error",
            category,
            message: err.to_string(),
        }
    }
}

pub struct JsonOutput {
    mode: OutputMode,
}

impl JsonOutput {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn print_load(&self, result: &LoadResult) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_unload(&self, result: &UnloadResult) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_datasets(&self, result: &DatasetList) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_operation(&self, result: &OperationResult) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_audit(&self, result: &NormalizationCheck) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_cache(&self, result: &CacheInfo) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_sweep(&self, result: &SweepResult) -> io::Result<()> {
        self.print_json(result)
    }

    pub fn print_error(&self, err: &DromaError) -> io::Result<()> {
        self.print_json(&ErrorPayload::from(err))
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let json = match self.mode {
            OutputMode::Pretty => serde_json::to_string_pretty(value),
            OutputMode::Line => serde_json::to_string(value),
        }
        .map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }
}
