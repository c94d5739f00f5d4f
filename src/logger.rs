use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use log::warn;

/// Scalar sink for training curves: one (key, value, step) triple per call.
pub trait ScalarLogger {
    fn log_scalar(&mut self, key: &str, value: f64, step: usize);
}

/// Appends one JSON object per scalar to a line-delimited file.
pub struct JsonlLogger {
    out: BufWriter<File>,
}

impl JsonlLogger {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create scalar log {}", path.display()))?;

        Ok(Self {
            out: BufWriter::new(file),
        })
    }
}

impl ScalarLogger for JsonlLogger {
    fn log_scalar(&mut self, key: &str, value: f64, step: usize) {
        let line = serde_json::json!({ "key": key, "value": value, "step": step });
        if let Err(e) = writeln!(self.out, "{line}") {
            warn!("scalar log write failed: {e}");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalarRecord {
    pub key: String,
    pub value: f64,
    pub step: usize,
}

/// In-memory sink; clones share the same record list.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
}

impl MemoryLogger {
    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.lock().expect("scalar record lock").clone()
    }
}

impl ScalarLogger for MemoryLogger {
    fn log_scalar(&mut self, key: &str, value: f64, step: usize) {
        self.records.lock().expect("scalar record lock").push(ScalarRecord {
            key: key.to_string(),
            value,
            step,
        });
    }
}
