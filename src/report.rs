use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ErrorKind;
use crate::pipeline::Diagnostic;
use crate::version::JavaVersion;

pub fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Downgraded,
    Unchanged,
    Failed,
    Copied,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub name: String,
    pub outcome: Outcome,
    pub input_sha256: String,
    pub output_sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<JavaVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl EntryReport {
    pub fn new(name: &str, outcome: Outcome, input: &[u8], output: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            input_sha256: hash_content(input),
            output_sha256: hash_content(output),
            class_name: None,
            version: None,
            error_kind: None,
            error: None,
            diagnostic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub input: String,
    pub output: String,
    pub target: JavaVersion,
    pub threads: usize,
    pub elapsed_ms: u128,
    pub downgraded: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub copied: usize,
    pub entries: Vec<EntryReport>,
}

impl RunReport {
    /// Fills in the per-outcome totals from `entries`.
    pub fn tally(&mut self) {
        let count = |o: Outcome| self.entries.iter().filter(|e| e.outcome == o).count();
        let (downgraded, unchanged, failed, copied) = (
            count(Outcome::Downgraded),
            count(Outcome::Unchanged),
            count(Outcome::Failed),
            count(Outcome::Copied),
        );
        self.downgraded = downgraded;
        self.unchanged = unchanged;
        self.failed = failed;
        self.copied = copied;
    }
}
