//! Process-wide execution context handed to every dispatched stage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Read-only bundle shared by all stages of one run.
///
/// Constructed once per run and never mutated afterwards; stages receive
/// clones of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    output_path: PathBuf,
    debug: bool,
}

impl Environment {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            debug: false,
        }
    }

    /// Enable debug mode: the substrate runs stages serially.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}
