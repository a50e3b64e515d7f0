//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests.

use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test project context
///
/// Creates a temporary directory for test projects and provides
/// utilities for setting up test scenarios.
pub struct TestProject {
    /// Temporary directory for the test project
    pub dir: TempDir,
}

#[allow(dead_code)]
impl TestProject {
    /// Create a new test project in a temporary directory
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Get the path to the test project directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Create a file in the test project
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Check if a file exists in the test project
    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    /// Read a file from the test project
    pub fn read_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).expect("Failed to read file")
    }

    /// Run the plz binary in the project with no container runtime on `PATH`
    pub fn run_plz(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_plz"))
            .current_dir(self.path())
            .env("PATH", "")
            .env_remove("PLZ_MANIFEST")
            .env_remove("PLZ_SANDBOX")
            .args(args)
            .output()
            .expect("Failed to execute plz")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample project manifest for testing
#[allow(dead_code)]
pub const SAMPLE_MANIFEST: &str = r#"
[package]
name = "orders"
python = "3.9"
files = ["src"]
prefix = "lambda"

[python]
requirements = ["requirements.txt"]
freeze = true

[system]
requirements = "system.toml"

[archive]
ignore = ["tests"]
"#;

/// Sample system requirements document for testing
#[allow(dead_code)]
pub const SAMPLE_SYSTEM_REQUIREMENTS: &str = r#"
version = 1
filetypes = [".so"]
skip = ["bash"]

[packages]
libpng = []
postgresql-libs = ["/usr/lib64/libpq.so.5"]
"#;
