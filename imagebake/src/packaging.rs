//! Installer payload packaging.
//!
//! The installer scripts import each other through the package paths they
//! have in the source tree. On the instance they are delivered as loose
//! metadata files, so imports must be flattened before upload.

use imagebake_shared::{BakeError, BakeResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// A script to ship, identified by its metadata key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    pub key: String,
    pub source: PathBuf,
}

impl ScriptRef {
    pub fn new(key: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
        }
    }
}

/// How modules resolve on the target machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionEnvironment {
    /// Module path rewrites, `(from, to)`, applied in order.
    pub module_rewrites: Vec<(String, String)>,
}

impl ExecutionEnvironment {
    /// Environment where scripts run unmodified.
    pub fn verbatim() -> Self {
        Self::default()
    }

    pub fn flattened(rewrites: &[(String, String)]) -> Self {
        Self {
            module_rewrites: rewrites.to_vec(),
        }
    }
}

/// A self-contained script ready to attach as instance metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: String,
    pub contents: String,
}

impl Payload {
    /// Write to a temp file that is removed when the returned path drops.
    pub fn stage(&self) -> BakeResult<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("imagebake-{}-", self.key))
            .tempfile()
            .map_err(|e| {
                BakeError::Storage(format!("Failed to create payload file for {}: {}", self.key, e))
            })?;
        file.write_all(self.contents.as_bytes()).map_err(|e| {
            BakeError::Storage(format!("Failed to write payload {}: {}", self.key, e))
        })?;
        Ok(file.into_temp_path())
    }
}

/// Read `script` and adapt it to `env`.
pub fn package(script: &ScriptRef, env: &ExecutionEnvironment) -> BakeResult<Payload> {
    let source = read_script(&script.source)?;
    Ok(Payload {
        key: script.key.clone(),
        contents: rewrite_imports(&source, env),
    })
}

fn read_script(path: &Path) -> BakeResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        BakeError::Storage(format!("Failed to read script {}: {}", path.display(), e))
    })
}

/// Apply module rewrites to `import` and `from` statements only.
fn rewrite_imports(source: &str, env: &ExecutionEnvironment) -> String {
    if env.module_rewrites.is_empty() {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len());
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            let mut rewritten = line.to_string();
            for (from, to) in &env.module_rewrites {
                rewritten = rewritten.replace(from.as_str(), to);
            }
            out.push_str(&rewritten);
        } else {
            out.push_str(line);
        }
    }
    out
}
