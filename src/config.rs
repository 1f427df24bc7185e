//! Loading suite definitions from `.json`, `.yaml` and `.yml` files.

use crate::model::TestSuite;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Finds and parses suite files.
#[derive(Debug)]
pub struct SuiteLoader {
    /// Directories searched by [`SuiteLoader::load_all_suites`].
    pub search_paths: Vec<PathBuf>,
}

impl SuiteLoader {
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("tests/suites")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single suite file, picking the format from its extension.
    pub fn load_suite<P: AsRef<Path>>(&self, path: P) -> Result<TestSuite> {
        let path = path.as_ref();
        info!("Loading test suite from {}", path.display());

        let content = fs::read_to_string(path)
            .context(format!("Failed to read suite file: {}", path.display()))?;

        let suite = match SuiteFormat::of(path) {
            Some(SuiteFormat::Json) => TestSuite::from_json(&content)
                .context(format!("Failed to parse JSON suite from {}", path.display()))?,
            Some(SuiteFormat::Yaml) => TestSuite::from_yaml(&content)
                .context(format!("Failed to parse YAML suite from {}", path.display()))?,
            None => {
                return Err(anyhow!(
                    "Unsupported suite file (expected .json, .yaml or .yml): {}",
                    path.display()
                ))
            }
        };

        debug!(
            "Loaded suite '{}' with {} cases",
            suite.api_name,
            suite.test_cases.len()
        );
        Ok(suite)
    }

    /// Load every suite file directly inside `dir`, in file name order.
    /// Files that fail to parse are logged and skipped.
    pub fn load_suites_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<TestSuite>> {
        let dir = dir.as_ref();
        info!("Loading test suites from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in
            fs::read_dir(dir).context(format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && SuiteFormat::of(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut suites = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load_suite(&path) {
                Ok(suite) => suites.push(suite),
                Err(err) => warn!("Skipping {}: {:#}", path.display(), err),
            }
        }

        info!("Loaded {} test suites from {}", suites.len(), dir.display());
        Ok(suites)
    }

    /// Load a file or a directory of suites.
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Vec<TestSuite>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(anyhow!("Path does not exist: {}", path.display()));
        }
        if path.is_dir() {
            self.load_suites_from_dir(path)
        } else {
            Ok(vec![self.load_suite(path)?])
        }
    }

    /// Load the suites of every existing search path.
    pub fn load_all_suites(&self) -> Result<Vec<TestSuite>> {
        let mut all_suites = Vec::new();

        for path in &self.search_paths {
            if path.is_dir() {
                match self.load_suites_from_dir(path) {
                    Ok(mut suites) => all_suites.append(&mut suites),
                    Err(err) => {
                        debug!("Failed to load suites from {}: {}", path.display(), err);
                    }
                }
            }
        }

        info!("Loaded {} test suites in total", all_suites.len());
        Ok(all_suites)
    }
}

impl Default for SuiteLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuiteFormat {
    Json,
    Yaml,
}

impl SuiteFormat {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(SuiteFormat::Json),
            "yaml" | "yml" => Some(SuiteFormat::Yaml),
            _ => None,
        }
    }
}
