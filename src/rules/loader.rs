//! Rule file loading.
//!
//! A rule directory is loaded as a unit: every regular file directly inside
//! it is parsed, in path order. The first malformed line aborts the load.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::{Rule, RuleError};

/// The rules parsed from one file.
#[derive(Debug, Clone)]
pub struct RuleFile {
    pub path: PathBuf,
    pub rules: Vec<Rule>,
}

impl RuleFile {
    /// Parse rule text that came from `path`.
    ///
    /// Line numbers in errors are 1-based.
    pub fn parse(path: &Path, content: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let parsed = Rule::parse_line(line).map_err(|source| RuleError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
            if let Some(rule) = parsed {
                rules.push(rule);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            rules,
        })
    }

    /// Read and parse a single rule file.
    ///
    /// Parsing runs in a blocking task since rule files built from public
    /// lists can hold hundreds of thousands of lines.
    pub async fn load(path: &Path) -> Result<Self, RuleError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| RuleError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;

        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::parse(&path, &content)).await?
    }
}

/// Load every rule file in `dir`, sorted by path.
///
/// Sub-directories are skipped.
pub async fn load_directory(dir: &Path) -> Result<Vec<RuleFile>, RuleError> {
    let read_dir_error = |source| RuleError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(dir).await.map_err(read_dir_error)?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(read_dir_error)? {
        let file_type = entry.file_type().await.map_err(read_dir_error)?;
        if file_type.is_file() {
            paths.push(entry.path());
        }
    }

    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = RuleFile::load(&path).await?;
        tracing::debug!(path = ?file.path, rules = file.rules.len(), "loaded rule file");
        files.push(file);
    }

    Ok(files)
}
