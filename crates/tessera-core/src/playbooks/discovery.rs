//! Playbook discovery from file system.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::playbooks::error::Result;
use crate::playbooks::parser::PlaybookParser;
use crate::playbooks::types::PlaybookDefinition;

/// Outcome of parsing one discovered file.
#[derive(Debug)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub definition: Result<PlaybookDefinition>,
}

/// Playbook discovery service.
///
/// Scans directories for playbook files (`*.md`, `*.markdown`) in a stable,
/// name-sorted order.
pub struct PlaybookDiscovery {
    search_paths: Vec<PathBuf>,
}

impl PlaybookDiscovery {
    /// Create a discovery service with custom search paths.
    pub fn with_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Parse every playbook file under the search paths.
    ///
    /// Individual parse failures are returned alongside successes so the
    /// caller can decide whether to skip or abort.
    pub fn discover_all(&self) -> Vec<DiscoveredFile> {
        let mut files = Vec::new();

        for search_path in &self.search_paths {
            if !search_path.exists() {
                tracing::debug!(path = %search_path.display(), "Playbook search path does not exist");
                continue;
            }
            Self::discover_in_directory(search_path, &mut files);
        }

        files
    }

    fn discover_in_directory(dir: &Path, files: &mut Vec<DiscoveredFile>) {
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = entry.path();
            if !path.is_file() || !Self::is_playbook_file(path) {
                continue;
            }

            files.push(DiscoveredFile {
                path: path.to_path_buf(),
                definition: PlaybookParser::parse_file(path),
            });
        }
    }

    fn is_playbook_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "md" || ext == "markdown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, code: &str) {
        let content = format!(
            "---\nplaybook_code: {code}\nversion: 1.0.0\nname: {code}\nkind: user_workflow\n---\n## 目標\n{code}\n"
        );
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_discover_all_sorted_and_recursive() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("zh-TW");
        std::fs::create_dir_all(&nested).unwrap();
        write(temp.path(), "b.md", "beta");
        write(temp.path(), "a.md", "alpha");
        write(&nested, "c.markdown", "gamma");
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let discovery = PlaybookDiscovery::with_paths(vec![temp.path().to_path_buf()]);
        let files = discovery.discover_all();

        let codes: Vec<String> =
            files.iter().map(|f| f.definition.as_ref().unwrap().code.clone()).collect();
        assert_eq!(codes, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_discover_reports_invalid_files() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "ok.md", "ok");
        std::fs::write(temp.path().join("bad.md"), "no frontmatter").unwrap();

        let files = PlaybookDiscovery::with_paths(vec![temp.path().to_path_buf()]).discover_all();
        assert_eq!(files.len(), 2);
        assert_eq!(files.iter().filter(|f| f.definition.is_err()).count(), 1);
    }

    #[test]
    fn test_missing_search_path_is_empty() {
        let discovery = PlaybookDiscovery::with_paths(vec![PathBuf::from("/nonexistent/tessera")]);
        assert!(discovery.discover_all().is_empty());
    }
}
