use crate::error::TplError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maps logical template names to files on disk.
///
/// A name is looked up across an ordered list of search paths. Names may
/// carry a namespace prefix (`@admin/users/list`) that pins the lookup to a
/// registered root instead of the search paths. The default extension is
/// appended when the name has none.
#[derive(Debug, Clone)]
pub struct PathResolver {
    search_paths: Vec<PathBuf>,
    namespaces: HashMap<String, PathBuf>,
    default_extension: String,
}

impl PathResolver {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            namespaces: HashMap::new(),
            default_extension: "tpl".to_string(),
        }
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.default_extension = ext.into();
        self
    }

    pub fn add_namespace(&mut self, name: impl Into<String>, root: impl Into<PathBuf>) {
        self.namespaces.insert(name.into(), root.into());
    }

    pub fn add_search_path(&mut self, root: impl Into<PathBuf>) {
        self.search_paths.push(root.into());
    }

    /// Resolves a logical name to an existing file, or fails with
    /// `TplError::NotFound`.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, TplError> {
        let relative = self.with_default_extension(name);

        if let Some(rest) = relative.strip_prefix('@') {
            let (ns, tail) = rest
                .split_once('/')
                .ok_or_else(|| TplError::NotFound(name.to_string()))?;
            let root = self
                .namespaces
                .get(ns)
                .ok_or_else(|| TplError::NotFound(name.to_string()))?;
            let candidate = root.join(tail);
            if candidate.is_file() {
                return Ok(candidate);
            }
            return Err(TplError::NotFound(name.to_string()));
        }

        for root in &self.search_paths {
            let candidate = root.join(&relative);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(TplError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    fn with_default_extension(&self, name: &str) -> String {
        let file_part = name.rsplit('/').next().unwrap_or(name);
        if file_part.contains('.') {
            name.to_string()
        } else {
            format!("{}.{}", name, self.default_extension)
        }
    }
}

/// Modification time of a file as seconds since the Unix epoch.
/// Returns None if the file is missing or its metadata is unreadable.
pub fn mtime_epoch(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_resolve_with_default_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.tpl"), "hi").unwrap();

        let resolver = PathResolver::new(vec![dir.path().to_path_buf()]);
        let path = resolver.resolve("hello").unwrap();
        assert!(path.ends_with("hello.tpl"));
        assert!(resolver.exists("hello"));
        assert!(!resolver.exists("missing"));
    }

    #[test]
    fn test_resolve_explicit_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.html"), "x").unwrap();

        let resolver = PathResolver::new(vec![dir.path().to_path_buf()]);
        assert!(resolver.resolve("base.html").is_ok());
        match resolver.resolve("base") {
            Err(TplError::NotFound(name)) => assert_eq!(name, "base"),
            other => panic!("Expected NotFound, got {:?}", other.map(|p| p.display().to_string())),
        }
    }

    #[test]
    fn test_search_path_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("page.tpl"), "first").unwrap();
        fs::write(second.path().join("page.tpl"), "second").unwrap();

        let resolver = PathResolver::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        let resolved = resolver.resolve("page").unwrap();
        assert_eq!(fs::read_to_string(resolved).unwrap(), "first");
    }

    #[test]
    fn test_namespace_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("widgets")).unwrap();
        fs::write(dir.path().join("widgets/clock.tpl"), "tick").unwrap();

        let mut resolver = PathResolver::new(vec![]);
        resolver.add_namespace("widgets", dir.path().join("widgets"));
        assert!(resolver.resolve("@widgets/clock").is_ok());
        assert!(resolver.resolve("@nope/clock").is_err());
    }
}
