//! Exclude-list matching shared by the watcher and the copy capability.

use std::path::{Path, PathBuf};

/// A set of excluded paths.
///
/// An entry written with a trailing `/` excludes that directory and everything
/// below it. Any other entry excludes exactly that path, so excluding `ID`
/// does not exclude a sibling named `ID1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
}

impl PathFilter {
    /// An empty filter that excludes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from configured entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in entries {
            let entry = entry.as_ref();
            if entry.is_empty() {
                continue;
            }
            if entry.ends_with('/') {
                filter.dirs.push(PathBuf::from(entry.trim_end_matches('/')));
            } else {
                filter.files.push(PathBuf::from(entry));
            }
        }
        filter
    }

    /// True if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// True if `path` is excluded.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.files.iter().any(|f| f == path) {
            return true;
        }
        self.dirs.iter().any(|d| path.starts_with(d))
    }

    /// Excluded entries rendered the way they were configured.
    pub fn entries(&self) -> Vec<String> {
        self.dirs
            .iter()
            .map(|d| format!("{}/", d.display()))
            .chain(self.files.iter().map(|f| f.display().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_excludes_nothing() {
        let filter = PathFilter::new();
        assert!(filter.is_empty());
        assert!(!filter.is_excluded(Path::new("/any/path")));
    }

    #[test]
    fn test_directory_entry_excludes_subtree() {
        let filter = PathFilter::from_entries(["/data/skip/"]);
        assert!(filter.is_excluded(Path::new("/data/skip")));
        assert!(filter.is_excluded(Path::new("/data/skip/nested/file")));
        assert!(!filter.is_excluded(Path::new("/data/skipped")));
    }

    #[test]
    fn test_file_entry_is_exact_match() {
        let filter = PathFilter::from_entries(["/data/ID"]);
        assert!(filter.is_excluded(Path::new("/data/ID")));
        assert!(!filter.is_excluded(Path::new("/data/ID1")));
        assert!(!filter.is_excluded(Path::new("/data/ID/child")));
    }

    #[test]
    fn test_entries_round_trip_the_configured_form() {
        let filter = PathFilter::from_entries(["/a/dir/", "/a/file", ""]);
        assert_eq!(filter.entries(), vec!["/a/dir/".to_string(), "/a/file".to_string()]);
    }
}
