//! Extension path cache shared by every lifecycle manager.
//!
//! An explicit registry object constructed once at process start and
//! passed by reference into every component that needs it; tests build
//! a fresh cache per test. The path list is append-only. Readers take a
//! shared lock so they never observe a half-updated list; adding
//! extensions invalidates previously resolved patterns.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct CacheInner {
    paths: Vec<PathBuf>,
    resolved_patterns: HashSet<String>,
}

/// Process-wide cache of known extension file paths.
#[derive(Default)]
pub struct ExtensionCache {
    inner: RwLock<CacheInner>,
}

fn matches_suffix(path: &Path, suffix: &str) -> bool {
    let wanted = suffix.trim_start_matches('*');
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(wanted))
        .unwrap_or(false)
}

impl ExtensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register additional extension paths, deduplicated. Returns how
    /// many were actually added. Any addition invalidates previously
    /// resolved patterns.
    pub fn add_extensions(&self, paths: impl IntoIterator<Item = PathBuf>) -> usize {
        let mut inner = self.inner.write().expect("extension cache lock poisoned");
        let mut added = 0;
        for path in paths {
            if !inner.paths.contains(&path) {
                inner.paths.push(path);
                added += 1;
            }
        }
        if added > 0 {
            inner.resolved_patterns.clear();
            debug!("extension cache grew by {} paths", added);
        }
        added
    }

    /// All known extension paths matching the suffix pattern
    /// (a leading `*` is accepted and ignored). Marks the pattern as
    /// resolved.
    pub fn get_extension_paths(&self, suffix_pattern: &str) -> Vec<PathBuf> {
        let mut inner = self.inner.write().expect("extension cache lock poisoned");
        inner.resolved_patterns.insert(suffix_pattern.to_string());
        inner
            .paths
            .iter()
            .filter(|p| matches_suffix(p, suffix_pattern))
            .cloned()
            .collect()
    }

    /// Matching extensions keyed by file stem.
    pub fn discover_extensions(&self, suffix_pattern: &str) -> HashMap<String, PathBuf> {
        let paths = self.get_extension_paths(suffix_pattern);
        paths
            .into_iter()
            .filter_map(|p| {
                let id = p.file_stem()?.to_str()?.to_string();
                Some((id, p))
            })
            .collect()
    }

    /// Whether this pattern has already been resolved since the last
    /// cache change.
    pub fn is_resolved(&self, suffix_pattern: &str) -> bool {
        self.inner
            .read()
            .expect("extension cache lock poisoned")
            .resolved_patterns
            .contains(suffix_pattern)
    }

    /// Number of cached extension paths.
    pub fn count(&self) -> usize {
        self.inner
            .read()
            .expect("extension cache lock poisoned")
            .paths
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_match_by_suffix() {
        let cache = ExtensionCache::new();
        cache.add_extensions(vec![
            PathBuf::from("/ext/nunit.adapter.json"),
            PathBuf::from("/ext/xunit.adapter.json"),
            PathBuf::from("/ext/readme.txt"),
        ]);

        let paths = cache.get_extension_paths("*.adapter.json");
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn test_add_deduplicates() {
        let cache = ExtensionCache::new();
        let p = PathBuf::from("/ext/one.adapter.json");
        assert_eq!(cache.add_extensions(vec![p.clone()]), 1);
        assert_eq!(cache.add_extensions(vec![p]), 0);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_resolution_invalidated_by_writer() {
        let cache = ExtensionCache::new();
        cache.add_extensions(vec![PathBuf::from("/ext/a.adapter.json")]);

        cache.get_extension_paths(".adapter.json");
        assert!(cache.is_resolved(".adapter.json"));

        // New extension appears: prior resolutions are stale.
        cache.add_extensions(vec![PathBuf::from("/ext/b.adapter.json")]);
        assert!(!cache.is_resolved(".adapter.json"));
    }

    #[test]
    fn test_discover_extensions_keyed_by_stem() {
        let cache = ExtensionCache::new();
        cache.add_extensions(vec![PathBuf::from("/ext/nunit.adapter.json")]);

        let discovered = cache.discover_extensions(".adapter.json");
        assert!(discovered.contains_key("nunit.adapter"));
    }

    #[test]
    fn test_concurrent_readers_see_consistent_list() {
        use std::sync::Arc;

        let cache = Arc::new(ExtensionCache::new());
        let mut handles = Vec::new();

        for i in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                cache.add_extensions(vec![PathBuf::from(format!("/ext/{}.adapter.json", i))]);
                cache.get_extension_paths(".adapter.json").len()
            }));
        }

        for handle in handles {
            // Every observed snapshot is a whole list, never partial.
            let seen = handle.join().unwrap();
            assert!(seen >= 1);
        }
        assert_eq!(cache.count(), 4);
    }
}
