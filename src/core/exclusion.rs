//! Path matching for copy-time exclusions and the protected set.
//!
//! Paths are matched in their root-relative form with a leading slash
//! (`/etc/fstab`, `/home/alice/.cache`). Patterns are path fragments, not
//! globs:
//!
//! - a pattern starting with `/` is anchored at the tree root,
//! - any other pattern matches wherever it appears on component boundaries,
//! - a trailing `/*` excludes the directory's contents but keeps the
//!   directory itself (useful for mount points such as `/proc/*`).
//!
//! Copy-time exclusions only ever feed the copy walk. Deletion and
//! verification consult [`ProtectedSet`] instead.

use std::path::Path;

use super::manifest::MANIFEST_FILE_NAME;
use super::models::BackupType;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    fragment: String,
    anchored: bool,
    contents_only: bool,
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (body, contents_only) = match raw.strip_suffix("/*") {
            Some(body) => (body, true),
            None => (raw, false),
        };
        let anchored = body.starts_with('/');
        let fragment = body.trim_matches('/').to_string();
        if fragment.is_empty() {
            return None;
        }
        Some(Self {
            fragment,
            anchored,
            contents_only,
        })
    }

    /// `rel` is the root-relative path without leading slash.
    fn matches(&self, rel: &str) -> bool {
        if self.anchored {
            return self.matches_at(rel, 0);
        }
        // Try every component boundary.
        let mut start = 0;
        loop {
            if self.matches_at(rel, start) {
                return true;
            }
            match rel[start..].find('/') {
                Some(i) => start += i + 1,
                None => return false,
            }
        }
    }

    fn matches_at(&self, rel: &str, start: usize) -> bool {
        let tail = &rel[start..];
        let Some(rest) = tail.strip_prefix(self.fragment.as_str()) else {
            return false;
        };
        if self.contents_only {
            // Strictly below the fragment.
            rest.starts_with('/') && rest.len() > 1
        } else {
            rest.is_empty() || rest.starts_with('/')
        }
    }
}

/// Copy-time exclusion matcher.
#[derive(Debug, Clone, Default)]
pub struct ExclusionMatcher {
    patterns: Vec<Pattern>,
}

impl ExclusionMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .filter_map(|p| Pattern::parse(p.as_ref()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Match a root-relative path (`etc/fstab`, with or without leading slash).
    pub fn matches(&self, relative: &Path) -> bool {
        let rel = relative_str(relative);
        if rel.is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(&rel))
    }
}

/// Pseudo-filesystem mount points of a system tree. Only system backups and
/// restores treat these as protected; in a home directory they are ordinary
/// folders.
pub const SYSTEM_ROOTS: &[&str] = &["proc", "sys", "dev", "run"];

/// Filesystem bookkeeping at the root of the backup drive.
pub const LOST_AND_FOUND: &str = "lost+found";

/// Root-level entries exempt from deletion and from verification mismatches.
#[derive(Debug, Clone)]
pub struct ProtectedSet {
    roots: Vec<String>,
}

impl ProtectedSet {
    /// System trees protect the pseudo-filesystem roots as well as
    /// `lost+found` and the manifest. Home trees protect only the latter two.
    pub fn for_backup(backup_type: BackupType) -> Self {
        let mut roots = Vec::new();
        if backup_type == BackupType::System {
            roots.extend(SYSTEM_ROOTS.iter().map(|s| s.to_string()));
        }
        roots.push(LOST_AND_FOUND.to_string());
        roots.push(MANIFEST_FILE_NAME.to_string());
        Self { roots }
    }

    /// The protected roots as anchored copy exclusions, for restores that
    /// must not write into pseudo-filesystems or carry the manifest over.
    pub fn as_exclusions(&self) -> Vec<String> {
        self.roots.iter().map(|r| format!("/{}", r)).collect()
    }

    /// True when the root-relative path is a protected root or lies under one.
    pub fn contains(&self, relative: &Path) -> bool {
        let rel = relative_str(relative);
        self.roots.iter().any(|root| {
            rel == *root
                || rel
                    .strip_prefix(root.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

fn relative_str(path: &Path) -> String {
    path.to_string_lossy().trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(patterns: &[&str]) -> ExclusionMatcher {
        ExclusionMatcher::new(patterns.iter().copied())
    }

    #[test]
    fn anchored_pattern_matches_only_at_root() {
        let matcher = m(&["/tmp"]);
        assert!(matcher.matches(Path::new("tmp")));
        assert!(matcher.matches(Path::new("tmp/a/b")));
        assert!(!matcher.matches(Path::new("var/tmp")));
        assert!(!matcher.matches(Path::new("tmpfile")));
    }

    #[test]
    fn contents_suffix_keeps_directory() {
        let matcher = m(&["/proc/*"]);
        assert!(!matcher.matches(Path::new("proc")));
        assert!(matcher.matches(Path::new("proc/1")));
        assert!(matcher.matches(Path::new("/proc/1/status")));
    }

    #[test]
    fn floating_fragment_respects_component_boundaries() {
        let matcher = m(&[".cache"]);
        assert!(matcher.matches(Path::new("home/alice/.cache")));
        assert!(matcher.matches(Path::new("home/alice/.cache/thumbs/x.png")));
        assert!(!matcher.matches(Path::new("home/alice/.cachefile")));
        assert!(!matcher.matches(Path::new("home/alice/my.cache")));
    }

    #[test]
    fn multi_component_fragment() {
        let matcher = m(&[".local/share/Trash"]);
        assert!(matcher.matches(Path::new("bob/.local/share/Trash/files/a")));
        assert!(!matcher.matches(Path::new("bob/.local/share/Trashy")));
    }

    #[test]
    fn empty_patterns_are_ignored() {
        let matcher = m(&["", "/", "  "]);
        assert!(matcher.is_empty());
        assert!(!matcher.matches(Path::new("anything")));
    }

    #[test]
    fn root_itself_never_matches() {
        let matcher = m(&["/proc/*", "x"]);
        assert!(!matcher.matches(Path::new("")));
    }

    #[test]
    fn system_set_covers_virtual_roots_and_manifest() {
        let protected = ProtectedSet::for_backup(BackupType::System);
        assert!(protected.contains(Path::new("proc")));
        assert!(protected.contains(Path::new("proc/self/status")));
        assert!(protected.contains(Path::new("lost+found")));
        assert!(protected.contains(Path::new(MANIFEST_FILE_NAME)));
        assert!(!protected.contains(Path::new("process")));
        assert!(!protected.contains(Path::new("home/user/proc")));
    }

    #[test]
    fn home_set_leaves_dev_and_run_alone() {
        for backup_type in [BackupType::Home, BackupType::SelectiveHome] {
            let protected = ProtectedSet::for_backup(backup_type);
            for ordinary in ["dev", "dev/project/main.rs", "run", "sys", "proc"] {
                assert!(!protected.contains(Path::new(ordinary)), "{ordinary}");
            }
            assert!(protected.contains(Path::new(MANIFEST_FILE_NAME)));
            assert!(protected.contains(Path::new("lost+found")));
        }
    }

    #[test]
    fn home_restore_exclusions_skip_only_bookkeeping() {
        let exclusions = ProtectedSet::for_backup(BackupType::Home).as_exclusions();
        let matcher = ExclusionMatcher::new(&exclusions);
        assert!(!matcher.matches(Path::new("dev/project/main.rs")));
        assert!(matcher.matches(Path::new(MANIFEST_FILE_NAME)));
    }
}
