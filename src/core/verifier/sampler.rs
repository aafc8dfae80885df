//! Random descent over a directory tree without enumerating it.
//!
//! Each draw walks from the root, picking a random child at every level
//! until it lands on a regular file it has not returned before. Listings are
//! cached so a directory is read at most once, and each cached listing holds
//! only what is still on offer: returned files and exhausted directories are
//! removed from it, so a pick costs the same at any directory size. Every
//! step, including reading a large directory, gives up once the deadline
//! passes.

use rand::Rng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

use crate::core::exclusion::ProtectedSet;

/// Entries read between deadline checks while listing a directory.
const LIST_CHECK_EVERY: usize = 64;

/// Files and directories of one directory not yet returned or exhausted.
#[derive(Debug, Default)]
struct Listing {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

pub struct Sampler<'a> {
    root: PathBuf,
    root_dev: u64,
    protected: &'a ProtectedSet,
    rng: StdRng,
    listings: HashMap<PathBuf, Listing>,
}

impl<'a> Sampler<'a> {
    pub fn new(root: &Path, protected: &'a ProtectedSet, rng: StdRng) -> std::io::Result<Self> {
        let root_dev = fs::metadata(root)?.dev();
        Ok(Self {
            root: root.to_path_buf(),
            root_dev,
            protected,
            rng,
            listings: HashMap::new(),
        })
    }

    /// Directories read so far.
    pub fn directories_listed(&self) -> usize {
        self.listings.len()
    }

    /// `None` when the deadline passed before the directory was fully read.
    fn list(&self, relative: &Path, deadline: Instant) -> Option<Listing> {
        let dir = self.root.join(relative);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Sampler cannot list directory");
                return Some(Listing::default());
            }
        };

        let mut listing = Listing::default();
        for (i, entry) in entries.filter_map(|e| e.ok()).enumerate() {
            if i % LIST_CHECK_EVERY == 0 && Instant::now() >= deadline {
                debug!(path = %dir.display(), read = i, "Sample deadline passed while listing");
                return None;
            }
            let child = relative.join(entry.file_name());
            if self.protected.contains(&child) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.file_type().is_file() {
                listing.files.push(child);
            } else if meta.is_dir() && meta.dev() == self.root_dev {
                listing.dirs.push(child);
            }
        }
        // read_dir order is filesystem-dependent; sort so a seeded run is
        // reproducible.
        listing.files.sort();
        listing.dirs.sort();
        Some(listing)
    }

    /// Next distinct regular file, relative to the root. `None` once every
    /// reachable file has been returned or the deadline has passed.
    pub fn next_sample(&mut self, deadline: Instant) -> Option<PathBuf> {
        let mut current = PathBuf::new();
        loop {
            if Instant::now() >= deadline {
                return None;
            }
            if !self.listings.contains_key(&current) {
                let listing = self.list(&current, deadline)?;
                self.listings.insert(current.clone(), listing);
            }
            let listing = self.listings.get_mut(&current)?;

            let total = listing.files.len() + listing.dirs.len();
            if total == 0 {
                if current.as_os_str().is_empty() {
                    return None;
                }
                let parent = current.parent().map(Path::to_path_buf).unwrap_or_default();
                if let Some(up) = self.listings.get_mut(&parent) {
                    up.dirs.retain(|d| d != &current);
                }
                current = PathBuf::new();
                continue;
            }

            let choice = self.rng.gen_range(0..total);
            if choice < listing.files.len() {
                return Some(listing.files.swap_remove(choice));
            }
            current = listing.dirs[choice - listing.files.len()].clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BackupType;
    use rand::SeedableRng;
    use std::time::Duration;
    use tempfile::tempdir;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn build_tree(root: &Path) {
        for dir in ["a", "a/b", "c", "proc", "empty/deeper"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        for file in ["top.txt", "a/one", "a/b/two", "a/b/three", "c/four", "proc/ignored"] {
            fs::write(root.join(file), file).unwrap();
        }
    }

    #[test]
    fn exhausts_small_tree_without_repeats() {
        let temp = tempdir().unwrap();
        build_tree(temp.path());
        let protected = ProtectedSet::for_backup(BackupType::System);
        let mut sampler =
            Sampler::new(temp.path(), &protected, StdRng::seed_from_u64(7)).unwrap();

        let mut seen = Vec::new();
        while let Some(path) = sampler.next_sample(far()) {
            seen.push(path);
            assert!(seen.len() <= 5, "sampler repeated files");
        }
        seen.sort();
        let expected: Vec<PathBuf> = ["a/b/three", "a/b/two", "a/one", "c/four", "top.txt"]
            .iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn same_seed_same_sequence() {
        let temp = tempdir().unwrap();
        build_tree(temp.path());
        let protected = ProtectedSet::for_backup(BackupType::System);

        let draw = |seed| {
            let mut sampler =
                Sampler::new(temp.path(), &protected, StdRng::seed_from_u64(seed)).unwrap();
            std::iter::from_fn(|| sampler.next_sample(far())).collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("only/dirs/here")).unwrap();
        let protected = ProtectedSet::for_backup(BackupType::System);
        let mut sampler =
            Sampler::new(temp.path(), &protected, StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(sampler.next_sample(far()), None);
        assert!(sampler.directories_listed() >= 1);
    }

    #[test]
    fn passed_deadline_reads_nothing() {
        let temp = tempdir().unwrap();
        build_tree(temp.path());
        let protected = ProtectedSet::for_backup(BackupType::System);
        let mut sampler =
            Sampler::new(temp.path(), &protected, StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(sampler.next_sample(Instant::now()), None);
        assert_eq!(sampler.directories_listed(), 0);
    }

    #[test]
    fn large_directory_is_drawn_without_repeats() {
        let temp = tempdir().unwrap();
        for i in 0..500 {
            fs::write(temp.path().join(format!("mail-{i:04}")), b"m").unwrap();
        }
        let protected = ProtectedSet::for_backup(BackupType::Home);
        let mut sampler =
            Sampler::new(temp.path(), &protected, StdRng::seed_from_u64(9)).unwrap();

        let drawn: Vec<_> = std::iter::from_fn(|| sampler.next_sample(far())).collect();
        let distinct: std::collections::HashSet<_> = drawn.iter().collect();
        assert_eq!(drawn.len(), 500);
        assert_eq!(distinct.len(), 500);
    }
}
