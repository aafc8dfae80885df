//! Home folder discovery and selective-home exclusion generation.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Folders copied no matter what the selection says.
pub const ALWAYS_INCLUDE: &[&str] = &[".ssh", ".gnupg"];

/// Application configuration, governed by the "include config" switch.
pub const CONFIG_DIRS: &[&str] = &[".config", ".local"];

/// Desktop look and feel, governed by the "include window manager" switch.
pub const WINDOW_MANAGER_DIRS: &[&str] = &[".themes", ".icons", ".fonts"];

/// Fixed allowance for `.config`/`.local` instead of measuring them.
pub const CONFIG_ESTIMATE_BYTES: u64 = 512 * 1024 * 1024;
pub const WINDOW_MANAGER_ESTIMATE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HomeFolderInfo {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub always_include: bool,
    pub selected: bool,
    pub children: Vec<HomeFolderInfo>,
}

impl HomeFolderInfo {
    /// Selection with the always-include override applied.
    pub fn is_included(&self) -> bool {
        self.always_include || self.selected
    }
}

/// Recursive size of regular files under `path`, staying on one filesystem.
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .same_file_system(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn list_subdirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Cannot list directory");
            return Vec::new();
        }
    };
    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    dirs.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    dirs
}

/// List the top-level folders of `home` with sizes and one level of children.
///
/// Config and window-manager folders are left out; their inclusion is a
/// separate switch. Visible folders start selected, hidden ones do not.
pub fn scan_home(home: &Path) -> Vec<HomeFolderInfo> {
    list_subdirs(home)
        .into_iter()
        .filter(|(name, _)| {
            !CONFIG_DIRS.contains(&name.as_str()) && !WINDOW_MANAGER_DIRS.contains(&name.as_str())
        })
        .map(|(name, path)| {
            let always_include = ALWAYS_INCLUDE.contains(&name.as_str());
            let selected = always_include || !name.starts_with('.');
            let children: Vec<HomeFolderInfo> = list_subdirs(&path)
                .into_iter()
                .map(|(child_name, child_path)| HomeFolderInfo {
                    size: directory_size(&child_path),
                    path: child_path,
                    name: child_name,
                    always_include,
                    selected,
                    children: Vec::new(),
                })
                .collect();
            let size = directory_size(&path);
            debug!(folder = %name, size, "Measured home folder");
            HomeFolderInfo {
                path,
                name,
                size,
                always_include,
                selected,
                children,
            }
        })
        .collect()
}

/// The caller's choices for a selective home backup.
#[derive(Debug, Clone, Default)]
pub struct HomeSelection {
    pub folders: Vec<HomeFolderInfo>,
    pub include_config: bool,
    pub include_window_manager: bool,
}

impl HomeSelection {
    /// Select exactly the named top-level folders (plus always-include ones).
    pub fn with_selected(mut folders: Vec<HomeFolderInfo>, names: &[String]) -> Self {
        for folder in &mut folders {
            folder.selected = names.iter().any(|n| n == &folder.name);
            for child in &mut folder.children {
                child.selected = folder.selected;
            }
        }
        Self {
            folders,
            include_config: false,
            include_window_manager: false,
        }
    }

    /// Anchored copy-time exclusion patterns for everything left out.
    pub fn exclusions(&self) -> Vec<String> {
        let mut patterns = Vec::new();

        for folder in &self.folders {
            if folder.always_include {
                continue;
            }
            if !folder.selected {
                patterns.push(format!("/{}", folder.name));
                continue;
            }
            for child in &folder.children {
                if !child.is_included() {
                    patterns.push(format!("/{}/{}", folder.name, child.name));
                }
            }
        }

        if !self.include_config {
            patterns.extend(CONFIG_DIRS.iter().map(|d| format!("/{}", d)));
        }
        if !self.include_window_manager {
            patterns.extend(WINDOW_MANAGER_DIRS.iter().map(|d| format!("/{}", d)));
        }
        patterns
    }

    /// Bytes the selection needs on the destination.
    pub fn required_bytes(&self) -> u64 {
        let folders: u64 = self
            .folders
            .iter()
            .map(|folder| {
                if folder.always_include {
                    folder.size
                } else if !folder.selected {
                    0
                } else {
                    let excluded: u64 = folder
                        .children
                        .iter()
                        .filter(|c| !c.is_included())
                        .map(|c| c.size)
                        .sum();
                    folder.size.saturating_sub(excluded)
                }
            })
            .sum();

        let mut total = folders;
        if self.include_config {
            total += CONFIG_ESTIMATE_BYTES;
        }
        if self.include_window_manager {
            total += WINDOW_MANAGER_ESTIMATE_BYTES;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exclusion::ExclusionMatcher;
    use tempfile::tempdir;

    fn fixture() -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        let home = temp.path();
        fs::create_dir_all(home.join("Documents/Taxes")).unwrap();
        fs::create_dir_all(home.join("Documents/Letters")).unwrap();
        fs::write(home.join("Documents/Taxes/2025.pdf"), vec![0u8; 1000]).unwrap();
        fs::write(home.join("Documents/Letters/a.txt"), vec![0u8; 200]).unwrap();
        fs::create_dir_all(home.join("Videos")).unwrap();
        fs::write(home.join("Videos/big.mkv"), vec![0u8; 5000]).unwrap();
        fs::create_dir_all(home.join(".ssh")).unwrap();
        fs::write(home.join(".ssh/id_ed25519"), vec![0u8; 100]).unwrap();
        fs::create_dir_all(home.join(".mozilla")).unwrap();
        fs::create_dir_all(home.join(".config/sway")).unwrap();
        temp
    }

    #[test]
    fn scan_lists_folders_with_sizes() {
        let temp = fixture();
        let folders = scan_home(temp.path());
        let names: Vec<_> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![".mozilla", ".ssh", "Documents", "Videos"]);

        let docs = folders.iter().find(|f| f.name == "Documents").unwrap();
        assert_eq!(docs.size, 1200);
        assert!(docs.selected);
        assert_eq!(docs.children.len(), 2);

        let ssh = folders.iter().find(|f| f.name == ".ssh").unwrap();
        assert!(ssh.always_include);

        let mozilla = folders.iter().find(|f| f.name == ".mozilla").unwrap();
        assert!(!mozilla.selected);
    }

    #[test]
    fn always_include_overrides_deselection() {
        let temp = fixture();
        let selection = HomeSelection::with_selected(scan_home(temp.path()), &[]);
        let ssh = selection.folders.iter().find(|f| f.name == ".ssh").unwrap();
        assert!(!ssh.selected);
        assert!(ssh.is_included());

        let matcher = ExclusionMatcher::new(selection.exclusions());
        assert!(!matcher.matches(Path::new(".ssh/id_ed25519")));
        assert!(matcher.matches(Path::new("Videos/big.mkv")));
        assert!(matcher.matches(Path::new(".config/sway")));
        assert_eq!(selection.required_bytes(), 100);
    }

    #[test]
    fn deselected_child_is_excluded() {
        let temp = fixture();
        let mut selection =
            HomeSelection::with_selected(scan_home(temp.path()), &["Documents".to_string()]);
        let docs = selection
            .folders
            .iter_mut()
            .find(|f| f.name == "Documents")
            .unwrap();
        docs.children
            .iter_mut()
            .find(|c| c.name == "Letters")
            .unwrap()
            .selected = false;

        let patterns = selection.exclusions();
        assert!(patterns.contains(&"/Documents/Letters".to_string()));
        assert!(patterns.contains(&"/Videos".to_string()));
        assert!(!patterns.iter().any(|p| p == "/Documents"));

        // Taxes (1000) + .ssh (100)
        assert_eq!(selection.required_bytes(), 1100);
    }

    #[test]
    fn config_and_wm_estimates_are_added() {
        let selection = HomeSelection {
            folders: Vec::new(),
            include_config: true,
            include_window_manager: true,
        };
        assert_eq!(
            selection.required_bytes(),
            CONFIG_ESTIMATE_BYTES + WINDOW_MANAGER_ESTIMATE_BYTES
        );
        assert!(selection.exclusions().is_empty());
    }
}
