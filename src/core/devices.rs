//! Block device tree built from `lsblk` JSON output.
//!
//! The tree keeps explicit parent/child indices so safety checks can recurse
//! through any nesting depth (disk → partition → LUKS mapping → LVM volume).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::hardware::{LUKS_FSTYPE, SupportedFilesystem};
use crate::core::models::DriveInfo;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceNode {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub label: String,
    pub uuid: String,
    pub fstype: String,
    /// lsblk TYPE column: disk, part, crypt, lvm, loop, rom...
    pub kind: String,
    pub removable: bool,
    pub hotplug: bool,
    pub mountpoints: Vec<PathBuf>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl DeviceNode {
    pub fn is_luks(&self) -> bool {
        self.fstype == LUKS_FSTYPE
    }

    fn mounts_root(&self) -> bool {
        self.mountpoints.iter().any(|m| m == Path::new("/"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceTree {
    nodes: Vec<DeviceNode>,
    roots: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    #[serde(default)]
    name: Value,
    #[serde(default)]
    path: Value,
    #[serde(default)]
    size: Value,
    #[serde(default)]
    label: Value,
    #[serde(default)]
    uuid: Value,
    #[serde(default)]
    fstype: Value,
    #[serde(default, rename = "type")]
    kind: Value,
    #[serde(default)]
    rm: Value,
    #[serde(default)]
    hotplug: Value,
    #[serde(default)]
    mountpoint: Value,
    #[serde(default)]
    mountpoints: Value,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn as_u64(v: &Value) -> u64 {
    match v {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn as_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.trim(), "1" | "true" | "yes"),
        _ => false,
    }
}

fn mountpoints_of(dev: &LsblkDevice) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    if let Value::Array(items) = &dev.mountpoints {
        out.extend(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        );
    }
    if let Some(mp) = dev.mountpoint.as_str().filter(|s| !s.is_empty()) {
        let mp = PathBuf::from(mp);
        if !out.contains(&mp) {
            out.push(mp);
        }
    }
    out
}

impl DeviceTree {
    /// Strict parse. Any structural problem is an error.
    pub fn from_lsblk_json(json: &str) -> Result<Self, serde_json::Error> {
        let output: LsblkOutput = serde_json::from_str(json)?;
        let mut tree = Self::default();
        for dev in &output.blockdevices {
            let idx = tree.insert(dev, None);
            tree.roots.push(idx);
        }
        Ok(tree)
    }

    /// Parse, degrading to an empty tree on malformed output.
    pub fn parse_lenient(json: &str) -> Self {
        match Self::from_lsblk_json(json) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "Unparseable lsblk output, treating as no drives");
                Self::default()
            }
        }
    }

    fn insert(&mut self, dev: &LsblkDevice, parent: Option<usize>) -> usize {
        let name = as_string(&dev.name);
        let mut path = as_string(&dev.path);
        if path.is_empty() && !name.is_empty() {
            path = format!("/dev/{}", name);
        }

        let idx = self.nodes.len();
        self.nodes.push(DeviceNode {
            name,
            path: PathBuf::from(path),
            size: as_u64(&dev.size),
            label: as_string(&dev.label),
            uuid: as_string(&dev.uuid),
            fstype: as_string(&dev.fstype),
            kind: as_string(&dev.kind),
            removable: as_flag(&dev.rm),
            hotplug: as_flag(&dev.hotplug),
            mountpoints: mountpoints_of(dev),
            parent,
            children: Vec::new(),
        });

        for child in &dev.children {
            let child_idx = self.insert(child, Some(idx));
            self.nodes[idx].children.push(child_idx);
        }
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &DeviceNode {
        &self.nodes[idx]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn find(&self, device: &Path) -> Option<usize> {
        self.nodes.iter().position(|n| n.path == device)
    }

    /// True when this node or any descendant mounts `/`.
    pub fn hosts_root(&self, idx: usize) -> bool {
        let node = &self.nodes[idx];
        node.mounts_root() || node.children.iter().any(|&c| self.hosts_root(c))
    }

    pub fn top_level(&self, mut idx: usize) -> usize {
        while let Some(parent) = self.nodes[idx].parent {
            idx = parent;
        }
        idx
    }

    /// True when the device belongs to a disk that carries the root
    /// filesystem anywhere in its subtree.
    pub fn shares_disk_with_root(&self, idx: usize) -> bool {
        self.hosts_root(self.top_level(idx))
    }

    fn is_hotplug_family(&self, mut idx: usize) -> bool {
        loop {
            let node = &self.nodes[idx];
            if node.removable || node.hotplug {
                return true;
            }
            match node.parent {
                Some(parent) => idx = parent,
                None => return false,
            }
        }
    }

    fn open_mapping(&self, idx: usize) -> Option<usize> {
        self.nodes[idx]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].kind == "crypt")
    }

    /// Candidate drives in lsblk order.
    ///
    /// A device qualifies when it carries a supported filesystem or LUKS, it
    /// (or its disk) is removable or hotplug, and nothing on its disk mounts
    /// the root filesystem.
    pub fn candidates(&self) -> Vec<DriveInfo> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for idx in 0..self.nodes.len() {
            let node = &self.nodes[idx];
            if matches!(node.kind.as_str(), "crypt" | "lvm" | "rom") {
                continue;
            }
            let usable = node.is_luks() || SupportedFilesystem::from_str(&node.fstype).is_some();
            if !usable || !self.is_hotplug_family(idx) || self.shares_disk_with_root(idx) {
                continue;
            }
            if !seen.insert(node.path.clone()) {
                continue;
            }

            let mapping = if node.is_luks() {
                self.open_mapping(idx).map(|c| &self.nodes[c])
            } else {
                None
            };

            let (filesystem, mount_point) = match mapping {
                Some(m) => (m.fstype.clone(), m.mountpoints.first().cloned()),
                None => (node.fstype.clone(), node.mountpoints.first().cloned()),
            };

            out.push(DriveInfo {
                device: node.path.clone(),
                size: node.size,
                label: node.label.clone(),
                uuid: node.uuid.clone(),
                filesystem,
                encrypted: node.is_luks(),
                mount_point,
                mapped_device: mapping.map(|m| m.path.clone()),
            });
        }

        out
    }
}
