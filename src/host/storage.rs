//! Storage backend discovery and classification.

use strum::Display;

/// Content type a storage backend must accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StorageContent {
    /// VM disk images
    Images,
    /// Container root filesystems
    Rootdir,
}

/// How a storage backend keeps its volumes.
///
/// The kind decides which import and attach flags a disk needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StorageKind {
    /// Volumes are block devices (LVM, ZFS zvols)
    Block,
    /// Volumes are image files on a filesystem
    File,
    /// Volumes live on a network block service
    Network,
}

impl StorageKind {
    /// Classifies a Proxmox storage type.
    ///
    /// Unknown types are treated as file-backed, which always passes an
    /// explicit format on import.
    pub fn from_storage_type(storage_type: &str) -> Self {
        match storage_type {
            "lvm" | "lvmthin" | "zfspool" => Self::Block,
            "rbd" | "iscsi" | "iscsidirect" | "zfs" => Self::Network,
            "dir" | "btrfs" | "nfs" | "cifs" | "glusterfs" | "cephfs" => Self::File,
            other => {
                tracing::debug!("unknown storage type '{}', assuming file-backed", other);
                Self::File
            }
        }
    }

    /// Format flag value required by `qm importdisk`.
    pub fn import_format(&self) -> Option<&'static str> {
        match self {
            Self::File => Some("raw"),
            Self::Block | Self::Network => None,
        }
    }

    /// Drive options for the primary disk.
    pub fn disk_options(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Block => &[("discard", "on"), ("ssd", "1"), ("iothread", "1")],
            Self::File => &[
                ("cache", "writethrough"),
                ("discard", "on"),
                ("ssd", "1"),
                ("iothread", "1"),
            ],
            Self::Network => &[("cache", "none"), ("discard", "on"), ("iothread", "1")],
        }
    }
}

/// A concrete, active storage backend on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub name: String,
    /// Proxmox storage type (e.g. `lvmthin`, `dir`)
    pub storage_type: String,
    pub kind: StorageKind,
}

impl StorageTarget {
    pub fn new(name: impl Into<String>, storage_type: impl Into<String>) -> Self {
        let storage_type = storage_type.into();
        Self {
            name: name.into(),
            kind: StorageKind::from_storage_type(&storage_type),
            storage_type,
        }
    }
}

/// Parses `pvesm status` output into the list of active backends.
///
/// ```text
/// Name             Type     Status           Total            Used       Available        %
/// local             dir     active        98497780        12345678        81084556   12.53%
/// local-lvm     lvmthin     active       832888832        20535414       812353417    2.47%
/// ```
pub fn parse_pvesm_status(output: &str) -> Vec<StorageTarget> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let storage_type = cols.next()?;
            let status = cols.next()?;
            (name != "Name" && status == "active").then(|| StorageTarget::new(name, storage_type))
        })
        .collect()
}
