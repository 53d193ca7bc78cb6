// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration store for the service's `KEY=VALUE` environment file
//!
//! Parsing and serialization live in [`document`], the managed-key schema in
//! [`schema`], edge detection in [`classify`]. This module holds the file I/O
//! and the merge rules.

mod classify;
mod document;
pub mod schema;

pub use classify::{classify_edge_config, is_edge_candidate, is_valid_address, EdgeConfig};
pub use document::{format_value, ConfigDocument};
pub use schema::{is_placeholder, ManagedGroup, MANAGED_GROUPS};

use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

/// Load a document. A missing file is an empty document, not an error.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ConfigDocument> {
    let path = path.as_ref();

    match std::fs::read_to_string(path) {
        Ok(text) => {
            let doc = ConfigDocument::parse(&text);
            debug!(path = %path.display(), keys = doc.len(), "Loaded configuration document");
            Ok(doc)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No configuration document yet");
            Ok(ConfigDocument::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write a document atomically: temp file in the same directory, fsync,
/// rename. The file holds secrets, so it is created owner-only.
pub fn save<P: AsRef<Path>>(doc: &ConfigDocument, path: P) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".env.provision-")
        .tempfile_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(doc.to_string().as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    info!(path = %path.display(), keys = doc.len(), "Configuration document written");
    Ok(())
}

/// Merge computed defaults into `doc`.
///
/// Every key in `defaults` takes the default value, except keys belonging to
/// a group in `groups` that already holds a non-placeholder value: such a
/// group is kept as it is, and only its missing keys are filled in. Keys not
/// named by `defaults` pass through untouched.
pub fn merge_defaults(
    doc: &ConfigDocument,
    defaults: &[(String, String)],
    groups: &[ManagedGroup],
) -> ConfigDocument {
    let populated: Vec<ManagedGroup> = groups
        .iter()
        .copied()
        .filter(|group| {
            doc.entries()
                .any(|(key, value)| group.contains(key) && !is_placeholder(value))
        })
        .collect();

    let mut merged = doc.clone();

    for (key, value) in defaults {
        let preserved = populated.iter().any(|group| group.contains(key));
        if preserved {
            if !merged.contains_key(key) {
                merged.set(key.as_str(), value.as_str());
            }
        } else {
            merged.set(key.as_str(), value.as_str());
        }
    }

    for group in &populated {
        debug!(group = group.name, "Preserved populated managed group");
    }

    merged
}

/// Replace a whole managed group with `values`.
///
/// All existing keys of the group are removed and the new ones inserted where
/// the group used to start, in a single in-memory step. Keys in `values` that
/// do not belong to `group` are ignored.
pub fn apply_group(
    doc: &ConfigDocument,
    group: &ManagedGroup,
    values: &[(String, String)],
) -> ConfigDocument {
    let mut updated = doc.clone();
    let values: Vec<(String, String)> = values
        .iter()
        .filter(|(key, _)| group.contains(key))
        .cloned()
        .collect();

    let index = updated
        .remove_where(|key| group.contains(key))
        .unwrap_or(usize::MAX);
    updated.insert_at(index, &values);

    info!(group = group.name, keys = values.len(), "Replaced managed group");
    updated
}
