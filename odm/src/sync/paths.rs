use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::snapshot::Snapshot;

pub const MAX_SEGMENT_BYTES: usize = 255;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("item {0} is not in the snapshot")]
    MissingItem(String),
    #[error("ancestry of item {0} loops back on itself")]
    Cycle(String),
    #[error("path {0:?} contains unsupported component")]
    UnsupportedComponent(String),
}

// The root item maps to "/".
pub fn expand_path(snapshot: &Snapshot, item_id: &str, fs_safe: bool) -> Result<String, PathError> {
    let mut segments: Vec<&str> = Vec::new();
    let mut current = item_id;
    let mut hops = 0usize;

    loop {
        let item = snapshot
            .get(current)
            .ok_or_else(|| PathError::MissingItem(current.to_string()))?;
        let Some(parent) = item.parent_id() else {
            break;
        };

        hops += 1;
        if hops > snapshot.len() {
            return Err(PathError::Cycle(item_id.to_string()));
        }

        if fs_safe {
            segments.extend(split_segment(&item.name).into_iter().rev());
        } else {
            segments.push(&item.name);
        }
        current = parent;
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }
    segments.reverse();
    Ok(segments.join("/"))
}

/// Splits `name` into chunks of at most [`MAX_SEGMENT_BYTES`] bytes, never
/// cutting through a UTF-8 sequence.
pub fn split_segment(name: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = name;
    while rest.len() > MAX_SEGMENT_BYTES {
        let mut cut = MAX_SEGMENT_BYTES;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

pub fn local_path(root: &Path, snapshot: &Snapshot, item_id: &str) -> Result<PathBuf, PathError> {
    let relative = expand_path(snapshot, item_id, true)?;
    map_under(root, &relative)
}

pub fn map_under(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}
