//! Directory tree of a manifest.
//!
//! Every entry is a [`Node`]: a directory of further nodes, a file backed by a
//! host path, or a symlink whose target was captured when it was added.

use std::collections::BTreeMap;
use std::path::PathBuf;

use unik_config::log_manifest_warn;

use crate::{ManifestError, Result};

/// Children of a directory, keyed by entry name
pub type Directory = BTreeMap<String, Node>;

/// A single entry of the manifest tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory(Directory),
    /// Host file whose bytes are embedded at encode time
    File(PathBuf),
    /// Symlink target, stored verbatim
    Link(String),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Node::File(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Node::Link(_))
    }

    pub fn as_dir(&self) -> Option<&Directory> {
        match self {
            Node::Directory(dir) => Some(dir),
            _ => None,
        }
    }

    /// Human readable source of a file or link, used in diagnostics
    fn source(&self) -> String {
        match self {
            Node::Directory(_) => "<directory>".to_string(),
            Node::File(path) => path.display().to_string(),
            Node::Link(target) => format!("-> {}", target),
        }
    }
}

/// Split an image path into its components, ignoring empty and `.` segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

/// Get or create the subdirectory `name` of `parent`
pub(crate) fn mkdir<'a>(
    parent: &'a mut Directory,
    name: &str,
    full_path: &str,
) -> Result<&'a mut Directory> {
    match parent
        .entry(name.to_string())
        .or_insert_with(|| Node::Directory(Directory::new()))
    {
        Node::Directory(dir) => Ok(dir),
        _ => Err(ManifestError::FileConflict(full_path.to_string())),
    }
}

/// Create every directory along `parts`, returning the innermost one
pub(crate) fn mkdir_path<'a>(
    mut parent: &'a mut Directory,
    parts: &[&str],
    full_path: &str,
) -> Result<&'a mut Directory> {
    check_directory_path(parent, parts, full_path)?;
    for part in parts {
        parent = mkdir(parent, part, full_path)?;
    }
    Ok(parent)
}

/// Verify that `parts` can be created as directories without touching the tree
fn check_directory_path(mut dir: &Directory, parts: &[&str], full_path: &str) -> Result<()> {
    for part in parts {
        match dir.get(*part) {
            None => return Ok(()),
            Some(Node::Directory(child)) => dir = child,
            Some(_) => return Err(ManifestError::FileConflict(full_path.to_string())),
        }
    }
    Ok(())
}

/// Insert a file or link node at `image_path`, creating intermediate directories.
///
/// The tree is left untouched when the insertion would conflict with an
/// existing entry.
pub(crate) fn insert(dir: &mut Directory, image_path: &str, node: Node) -> Result<()> {
    let parts = split_path(image_path);
    let (name, parents) = parts
        .split_last()
        .ok_or_else(|| ManifestError::InvalidPath(image_path.to_string()))?;

    check_directory_path(dir, parents, image_path)?;
    if let Some(Node::Directory(_)) = lookup_parts(dir, &parts) {
        return Err(ManifestError::DirectoryConflict(image_path.to_string()));
    }

    let parent = mkdir_path(dir, parents, image_path)?;
    if let Some(existing) = parent.get(*name) {
        if *existing != node {
            let old = existing.source();
            let new = node.source();
            log_manifest_warn!(
                "Overwriting existing file",
                path = image_path,
                old = old.as_str(),
                new = new.as_str(),
            );
        }
    }
    parent.insert(name.to_string(), node);
    Ok(())
}

fn lookup_parts<'a>(dir: &'a Directory, parts: &[&str]) -> Option<&'a Node> {
    let (last, parents) = parts.split_last()?;
    let mut current = dir;
    for part in parents {
        current = current.get(*part)?.as_dir()?;
    }
    current.get(*last)
}

/// Find the node at `image_path`
pub fn lookup<'a>(dir: &'a Directory, image_path: &str) -> Option<&'a Node> {
    lookup_parts(dir, &split_path(image_path))
}

/// Count files, directories and links below `dir`
pub(crate) fn count(dir: &Directory, stats: &mut crate::ManifestStats) {
    for node in dir.values() {
        match node {
            Node::Directory(child) => {
                stats.dir_count += 1;
                count(child, stats);
            }
            Node::File(_) => stats.file_count += 1,
            Node::Link(_) => stats.link_count += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/usr//lib/./libc.so"), vec!["usr", "lib", "libc.so"]);
        assert!(split_path("/").is_empty());
    }

    #[test]
    fn test_insert_creates_parents() {
        let mut root = Directory::new();
        insert(&mut root, "/a/b/c", Node::File(PathBuf::from("/host/c"))).unwrap();
        let a = root.get("a").unwrap().as_dir().unwrap();
        let b = a.get("b").unwrap().as_dir().unwrap();
        assert_eq!(b.get("c"), Some(&Node::File(PathBuf::from("/host/c"))));
    }

    #[test]
    fn test_insert_over_directory_fails_untouched() {
        let mut root = Directory::new();
        insert(&mut root, "/etc/ssl/cert.pem", Node::File(PathBuf::from("/h/cert"))).unwrap();
        let before = root.clone();

        let err = insert(&mut root, "/etc/ssl", Node::File(PathBuf::from("/h/ssl"))).unwrap_err();
        assert!(matches!(err, ManifestError::DirectoryConflict(_)));

        let err = insert(&mut root, "/etc/ssl/cert.pem/x", Node::Link("y".into())).unwrap_err();
        assert!(matches!(err, ManifestError::FileConflict(_)));
        assert_eq!(root, before);
    }

    #[test]
    fn test_insert_rejects_empty_path() {
        let mut root = Directory::new();
        let err = insert(&mut root, "//", Node::Link("x".into())).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidPath(_)));
    }

    #[test]
    fn test_overwrite_is_permitted() {
        let mut root = Directory::new();
        insert(&mut root, "/bin/sh", Node::File(PathBuf::from("/old"))).unwrap();
        insert(&mut root, "/bin/sh", Node::Link("busybox".into())).unwrap();
        assert_eq!(lookup(&root, "/bin/sh"), Some(&Node::Link("busybox".into())));
    }
}
