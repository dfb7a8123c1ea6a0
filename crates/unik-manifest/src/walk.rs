//! Populating a manifest from host directory trees.

use std::fs;
use std::path::{Component, Path};

use unik_config::{log_manifest_debug, log_manifest_warn};
use walkdir::WalkDir;

use crate::tree::{self, split_path};
use crate::{Manifest, Result};

/// Build an image path from path components, keeping only normal segments
fn image_path_of(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    format!("/{}", parts.join("/"))
}

/// Cut an image path at its first `sysroot` segment, if it has one
fn strip_sysroot(image_path: &str) -> Option<String> {
    let parts = split_path(image_path);
    let idx = parts.iter().position(|part| *part == "sysroot")?;
    Some(format!("/{}", parts[idx + 1..].join("/")))
}

impl Manifest {
    /// Add every entry below `host_dir` to the root tree.
    ///
    /// A relative `host_dir` is resolved against `work_dir`; image paths keep
    /// `host_dir` as written, rooted at `/`. With `inside_package`, paths are
    /// cut at their `sysroot` segment and the package directories leading up
    /// to it are not created.
    pub fn add_directory(&mut self, host_dir: &Path, work_dir: &Path, inside_package: bool) -> Result<()> {
        let walk_root = work_dir.join(host_dir);
        self.add_walked_tree(&walk_root, |suffix, is_dir| {
            let image_path = image_path_of(&host_dir.join(suffix));
            if !inside_package {
                return Some(image_path);
            }
            match strip_sysroot(&image_path) {
                Some(stripped) => Some(stripped),
                None if is_dir => None,
                None => Some(image_path),
            }
        })
    }

    /// Add every entry below `host_dir`, with image paths relative to it.
    pub fn add_relative_directory(&mut self, host_dir: &Path) -> Result<()> {
        self.add_walked_tree(host_dir, |suffix, _| Some(image_path_of(suffix)))
    }

    fn add_walked_tree<F>(&mut self, walk_root: &Path, to_image_path: F) -> Result<()>
    where
        F: Fn(&Path, bool) -> Option<String>,
    {
        log_manifest_debug!("Adding directory", root = tracing::field::display(walk_root.display()));

        for entry in WalkDir::new(walk_root).follow_links(false).sort_by_file_name() {
            let entry = entry?;
            let host_path = entry.path();
            let file_type = entry.file_type();
            let suffix = host_path.strip_prefix(walk_root).unwrap_or(host_path);
            let Some(image_path) = to_image_path(suffix, file_type.is_dir()) else {
                continue;
            };
            let parts = split_path(&image_path);
            if parts.is_empty() {
                continue;
            }

            if file_type.is_symlink() {
                if fs::metadata(host_path).is_err() {
                    log_manifest_warn!(
                        "Skipping broken symlink",
                        path = tracing::field::display(host_path.display()),
                    );
                    continue;
                }
                self.add_link(&image_path, host_path)?;
            } else if file_type.is_dir() {
                tree::mkdir_path(&mut self.root, &parts, &image_path)?;
            } else {
                self.add_file(&image_path, host_path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManifestError, Node};
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_strip_sysroot() {
        assert_eq!(strip_sysroot("/pkg/sysroot/usr/lib/a.so").as_deref(), Some("/usr/lib/a.so"));
        assert_eq!(strip_sysroot("/pkg/sysroot").as_deref(), Some("/"));
        assert_eq!(strip_sysroot("/pkg/bin/app"), None);
    }

    #[test]
    fn test_image_path_of() {
        assert_eq!(image_path_of(Path::new("./data/x")), "/data/x");
        assert_eq!(image_path_of(Path::new("/etc/hosts")), "/etc/hosts");
        assert_eq!(image_path_of(Path::new("")), "/");
    }

    #[test]
    fn test_add_directory_relative_to_work_dir() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("static/css")).unwrap();
        fs::create_dir_all(temp.path().join("static/empty")).unwrap();
        fs::write(temp.path().join("static/index.html"), b"<html>").unwrap();
        fs::write(temp.path().join("static/css/site.css"), b"body{}").unwrap();

        let mut manifest = Manifest::new();
        manifest
            .add_directory(Path::new("static"), temp.path(), false)
            .unwrap();

        assert!(manifest.file_exists("/static/index.html"));
        assert!(manifest.file_exists("/static/css/site.css"));
        let empty = tree::lookup(manifest.root_dir(), "/static/empty").unwrap();
        assert!(empty.is_dir());
        assert_eq!(
            tree::lookup(manifest.root_dir(), "/static/index.html"),
            Some(&Node::File(temp.path().join("static/index.html")))
        );
    }

    #[test]
    fn test_add_directory_inside_package() {
        let temp = tempdir().unwrap();
        let pkg = temp.path().join("node_v14");
        fs::create_dir_all(pkg.join("sysroot/usr/lib")).unwrap();
        fs::write(pkg.join("sysroot/usr/lib/libnode.so"), b"lib").unwrap();

        let mut manifest = Manifest::new();
        manifest.add_directory(&pkg, Path::new("/"), true).unwrap();

        assert!(manifest.file_exists("/usr/lib/libnode.so"));
        assert!(tree::lookup(manifest.root_dir(), "/sysroot").is_none());
        assert_eq!(manifest.root_dir().len(), 1);
    }

    #[test]
    fn test_add_relative_directory() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("etc/ssl")).unwrap();
        fs::write(temp.path().join("etc/ssl/cert.pem"), b"pem").unwrap();

        let mut manifest = Manifest::new();
        manifest.add_relative_directory(temp.path()).unwrap();

        assert!(manifest.file_exists("/etc/ssl/cert.pem"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_kept_and_broken_skipped() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("root");
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("lib/libz.so.1"), b"z").unwrap();
        std::os::unix::fs::symlink("libz.so.1", dir.join("lib/libz.so")).unwrap();
        std::os::unix::fs::symlink("missing", dir.join("lib/libgone.so")).unwrap();

        let mut manifest = Manifest::new();
        manifest.add_relative_directory(&dir).unwrap();

        assert_eq!(
            tree::lookup(manifest.root_dir(), "/lib/libz.so"),
            Some(&Node::Link("libz.so.1".to_string()))
        );
        assert!(tree::lookup(manifest.root_dir(), "/lib/libgone.so").is_none());
    }

    #[test]
    fn test_directory_over_file_fails() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("conf")).unwrap();
        let host = temp.path().join("host.txt");
        fs::write(&host, b"x").unwrap();

        let mut manifest = Manifest::new();
        manifest.add_file("/conf", &host).unwrap();
        let err = manifest
            .add_directory(Path::new("conf"), temp.path(), false)
            .unwrap_err();
        assert!(matches!(err, ManifestError::FileConflict(_)));
        assert_eq!(
            tree::lookup(manifest.root_dir(), "/conf"),
            Some(&Node::File(PathBuf::from(&host)))
        );
    }
}
