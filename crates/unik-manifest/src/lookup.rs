//! Host path resolution with an optional alternate target root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::{ManifestError, Result};

/// Join `path` under `root`, treating absolute paths as relative to `root`.
fn join_under(root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    root.join(relative)
}

fn missing(path: &Path, source: io::Error) -> ManifestError {
    if source.kind() == io::ErrorKind::NotFound {
        ManifestError::MissingFile {
            path: path.to_path_buf(),
            source,
        }
    } else {
        ManifestError::Io(source)
    }
}

/// Resolve `path` to the host file whose bytes should be embedded.
///
/// With a target root, `<target_root>/<path>` is checked first without
/// following symlinks:
/// - a regular entry resolves to itself
/// - a relative symlink is followed by the OS and must exist
/// - an absolute symlink is terminal and resolves to its target re-rooted
///   under the target root
/// - a missing entry falls back to `path` on the host
pub fn lookup_file(target_root: Option<&Path>, path: &Path) -> Result<PathBuf> {
    if let Some(root) = target_root {
        let target_path = join_under(root, path);
        match fs::symlink_metadata(&target_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let link = fs::read_link(&target_path).map_err(|e| missing(&target_path, e))?;
                if link.is_absolute() {
                    return Ok(join_under(root, &link));
                }
                fs::metadata(&target_path).map_err(|e| missing(&target_path, e))?;
                return Ok(target_path);
            }
            Ok(_) => return Ok(target_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ManifestError::Io(e)),
        }
    }

    fs::metadata(path).map_err(|e| missing(path, e))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_host_lookup() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("app");
        fs::write(&file, b"bin").unwrap();

        assert_eq!(lookup_file(None, &file).unwrap(), file);

        let err = lookup_file(None, &temp.path().join("nope")).unwrap_err();
        assert!(matches!(err, ManifestError::MissingFile { .. }));
    }

    #[test]
    fn test_target_root_preferred() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("sysroot");
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/libc.so"), b"target").unwrap();

        let resolved = lookup_file(Some(&root), Path::new("/lib/libc.so")).unwrap();
        assert_eq!(resolved, root.join("lib/libc.so"));
    }

    #[test]
    fn test_target_root_falls_back_to_host() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("sysroot");
        fs::create_dir_all(&root).unwrap();
        let host = temp.path().join("host.so");
        fs::write(&host, b"host").unwrap();

        assert_eq!(lookup_file(Some(&root), &host).unwrap(), host);
    }

    #[cfg(unix)]
    #[test]
    fn test_target_root_symlinks() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("sysroot");
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib/libm.so.6"), b"m").unwrap();
        std::os::unix::fs::symlink("libm.so.6", root.join("lib/libm.so")).unwrap();
        std::os::unix::fs::symlink("/lib/libz.so.1", root.join("lib/libz.so")).unwrap();
        std::os::unix::fs::symlink("gone", root.join("lib/libbroken.so")).unwrap();

        let relative = lookup_file(Some(&root), Path::new("/lib/libm.so")).unwrap();
        assert_eq!(relative, root.join("lib/libm.so"));

        let absolute = lookup_file(Some(&root), Path::new("/lib/libz.so")).unwrap();
        assert_eq!(absolute, root.join("lib/libz.so.1"));

        let err = lookup_file(Some(&root), Path::new("/lib/libbroken.so")).unwrap_err();
        assert!(matches!(err, ManifestError::MissingFile { .. }));
    }
}
