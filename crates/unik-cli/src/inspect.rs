//! Read-only commands over the filesystems of an image.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use clap::Args;
use unik_config::log_cli_debug;
use unik_image::Reader;
use unik_tfs::{FileInfo, FileKind};

/// Image selection shared by all read commands
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Image file
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Read the boot filesystem instead of the root filesystem
    #[arg(long)]
    bootfs: bool,
}

impl ImageArgs {
    fn open(&self) -> Result<Reader> {
        let reader = if self.bootfs {
            Reader::open_boot_fs(&self.image)
        } else {
            Reader::open(&self.image)
        };
        reader.with_context(|| format!("Cannot read image {}", self.image.display()))
    }
}

#[derive(Args, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Directory or file inside the image
    #[arg(default_value = "/")]
    path: String,

    /// Long listing: kind, size, modification time
    #[arg(short, long)]
    long: bool,
}

#[derive(Args, Debug)]
pub struct CatArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Files inside the image
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CpArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Source path inside the image
    src: String,

    /// Host destination; an existing directory receives the source's name
    dest: PathBuf,

    /// Copy directories recursively
    #[arg(short, long)]
    recursive: bool,

    /// Copy the targets of symbolic links instead of the links
    #[arg(short = 'L', long)]
    dereference: bool,
}

#[derive(Args, Debug)]
pub struct EnvArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Print as a JSON object
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Print as a JSON object
    #[arg(long)]
    json: bool,
}

pub fn ls(args: LsArgs) -> Result<()> {
    let reader = args.image.open()?;
    let info = reader.stat(&args.path)?;
    let in_dir = info.is_dir();
    let entries = if in_dir {
        reader.read_dir(&args.path)?
    } else {
        vec![info]
    };

    let mut out = io::stdout().lock();
    for entry in &entries {
        if !args.long {
            writeln!(out, "{}", entry.name)?;
            continue;
        }
        let mut line = long_line(entry);
        if entry.kind == FileKind::Symlink {
            let full = join_image_path(&args.path, &entry.name, in_dir);
            if let Ok(target) = reader.read_link(&full) {
                line.push_str(" -> ");
                line.push_str(&target);
            }
        }
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

/// `path` itself when it names the entry, otherwise `path/name`
fn join_image_path(path: &str, name: &str, in_dir: bool) -> String {
    if !in_dir {
        return path.to_string();
    }
    format!("{}/{}", path.trim_end_matches('/'), name)
}

fn long_line(info: &FileInfo) -> String {
    let kind = match info.kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Regular => '-',
        FileKind::Irregular => '?',
    };
    let mtime = info
        .mtime
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{} {:>10} {:>11} {}", kind, info.size, mtime, info.name)
}

pub fn cat(args: CatArgs) -> Result<()> {
    let reader = args.image.open()?;
    let mut out = io::stdout().lock();
    for path in &args.paths {
        let mut file = reader.read_file(path)?;
        io::copy(&mut file, &mut out).with_context(|| format!("Cannot read {}", path))?;
    }
    out.flush()?;
    Ok(())
}

pub fn cp(args: CpArgs) -> Result<()> {
    let reader = args.image.open()?;
    let mut dest = args.dest.clone();
    if dest.is_dir() {
        let info = reader.stat(&args.src)?;
        if info.name != "/" {
            dest.push(&info.name);
        }
    }
    copy_tree(&reader, &args.src, &dest, args.recursive, args.dereference)
}

fn copy_tree(reader: &Reader, src: &str, dest: &Path, recursive: bool, dereference: bool) -> Result<()> {
    let info = reader.stat(src)?;
    if !info.is_dir() {
        log_cli_debug!("Copying file", src = src, dest = tracing::field::display(dest.display()));
        return reader
            .copy_file(src, dest, dereference)
            .with_context(|| format!("Cannot copy {} to {}", src, dest.display()));
    }
    if !recursive {
        anyhow::bail!("{} is a directory (use -r to copy it)", src);
    }

    fs::create_dir_all(dest).with_context(|| format!("Cannot create {}", dest.display()))?;
    for entry in reader.read_dir(src)? {
        let child = format!("{}/{}", src.trim_end_matches('/'), entry.name);
        copy_tree(reader, &child, &dest.join(&entry.name), recursive, dereference)?;
    }
    Ok(())
}

pub fn env(args: EnvArgs) -> Result<()> {
    let reader = args.image.open()?;
    let vars = reader.list_env();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&vars)?);
    } else {
        for (name, value) in &vars {
            println!("{}={}", name, value);
        }
    }
    Ok(())
}

pub fn info(args: InfoArgs) -> Result<()> {
    let reader = args.image.open()?;
    let summary = serde_json::json!({
        "uuid": reader.uuid(),
        "label": reader.label(),
        "tfs_version": reader.version().number(),
        "program": reader.program(),
        "arguments": reader.arguments(),
    });
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("UUID:      {}", reader.uuid());
    println!("Label:     {}", reader.label());
    println!("Version:   {}", reader.version().number());
    if let Some(program) = reader.program() {
        println!("Program:   {}", program);
    }
    let arguments = reader.arguments();
    if !arguments.is_empty() {
        println!("Arguments: {}", arguments.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_join_image_path() {
        assert_eq!(join_image_path("/", "bin", true), "/bin");
        assert_eq!(join_image_path("/lib/", "libc.so", true), "/lib/libc.so");
        assert_eq!(join_image_path("/lib/libc.so", "libc.so", false), "/lib/libc.so");
    }

    #[test]
    fn test_long_line() {
        let info = FileInfo {
            name: "app".to_string(),
            kind: FileKind::Regular,
            size: 42,
            mtime: Some(UNIX_EPOCH + Duration::from_secs(1700000000)),
        };
        assert_eq!(long_line(&info), "-         42  1700000000 app");

        let dir = FileInfo {
            name: "etc".to_string(),
            kind: FileKind::Directory,
            size: 0,
            mtime: None,
        };
        assert!(long_line(&dir).starts_with("d "));
        assert!(long_line(&dir).ends_with(" - etc"));
    }
}
