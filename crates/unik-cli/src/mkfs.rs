use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use unik_config::{log_cli_debug, log_cli_info};
use unik_image::MkfsCommand;
use unik_manifest::{Manifest, NetworkConfig};
use unik_tfs::TfsVersion;

#[derive(Args, Debug)]
pub struct MkfsArgs {
    /// Output image file
    #[arg(value_name = "IMAGE")]
    output: PathBuf,

    /// Program binary; stored at its own path and used as the entry point
    #[arg(short, long)]
    program: Option<String>,

    /// Program argument (repeatable); defaults to the program name
    #[arg(short = 'a', long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment variable NAME=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Host file to add, as IMAGE_PATH=HOST_PATH (repeatable)
    #[arg(short, long = "file", value_parser = parse_key_value)]
    files: Vec<(String, String)>,

    /// Host directory added at the image root (repeatable)
    #[arg(short, long = "dir")]
    dirs: Vec<PathBuf>,

    /// Strip directory prefixes up to a `sysroot` segment when adding --dir
    #[arg(long)]
    package: bool,

    /// Kernel placed in the boot filesystem
    #[arg(short, long)]
    kernel: Option<PathBuf>,

    /// Kernel library to include (repeatable)
    #[arg(long = "klib")]
    klibs: Vec<String>,

    /// Directory kernel libraries are taken from
    #[arg(long, env = "UNIK_KLIB_DIR")]
    klib_dir: Option<PathBuf>,

    /// Volume mount LABEL:PATH (repeatable)
    #[arg(long = "mount", value_parser = parse_mount)]
    mounts: Vec<(String, String)>,

    /// Kernel debug flag NAME[=CHAR] (repeatable, CHAR defaults to 't')
    #[arg(long = "debug-flag", value_parser = parse_debug_flag)]
    debug_flags: Vec<(String, char)>,

    /// Syscall excluded from tracing (repeatable)
    #[arg(long = "notrace")]
    no_trace: Vec<String>,

    /// Extra root attribute KEY=VALUE handed to the kernel (repeatable)
    #[arg(long = "passthrough", value_parser = parse_key_value)]
    passthrough: Vec<(String, String)>,

    /// Static IPv4 address
    #[arg(long)]
    ip: Option<String>,

    /// Static IPv6 address
    #[arg(long)]
    ipv6: Option<String>,

    #[arg(long)]
    gateway: Option<String>,

    #[arg(long)]
    netmask: Option<String>,

    /// Alternate root for resolving host paths
    #[arg(long, env = "UNIK_TARGET_ROOT")]
    target_root: Option<PathBuf>,

    /// Root filesystem label
    #[arg(short, long)]
    label: Option<String>,

    /// Total image size, e.g. 64m
    #[arg(short, long)]
    size: Option<String>,

    /// Boot loader blob prepended to the image
    #[arg(short, long)]
    boot: Option<PathBuf>,

    /// UEFI loader (bootx64.efi or bootaa64.efi)
    #[arg(long)]
    uefi: Option<PathBuf>,

    /// Write an MBR partition table even without a boot loader
    #[arg(long)]
    partitions: bool,

    /// tfs format version (4 or 5)
    #[arg(long)]
    tfs_version: Option<u32>,
}

/// Execute the mkfs command
pub fn run(args: MkfsArgs) -> Result<()> {
    let defaults = unik_config::config().mkfs.clone();

    let target_root = args.target_root.clone().or(defaults.target_root);
    let klib_dir = args.klib_dir.clone().or(defaults.klib_dir);
    let manifest = build_manifest(&args, target_root, klib_dir)?;
    let stats = manifest.stats();
    log_cli_debug!(
        "Manifest built",
        files = stats.file_count,
        dirs = stats.dir_count,
        links = stats.link_count
    );

    let version_number = args.tfs_version.unwrap_or(defaults.tfs_version);
    let version = TfsVersion::from_number(u64::from(version_number))
        .with_context(|| format!("Unsupported tfs version {}", version_number))?;

    let mut cmd = MkfsCommand::new(Some(manifest), args.partitions);
    cmd.set_file_system_path(&args.output);
    cmd.set_tfs_version(version);
    cmd.set_label(args.label.clone().unwrap_or(defaults.label));
    if let Some(size) = args.size.as_deref().or(defaults.size.as_deref()) {
        cmd.set_file_system_size(size)?;
    }
    if let Some(boot) = args.boot.clone().or(defaults.boot) {
        cmd.set_boot(boot);
    }
    if let Some(uefi) = args.uefi.clone().or(defaults.uefi) {
        cmd.set_uefi(uefi);
    }

    cmd.execute()
        .with_context(|| format!("Failed to build image {}", args.output.display()))?;

    let uuid = cmd.uuid().unwrap_or_default();
    log_cli_info!("Image built", path = tracing::field::display(args.output.display()));
    println!("{}", uuid);
    Ok(())
}

fn build_manifest(args: &MkfsArgs, target_root: Option<PathBuf>, klib_dir: Option<PathBuf>) -> Result<Manifest> {
    let mut m = match target_root {
        Some(root) => Manifest::with_target_root(root),
        None => Manifest::new(),
    };
    let work_dir = std::env::current_dir().context("Cannot determine working directory")?;

    if let Some(program) = &args.program {
        m.add_user_program(program)
            .with_context(|| format!("Cannot add program {}", program))?;
    }
    if args.args.is_empty() {
        if let Some(name) = args.program.as_deref().and_then(|p| Path::new(p).file_name()) {
            m.add_argument(name.to_string_lossy());
        }
    }
    for arg in &args.args {
        m.add_argument(arg.as_str());
    }
    for (name, value) in &args.env {
        m.add_environment_variable(name.as_str(), value.as_str());
    }
    for (image_path, host_path) in &args.files {
        m.add_file(image_path, host_path)
            .with_context(|| format!("Cannot add {}", host_path))?;
    }
    for dir in &args.dirs {
        m.add_directory(dir, &work_dir, args.package)
            .with_context(|| format!("Cannot add directory {}", dir.display()))?;
    }

    if let Some(kernel) = &args.kernel {
        m.add_kernel(kernel)
            .with_context(|| format!("Cannot add kernel {}", kernel.display()))?;
    }
    if !args.klibs.is_empty() {
        match klib_dir {
            Some(dir) => m.set_klib_dir(dir),
            None => bail!("--klib requires --klib-dir or mkfs.klib_dir in the config"),
        }
        let missing = m.add_klibs(&args.klibs)?;
        if !missing.is_empty() {
            eprintln!("warning: kernel libraries not found: {}", missing.join(", "));
        }
    }

    for (label, path) in &args.mounts {
        m.add_mount(label.as_str(), path.as_str())?;
    }
    for (name, value) in &args.debug_flags {
        m.add_debug_flag(name.as_str(), *value);
    }
    for name in &args.no_trace {
        m.add_no_trace(name.as_str());
    }
    for (key, value) in &args.passthrough {
        m.add_passthrough(key.as_str(), value.as_str());
    }
    if args.ip.is_some() || args.ipv6.is_some() || args.gateway.is_some() || args.netmask.is_some() {
        m.add_network_config(NetworkConfig {
            ip: args.ip.clone().unwrap_or_default(),
            ipv6: args.ipv6.clone().unwrap_or_default(),
            gateway: args.gateway.clone().unwrap_or_default(),
            netmask: args.netmask.clone().unwrap_or_default(),
        });
    }
    Ok(m)
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

fn parse_mount(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((label, path)) if !label.is_empty() && path.starts_with('/') => {
            Ok((label.to_string(), path.to_string()))
        }
        _ => Err(format!("expected LABEL:/PATH, got {:?}", s)),
    }
}

fn parse_debug_flag(s: &str) -> Result<(String, char), String> {
    let (name, value) = match s.split_once('=') {
        Some((name, value)) => {
            let mut chars = value.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => (name, c),
                _ => return Err(format!("debug flag value must be one character, got {:?}", value)),
            }
        }
        None => (s, 't'),
    };
    if name.is_empty() {
        return Err("empty debug flag name".to_string());
    }
    Ok((name.to_string(), value))
}
