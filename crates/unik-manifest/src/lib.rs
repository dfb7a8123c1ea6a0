//! # unik-manifest
//!
//! In-memory description of what goes into a unik image.
//!
//! A [`Manifest`] holds the root filesystem tree, an optional boot tree
//! (present once a kernel or kernel libraries are added) and the scalar
//! attributes the kernel reads at boot: program, arguments, environment,
//! debug flags, mounts and network settings.
//!
//! Nothing here knows about the on-disk format; the tfs encoder consumes
//! [`Manifest::root_dir`] and [`Manifest::root_attributes`].

pub mod lookup;
pub mod tree;
mod walk;

pub use lookup::lookup_file;
pub use tree::{split_path, Directory, Node};

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use unik_config::{log_manifest_debug, log_manifest_warn};

/// Errors that can occur while building a manifest
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("file \"{}\" is missing: {source}", path.display())]
    MissingFile { path: PathBuf, source: io::Error },

    #[error("cannot read link \"{}\": {source}", path.display())]
    BadLink { path: PathBuf, source: io::Error },

    #[error("file {0} overriding an existing directory")]
    DirectoryConflict(String),

    #[error("directory {0} is conflicting with an existing file")]
    FileConflict(String),

    #[error("invalid image path: {0:?}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Scalar attribute value as stored in the root tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Attributes of a root or boot tuple, keyed by name
pub type Attributes = BTreeMap<String, Value>;

/// Static network configuration handed to the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ip: String,
    pub ipv6: String,
    pub gateway: String,
    pub netmask: String,
}

/// Environment keys promoted to root attributes when the ntp klib is present
const NTP_ATTRIBUTES: [(&str, &str); 5] = [
    ("ntpAddress", "ntp_address"),
    ("ntpPort", "ntp_port"),
    ("ntpPollMin", "ntp_poll_min"),
    ("ntpPollMax", "ntp_poll_max"),
    ("ntpResetThreshold", "ntp_reset_threshold"),
];

/// Attribute name reserved for directory entries
const CHILDREN: &str = "children";

/// Boot and root filesystem contents of one image
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    root: Directory,
    boot: Option<Directory>,
    program: Option<String>,
    arguments: Vec<String>,
    environment: BTreeMap<String, String>,
    debug_flags: BTreeMap<String, char>,
    no_trace: Vec<String>,
    mounts: BTreeMap<String, String>,
    network: Option<NetworkConfig>,
    passthrough: BTreeMap<String, String>,
    klibs_in_bootfs: bool,
    target_root: Option<PathBuf>,
    klib_host_dir: Option<PathBuf>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manifest resolving host paths against `target_root` first
    pub fn with_target_root(target_root: impl Into<PathBuf>) -> Self {
        Self {
            target_root: Some(target_root.into()),
            ..Self::default()
        }
    }

    pub fn target_root(&self) -> Option<&Path> {
        self.target_root.as_deref()
    }

    pub fn root_dir(&self) -> &Directory {
        &self.root
    }

    pub fn boot_dir(&self) -> Option<&Directory> {
        self.boot.as_ref()
    }

    pub fn has_boot(&self) -> bool {
        self.boot.is_some()
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn mounts(&self) -> &BTreeMap<String, String> {
        &self.mounts
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    // === Tree operations ===

    /// Add the host file `host_path` at `image_path` of the root tree
    pub fn add_file(&mut self, image_path: &str, host_path: impl AsRef<Path>) -> Result<()> {
        let resolved = lookup_file(self.target_root(), host_path.as_ref())?;
        tree::insert(&mut self.root, image_path, Node::File(resolved))
    }

    /// Add a symlink at `image_path` whose target is read from `host_path`
    pub fn add_link(&mut self, image_path: &str, host_path: impl AsRef<Path>) -> Result<()> {
        let host_path = host_path.as_ref();
        lookup_file(self.target_root(), host_path)?;
        let target = fs::read_link(host_path).map_err(|source| ManifestError::BadLink {
            path: host_path.to_path_buf(),
            source,
        })?;
        let target = target.to_string_lossy().into_owned();
        tree::insert(&mut self.root, image_path, Node::Link(target))
    }

    /// Add a shared library at the same path it has on the host
    pub fn add_library(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let image_path = path.to_string_lossy().into_owned();
        self.add_file(&image_path, path)
    }

    /// Create `path` and all its parents as directories of the root tree
    pub fn mkdir_path(&mut self, path: &str) -> Result<()> {
        let parts = split_path(path);
        tree::mkdir_path(&mut self.root, &parts, path)?;
        Ok(())
    }

    /// True if a regular file node exists at `image_path`
    pub fn file_exists(&self, image_path: &str) -> bool {
        matches!(tree::lookup(&self.root, image_path), Some(Node::File(_)))
    }

    // === Boot tree ===

    /// Set the host directory kernel libraries are copied from
    pub fn set_klib_dir(&mut self, dir: impl Into<PathBuf>) {
        self.klib_host_dir = Some(dir.into());
    }

    /// Place the kernel at `/kernel` of the boot tree
    pub fn add_kernel(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let resolved = lookup_file(self.target_root(), path.as_ref())?;
        let boot = self.boot.get_or_insert_with(Directory::new);
        tree::insert(boot, "kernel", Node::File(resolved))
    }

    /// Copy the named kernel libraries into `/klib` of the boot tree.
    ///
    /// Returns the libraries that could not be found in the klib directory;
    /// they are skipped. `cloud_init` pulls in `tls`.
    pub fn add_klibs<S: AsRef<str>>(&mut self, klibs: &[S]) -> Result<Vec<String>> {
        if klibs.is_empty() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = klibs.iter().map(|k| k.as_ref().to_string()).collect();
        if names.iter().any(|n| n == "cloud_init") && !names.iter().any(|n| n == "tls") {
            names.push("tls".to_string());
        }

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            let host_path = self.klib_host_dir.as_ref().map(|dir| dir.join(&name));
            match host_path {
                Some(path) if path.exists() => {
                    found.push((name, lookup_file(self.target_root(), &path)?));
                }
                _ => {
                    let dir = self
                        .klib_host_dir
                        .as_ref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_default();
                    log_manifest_warn!("Klib not found", klib = name.as_str(), dir = dir.as_str());
                    missing.push(name);
                }
            }
        }

        let boot = self.boot.get_or_insert_with(Directory::new);
        let klib_dir = tree::mkdir(boot, "klib", "/klib")?;
        for (name, path) in found {
            tree::insert(klib_dir, &name, Node::File(path))?;
        }
        self.klibs_in_bootfs = true;
        Ok(missing)
    }

    // === Scalars ===

    pub fn set_program(&mut self, program: impl Into<String>) {
        self.program = Some(program.into());
    }

    /// Add the program binary at its relative path and make it the entry point
    pub fn add_user_program(&mut self, path: &str) -> Result<()> {
        let program = format!("/{}", split_path(path).join("/"));
        self.add_file(&program, path)?;
        self.set_program(program);
        Ok(())
    }

    pub fn add_argument(&mut self, arg: impl Into<String>) {
        self.arguments.push(arg.into());
    }

    pub fn add_environment_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(name.into(), value.into());
    }

    /// Set a single-character kernel debug flag such as `debugsyscalls = 't'`
    pub fn add_debug_flag(&mut self, name: impl Into<String>, value: char) {
        self.debug_flags.insert(name.into(), value);
    }

    pub fn add_no_trace(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.no_trace.contains(&name) {
            self.no_trace.push(name);
        }
    }

    /// Mount the volume `label` at `path`, creating the mount point
    pub fn add_mount(&mut self, label: impl Into<String>, path: impl Into<String>) -> Result<()> {
        let path = path.into();
        self.mkdir_path(&path)?;
        self.mounts.insert(label.into(), path);
        Ok(())
    }

    pub fn add_network_config(&mut self, config: NetworkConfig) {
        self.network = Some(config);
    }

    /// Set a raw root attribute
    pub fn add_passthrough(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if key == CHILDREN {
            log_manifest_warn!("Ignoring reserved passthrough key", key = key.as_str());
            return;
        }
        self.passthrough.insert(key, value.into());
    }

    // === Encoding view ===

    /// Attributes of the root tuple, excluding `children`.
    ///
    /// `arguments` and `environment` are always present.
    pub fn root_attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();

        attrs.insert(
            "arguments".to_string(),
            Value::List(self.arguments.iter().map(|a| Value::from(a.as_str())).collect()),
        );
        attrs.insert(
            "environment".to_string(),
            Value::Tuple(
                self.environment
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect(),
            ),
        );
        if let Some(program) = &self.program {
            attrs.insert("program".to_string(), Value::from(program.as_str()));
        }
        for (name, flag) in &self.debug_flags {
            attrs.insert(name.clone(), Value::String(flag.to_string()));
        }
        if !self.no_trace.is_empty() {
            attrs.insert(
                "notrace".to_string(),
                Value::List(self.no_trace.iter().map(|n| Value::from(n.as_str())).collect()),
            );
        }
        if !self.mounts.is_empty() {
            attrs.insert(
                "mounts".to_string(),
                Value::Tuple(
                    self.mounts
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            );
        }
        if let Some(net) = &self.network {
            attrs.insert("ipaddr".to_string(), Value::from(net.ip.as_str()));
            attrs.insert("netmask".to_string(), Value::from(net.netmask.as_str()));
            attrs.insert("gateway".to_string(), Value::from(net.gateway.as_str()));
            attrs.insert("ip6addr".to_string(), Value::from(net.ipv6.as_str()));
        }
        if self.klibs_in_bootfs {
            attrs.insert("klibs".to_string(), Value::from("bootfs"));
        }
        for (key, value) in &self.passthrough {
            attrs.insert(key.clone(), Value::from(value.as_str()));
        }

        self.add_ntp_attributes(&mut attrs);
        attrs
    }

    /// Promote the ntp environment settings when the ntp klib is installed
    fn add_ntp_attributes(&self, attrs: &mut Attributes) {
        let has_ntp = self
            .boot
            .as_ref()
            .and_then(|boot| boot.get("klib"))
            .and_then(Node::as_dir)
            .is_some_and(|klib| klib.contains_key("ntp"));
        if !has_ntp {
            return;
        }

        let env = |key: &str| self.environment.get(key).map(String::as_str);
        let number = |key: &str| env(key).and_then(|v| v.parse::<i64>().ok());

        let poll_min = number("ntpPollMin");
        let poll_max = number("ntpPollMax");
        let poll_inverted = matches!((poll_min, poll_max), (Some(min), Some(max)) if min != 0 && max != 0 && min > max);

        for (env_key, attr) in NTP_ATTRIBUTES {
            let Some(value) = env(env_key) else {
                continue;
            };
            let accepted = match env_key {
                "ntpPollMin" => !poll_inverted && poll_min.is_some_and(|n| n > 3),
                "ntpPollMax" => !poll_inverted && poll_max.is_some_and(|n| n < 18),
                "ntpResetThreshold" => number(env_key).is_some(),
                _ => !value.is_empty(),
            };
            if accepted {
                attrs.insert(attr.to_string(), Value::from(value));
            } else {
                log_manifest_debug!("Dropping ntp setting", key = env_key, value = value);
            }
        }
    }

    /// Attributes of the boot tuple
    pub fn boot_attributes(&self) -> Attributes {
        Attributes::new()
    }

    pub fn stats(&self) -> ManifestStats {
        let mut stats = ManifestStats::default();
        tree::count(&self.root, &mut stats);
        if let Some(boot) = &self.boot {
            tree::count(boot, &mut stats);
        }
        stats
    }
}

/// Entry counts over the root and boot trees
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub link_count: u64,
}
