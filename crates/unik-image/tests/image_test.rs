//! Build complete images with `MkfsCommand` and read them back with `Reader`.

use std::fs;
use std::io::Read;

use unik_config::testing::TestEnvironment;
use unik_image::mbr::{PARTITION_TYPE_ESP, PARTITION_TYPE_LINUX};
use unik_image::{ImageError, Mbr, MkfsCommand, Reader, BOOTFS_SIZE, KLOG_DUMP_SIZE, SECTOR_SIZE, UEFI_FS_SIZE};
use unik_manifest::Manifest;
use unik_tfs::{FileKind, TfsVersion};

fn app_manifest(env: &TestEnvironment) -> Manifest {
    let app = env.create_file("bin/app", b"\x7fELF hello world").unwrap();
    let mut m = Manifest::new();
    m.add_file("/bin/app", &app).unwrap();
    m.set_program("/bin/app");
    m.add_argument("app");
    m.add_environment_variable("GREETING", "hello");
    m
}

fn is_uuid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    s.len() == 36
        && groups.iter().map(|g| g.len()).collect::<Vec<_>>() == [8, 4, 4, 4, 12]
        && s.chars().all(|c| c == '-' || c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn read_mbr(path: &std::path::Path) -> Mbr {
    let bytes = fs::read(path).unwrap();
    Mbr::from_bytes(&bytes).unwrap()
}

#[test]
fn test_raw_image_roundtrip() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("raw.img");

    let mut cmd = MkfsCommand::new(Some(app_manifest(&env)), false);
    cmd.set_file_system_path(&image);
    cmd.set_label("rawfs");
    cmd.execute().unwrap();

    let uuid = cmd.uuid().unwrap();
    assert!(is_uuid(&uuid), "{uuid}");
    assert!(!read_mbr(&image).has_signature());
    assert_eq!(cmd.layout().unwrap().root.offset, 0);

    let reader = Reader::open(&image).unwrap();
    assert_eq!(reader.uuid(), uuid);
    assert_eq!(reader.label(), "rawfs");
    assert_eq!(reader.version(), TfsVersion::V4);
    assert_eq!(reader.list_env().get("GREETING").map(String::as_str), Some("hello"));
    assert_eq!(reader.arguments(), ["app"]);
    assert_eq!(reader.program(), Some("/bin/app"));

    let info = reader.stat("/bin/app").unwrap();
    assert_eq!(info.kind, FileKind::Regular);
    let mut content = Vec::new();
    reader.read_file("/bin/app").unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(content, b"\x7fELF hello world");

    assert!(matches!(Reader::open_boot_fs(&image), Err(ImageError::BootFsNotFound)));
}

#[test]
fn test_partitioned_image_with_boot_tree() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("boot.img");
    let kernel = env.create_file("kernel.img", b"kernel bytes").unwrap();
    env.create_klib("tls").unwrap();
    env.create_klib("cloud_init").unwrap();

    let mut m = app_manifest(&env);
    m.add_kernel(&kernel).unwrap();
    m.set_klib_dir(&env.klib_dir);
    assert!(m.add_klibs(&["cloud_init"]).unwrap().is_empty());

    let mut cmd = MkfsCommand::new(Some(m), true);
    cmd.set_file_system_path(&image);
    cmd.set_file_system_size("64m").unwrap();
    cmd.set_tfs_version(TfsVersion::V5);
    cmd.execute().unwrap();

    let file_size = fs::metadata(&image).unwrap().len();
    assert_eq!(file_size, 64 * 1024 * 1024);

    let mbr = read_mbr(&image);
    assert!(mbr.has_signature());
    let boot = mbr.partition(0);
    let root = mbr.partition(1);
    assert_eq!(boot.partition_type, PARTITION_TYPE_LINUX);
    assert_eq!(boot.offset(), SECTOR_SIZE + KLOG_DUMP_SIZE);
    assert_eq!(boot.size(), BOOTFS_SIZE);
    assert_eq!(root.offset(), boot.offset() + BOOTFS_SIZE);
    assert!(root.offset() + root.size() <= file_size);
    assert_eq!(root.offset() + root.size(), file_size);

    let boot_fs = Reader::open_boot_fs(&image).unwrap();
    assert_eq!(boot_fs.version(), TfsVersion::V5);
    let klibs: Vec<String> = boot_fs.read_dir("/klib").unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(klibs, ["cloud_init", "tls"]);
    let mut kernel_bytes = String::new();
    boot_fs.read_file("/kernel").unwrap().read_to_string(&mut kernel_bytes).unwrap();
    assert_eq!(kernel_bytes, "kernel bytes");

    let root_fs = Reader::open(&image).unwrap();
    assert_eq!(root_fs.uuid(), cmd.uuid().unwrap());
    assert!(root_fs.stat("/bin/app").is_ok());
    assert!(root_fs.stat("/kernel").is_err());
}

#[test]
fn test_boot_tree_forces_partition_table() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("implicit.img");
    let kernel = env.create_file("kernel.img", b"k").unwrap();
    let mut m = app_manifest(&env);
    m.add_kernel(&kernel).unwrap();

    let mut cmd = MkfsCommand::new(Some(m), false);
    cmd.set_file_system_path(&image);
    cmd.execute().unwrap();

    assert!(read_mbr(&image).has_signature());
    assert!(Reader::open_boot_fs(&image).unwrap().stat("/kernel").is_ok());
    assert!(Reader::open(&image).unwrap().stat("/bin/app").is_ok());
}

#[test]
fn test_partitions_without_boot_tree() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("parts.img");

    let mut cmd = MkfsCommand::new(Some(app_manifest(&env)), true);
    cmd.set_file_system_path(&image);
    cmd.execute().unwrap();

    let mbr = read_mbr(&image);
    assert!(mbr.partition(0).is_empty());
    assert_eq!(mbr.partition(1).offset(), SECTOR_SIZE + KLOG_DUMP_SIZE);
    assert!(matches!(Reader::open_boot_fs(&image), Err(ImageError::BootFsNotFound)));
    assert_eq!(Reader::open(&image).unwrap().list_env()["GREETING"], "hello");
}

#[test]
fn test_uefi_partition() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("uefi.img");
    let loader = env.create_file("efi/bootaa64.efi", &[0xAB; 700]).unwrap();

    let mut cmd = MkfsCommand::new(Some(app_manifest(&env)), false);
    cmd.set_file_system_path(&image);
    cmd.set_uefi(&loader);
    cmd.execute().unwrap();

    let mbr = read_mbr(&image);
    let esp = mbr.partition(0);
    assert_eq!(esp.partition_type, PARTITION_TYPE_ESP);
    assert_eq!(esp.offset(), SECTOR_SIZE + KLOG_DUMP_SIZE);
    assert_eq!(esp.size(), UEFI_FS_SIZE);
    assert!(mbr.partition(1).is_empty());
    assert_eq!(mbr.partition(2).offset(), esp.offset() + UEFI_FS_SIZE);

    let bytes = fs::read(&image).unwrap();
    let data = (esp.offset() + 0x85E00) as usize;
    assert_eq!(&bytes[data..data + 700], &[0xAB; 700][..]);

    let reader = Reader::open(&image).unwrap();
    assert!(reader.stat("/bin/app").is_ok());
}

#[test]
fn test_boot_loader_blob_prefix() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("blob.img");
    let mut blob = vec![0x90u8; 3 * SECTOR_SIZE as usize];
    blob[510] = 0x55;
    blob[511] = 0xAA;
    let blob_path = env.create_file("boot/boot.img", &blob).unwrap();

    let mut cmd = MkfsCommand::new(Some(app_manifest(&env)), false);
    cmd.set_file_system_path(&image);
    cmd.set_boot(&blob_path);
    cmd.execute().unwrap();

    let bytes = fs::read(&image).unwrap();
    assert_eq!(&bytes[SECTOR_SIZE as usize..3 * SECTOR_SIZE as usize], &blob[512..]);
    let root = read_mbr(&image).partition(1);
    assert_eq!(root.offset(), 3 * SECTOR_SIZE + KLOG_DUMP_SIZE);
    assert_eq!(cmd.layout().unwrap().root.offset, root.offset());
    assert!(Reader::open(&image).unwrap().stat("/bin/app").is_ok());
}

#[test]
fn test_size_never_shrinks() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("small.img");

    let mut cmd = MkfsCommand::new(None, false);
    cmd.set_file_system_path(&image);
    cmd.set_file_system_size("1k").unwrap();
    cmd.execute().unwrap();

    assert!(fs::metadata(&image).unwrap().len() > 1024);
    let reader = Reader::open(&image).unwrap();
    assert!(reader.read_dir("/").unwrap().is_empty());
    assert!(reader.list_env().is_empty());
}

#[test]
fn test_copy_file() {
    let env = TestEnvironment::new().unwrap();
    let image = env.image_path("copy.img");
    env.create_file("lib/libz.so.1.2", b"zlib").unwrap();
    let link = env.create_symlink("lib/libz.so.1", "libz.so.1.2").unwrap();

    let mut m = app_manifest(&env);
    m.add_file("/lib/libz.so.1.2", env.host_root.join("lib/libz.so.1.2")).unwrap();
    m.add_link("/lib/libz.so.1", &link).unwrap();
    let mut cmd = MkfsCommand::new(Some(m), false);
    cmd.set_file_system_path(&image);
    cmd.execute().unwrap();

    let reader = Reader::open(&image).unwrap();
    let out = env.output_dir.join("libz.so.1");

    reader.copy_file("/lib/libz.so.1", &out, false).unwrap();
    assert_eq!(fs::read_link(&out).unwrap().to_str(), Some("libz.so.1.2"));

    // recreating the link replaces the previous one
    reader.copy_file("/lib/libz.so.1", &out, false).unwrap();
    assert!(fs::symlink_metadata(&out).unwrap().file_type().is_symlink());

    let copied = env.output_dir.join("libz-copy");
    reader.copy_file("/lib/libz.so.1", &copied, true).unwrap();
    assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
    assert_eq!(fs::read(&copied).unwrap(), b"zlib");

    assert!(reader.copy_file("/lib/missing", &copied, false).is_err());
}
