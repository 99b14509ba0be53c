// tests/resolve.rs

//! End-to-end resolution scenarios over simulated hardware.

mod common;

use std::io::Write;
use std::path::Path;

use common::{block_device, FixedHardware, MockMounter, NullNet};
use instsrc::context::Context;
use instsrc::mount::{self, AcceptTest, Deps, Verdict};
use instsrc::progress::SilentProgress;
use instsrc::repo::{self, SignatureVerifier};
use instsrc::transfer::FileTransport;
use instsrc::url::{Scheme, Url};
use instsrc::{Error, Result};

fn deps<'a>(mounter: &'a MockMounter, hardware: &'a FixedHardware) -> Deps<'a> {
    Deps {
        mounter,
        hardware,
        net: &NullNet,
        slp: None,
        transport: &FileTransport,
        progress: &SilentProgress,
    }
}

/// Build a device tree carrying a repository at /repo with a manifest
/// and a mountable payload image at /repo/boot/root.
fn repo_tree(root: &Path) {
    let repo = root.join("repo");
    std::fs::create_dir_all(repo.join("boot")).unwrap();
    std::fs::write(
        repo.join("content"),
        "aaaa boot/root\nbbbb driverupdate\n",
    )
    .unwrap();
    std::fs::write(repo.join("boot/root"), b"IMG payload filesystem").unwrap();
}

struct OkVerifier(bool);

impl SignatureVerifier for OkVerifier {
    fn verify(&self, _manifest: &Path, _signature: &Path) -> Result<bool> {
        Ok(self.0)
    }
}

#[test]
fn test_repo_discovery_scans_past_empty_device() {
    let scratch = tempfile::tempdir().unwrap();
    let empty = scratch.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);

    let mounter = MockMounter::new()
        .with_device("/dev/sda1", &empty)
        .with_device("/dev/sdb1", &full);
    let hardware = FixedHardware(vec![block_device("/dev/sda1"), block_device("/dev/sdb1")]);
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();
    ctx.instsys = Some(Url::parse("rel:boot/root"));

    let mut url = Url::parse("disk:/repo");
    repo::find_repository(&deps, &OkVerifier(true), &mut ctx, &mut url, None).unwrap();

    assert_eq!(url.used.device.as_deref(), Some("/dev/sdb1"));
    assert!(url.mount.is_some());
    // the relative payload was mounted in place
    let instsys = ctx.instsys.as_ref().unwrap();
    let payload_mount = instsys.mount.as_ref().unwrap();
    assert!(payload_mount.join("IMAGE_OK").exists());
}

#[test]
fn test_repo_discovery_secure_loads_manifest() {
    let scratch = tempfile::tempdir().unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);
    std::fs::write(full.join("repo/content.asc"), b"signature").unwrap();

    let mounter = MockMounter::new().with_device("/dev/sda1", &full);
    let hardware = FixedHardware(vec![block_device("/dev/sda1")]);
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();
    ctx.secure = true;
    ctx.instsys = Some(Url::parse("rel:boot/root"));

    let mut url = Url::parse("disk:/repo");
    repo::find_repository(&deps, &OkVerifier(true), &mut ctx, &mut url, None).unwrap();

    assert!(!ctx.sig_failed);
    assert!(!ctx.digest_failed);
    assert_eq!(
        ctx.digests,
        vec![
            ("aaaa".to_string(), "boot/root".to_string()),
            ("bbbb".to_string(), "driverupdate".to_string()),
        ]
    );
}

#[test]
fn test_repo_discovery_bad_signature_is_flagged_not_fatal() {
    let scratch = tempfile::tempdir().unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);
    std::fs::write(full.join("repo/content.asc"), b"bad signature").unwrap();

    let mounter = MockMounter::new().with_device("/dev/sda1", &full);
    let hardware = FixedHardware(vec![block_device("/dev/sda1")]);
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();
    ctx.secure = true;
    ctx.instsys = Some(Url::parse("rel:boot/root"));

    let mut url = Url::parse("disk:/repo");
    repo::find_repository(&deps, &OkVerifier(false), &mut ctx, &mut url, None).unwrap();
    assert!(ctx.sig_failed);
}

#[test]
fn test_repo_discovery_missing_payload_rejects_device() {
    let scratch = tempfile::tempdir().unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);
    std::fs::remove_file(full.join("repo/boot/root")).unwrap();

    let mounter = MockMounter::new().with_device("/dev/sda1", &full);
    let hardware = FixedHardware(vec![block_device("/dev/sda1")]);
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();
    ctx.instsys = Some(Url::parse("rel:boot/root"));

    let mut url = Url::parse("disk:/repo");
    let err = repo::find_repository(&deps, &OkVerifier(true), &mut ctx, &mut url, None)
        .unwrap_err();
    assert!(matches!(err, Error::Mount(_)));
    // nothing left mounted after the rejected candidate
    assert_eq!(mounter.active_count(), 0);
    assert!(url.mount.is_none());
    assert!(url.tmp_mount.is_none());
}

struct ContinueThenAccept {
    seen: Vec<String>,
}

impl AcceptTest for ContinueThenAccept {
    fn accept(&mut self, _deps: &Deps, _ctx: &mut Context, url: &mut Url) -> Verdict {
        self.seen.push(url.used.device.clone().unwrap_or_default());
        if self.seen.len() == 1 {
            Verdict::AcceptedContinue
        } else {
            Verdict::Accepted
        }
    }
}

#[test]
fn test_accepted_continue_keeps_scanning() {
    let scratch = tempfile::tempdir().unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);

    let mounter = MockMounter::new()
        .with_device("/dev/sda1", &full)
        .with_device("/dev/sdb1", &full);
    let hardware = FixedHardware(vec![block_device("/dev/sda1"), block_device("/dev/sdb1")]);
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();

    let mut url = Url::parse("disk:/repo");
    let mut test = ContinueThenAccept { seen: Vec::new() };
    mount::mount_url(&deps, &mut ctx, &mut url, None, Some(&mut test)).unwrap();

    assert_eq!(test.seen, vec!["/dev/sda1", "/dev/sdb1"]);
    assert_eq!(url.used.device.as_deref(), Some("/dev/sdb1"));
}

#[test]
fn test_find_instsys_downloads_and_mounts_image() {
    let scratch = tempfile::tempdir().unwrap();

    // gzipped image: not directly mountable, so the resolver must
    // download (decompressing) and loopback-mount the copy
    let image = scratch.path().join("root.gz");
    let mut enc = flate2::GzBuilder::new().write(
        std::fs::File::create(&image).unwrap(),
        flate2::Compression::default(),
    );
    enc.write_all(b"IMG root filesystem").unwrap();
    enc.finish().unwrap();

    let mounter = MockMounter::new();
    let hardware = FixedHardware(Vec::new());
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();

    let dir = scratch.path().join("instsys");
    let mut url = Url::parse(&format!("file:{}", image.display()));
    repo::find_instsys(&deps, &mut ctx, &mut url, &dir).unwrap();

    assert_eq!(url.mount.as_deref(), Some(dir.as_path()));
    assert!(dir.join("IMAGE_OK").exists());
}

#[test]
fn test_find_instsys_second_payload() {
    let scratch = tempfile::tempdir().unwrap();

    let make_image = |name: &str| {
        let path = scratch.path().join(name);
        std::fs::write(&path, b"IMG data").unwrap();
        path
    };
    let image1 = make_image("root1.img");
    let image2 = make_image("root2.img");

    let mounter = MockMounter::new();
    let hardware = FixedHardware(Vec::new());
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();
    ctx.instsys2 = Some(Url::parse(&format!("file:{}", image2.display())));

    let dir = scratch.path().join("instsys");
    let mut url = Url::parse(&format!("file:{}", image1.display()));
    repo::find_instsys(&deps, &mut ctx, &mut url, &dir).unwrap();

    let url2 = ctx.instsys2.as_ref().unwrap();
    assert!(url2.mount.is_some());
    assert_ne!(url2.mount.as_deref(), Some(dir.as_path()));
}

#[test]
fn test_literal_device_hint_fallback() {
    let scratch = tempfile::tempdir().unwrap();
    let full = scratch.path().join("full");
    repo_tree(&full);

    // device exists but the hardware scan does not know it
    let mounter = MockMounter::new().with_device("/dev/vda1", &full);
    let hardware = FixedHardware(Vec::new());
    let deps = deps(&mounter, &hardware);

    let mut ctx = Context::new(scratch.path().join("work"));
    std::fs::create_dir_all(ctx.scratch()).unwrap();

    let mut url = Url::parse("disk:/repo?device=vda1");
    assert_eq!(url.device.as_deref(), Some("vda1"));
    mount::mount_url(&deps, &mut ctx, &mut url, None, None).unwrap();
    assert_eq!(url.used.device.as_deref(), Some("/dev/vda1"));
    assert!(url.mount.is_some());
}

#[test]
fn test_scheme_capabilities_drive_resolution() {
    // pure download schemes resolve without mounting anything
    let url = Url::parse("http://server/repo");
    assert!(url.is_network);
    assert!(!url.is_mountable);

    let url = Url::parse("cdrom:/");
    assert!(url.is_cdrom);
    assert!(url.is_mountable);
    assert_eq!(url.scheme, Scheme::Cdrom);
}
