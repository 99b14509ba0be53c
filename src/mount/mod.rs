// src/mount/mod.rs

//! Mount orchestration.
//!
//! [`mount_candidate`] makes one concrete device or endpoint usable for
//! a URL: it sets up the device (filesystem probe for local devices,
//! network bootstrap for network schemes), performs the scheme-specific
//! mount dance, classifies the target path, and runs the caller's accept
//! test. [`mount_url`] drives it over all matching hardware candidates
//! until one is accepted.
//!
//! On any rejection everything the attempt mounted is unmounted again;
//! `url.mount`/`url.tmp_mount` are only left set on success.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::hwdetect::{self, HardwareClass, HardwareList};
use crate::net::{self, NetworkOps, SlpDiscovery};
use crate::progress::ProgressTracker;
use crate::transfer::{self, FetchOptions, Transport};
use crate::url::{long_dev, short_dev, Scheme, Url, Used};

/// What a path turned out to be after mounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Missing,
    File,
    BlockDev,
    Dir,
    Other,
}

/// Mount failures that matter to the orchestrator. `NotDir`/`NotFound`
/// drive the NFS parent-directory fallback.
#[derive(Debug)]
pub enum MountError {
    NotDir,
    NotFound,
    Failed(String),
}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountError::NotDir => write!(f, "not a directory"),
            MountError::NotFound => write!(f, "no such file or directory"),
            MountError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

/// Filesystem mounting, behind a trait so resolution logic is testable
/// without root privileges.
pub trait Mounter {
    /// Read-only mount of a block device, image file, or directory
    /// (bind) at `dir`.
    fn mount_ro(&self, what: &Path, dir: &Path) -> std::result::Result<(), MountError>;

    /// Returns true if `dir` was unmounted.
    fn umount(&self, dir: &Path) -> bool;

    fn mount_nfs(
        &self,
        server: &str,
        export: &str,
        dir: &Path,
    ) -> std::result::Result<(), MountError>;

    #[allow(clippy::too_many_arguments)]
    fn mount_smb(
        &self,
        server: &str,
        share: &str,
        user: Option<&str>,
        password: Option<&str>,
        domain: Option<&str>,
        dir: &Path,
    ) -> std::result::Result<(), MountError>;

    fn path_type(&self, path: &Path) -> PathType;

    /// Could `path` be mounted directly (recognizable filesystem)?
    fn is_mountable(&self, path: &Path) -> bool;

    /// Filesystem type by content probe, `None` if unrecognized.
    fn fstype(&self, device: &Path) -> Option<String>;
}

/// Accept-test result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Rejected,
    Accepted,
    /// Usable, but keep scanning for a better candidate.
    AcceptedContinue,
}

/// Caller-supplied check run against a freshly mounted candidate.
pub trait AcceptTest {
    fn accept(&mut self, deps: &Deps, ctx: &mut Context, url: &mut Url) -> Verdict;
}

/// Collaborator bundle threaded through resolution.
pub struct Deps<'a> {
    pub mounter: &'a dyn Mounter,
    pub hardware: &'a dyn HardwareList,
    pub net: &'a dyn NetworkOps,
    pub slp: Option<&'a dyn SlpDiscovery>,
    pub transport: &'a dyn Transport,
    pub progress: &'a dyn ProgressTracker,
}

/// Unmount and forget both of a URL's mountpoints.
pub fn umount_url(mounter: &dyn Mounter, url: &mut Url) {
    if let Some(dir) = url.mount.take() {
        mounter.umount(&dir);
    }
    if let Some(dir) = url.tmp_mount.take() {
        mounter.umount(&dir);
    }
}

fn join_mount(base: &Path, path: &str) -> PathBuf {
    base.join(path.trim_start_matches('/'))
}

/// Mount one concrete candidate (`url.used.device` must be set except
/// for `file:`) at `dir`, or at a fresh mountpoint if `dir` is `None`,
/// then run the accept test.
pub fn mount_candidate<'a>(
    deps: &Deps,
    ctx: &mut Context,
    url: &mut Url,
    dir: Option<&Path>,
    mut test: Option<&mut (dyn AcceptTest + 'a)>,
) -> Verdict {
    tracing::info!(url = %url, model = url.used.model.as_deref().unwrap_or(""), "trying");

    if url.scheme == Scheme::None
        || url.path.is_empty()
        || (url.used.device.is_none() && url.scheme != Scheme::File)
    {
        return Verdict::Rejected;
    }

    umount_url(deps.mounter, url);

    let verdict = match try_candidate(deps, ctx, url, dir) {
        Ok(true) => Verdict::Accepted,
        Ok(false) => Verdict::Rejected,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "mount attempt failed");
            Verdict::Rejected
        }
    };

    let verdict = if verdict == Verdict::Accepted {
        match test.as_deref_mut() {
            Some(test) => {
                let v = test.accept(deps, ctx, url);
                if v == Verdict::Rejected {
                    tracing::info!(url = %url, "mount ok but test failed");
                }
                v
            }
            None => Verdict::Accepted,
        }
    } else {
        verdict
    };

    if verdict == Verdict::Rejected {
        tracing::info!(url = %url, "candidate failed");
        umount_url(deps.mounter, url);
    } else {
        tracing::info!(url = %url, mount = ?url.mount, "mounted");
    }

    verdict
}

/// The mount dance proper. Returns Ok(true) when the URL is usable.
fn try_candidate(deps: &Deps, ctx: &mut Context, url: &mut Url, dir: Option<&Path>) -> Result<bool> {
    // device setup
    if url.scheme != Scheme::File {
        if url.is_network {
            if let Err(e) = net::bring_up(ctx, deps.net, deps.slp, url) {
                tracing::warn!(error = %e, "network setup failed");
                return Ok(false);
            }
        } else {
            let device = long_dev(url.used.device.as_deref().unwrap_or_default());
            match deps.mounter.fstype(Path::new(&device)) {
                Some(t) if t != "swap" => {}
                other => {
                    tracing::info!(device, fstype = ?other, "not a usable filesystem");
                    return Ok(false);
                }
            }
        }
    }

    // scheme-specific mounting; `target` is the path holding the data
    let mut target: Option<PathBuf> = None;

    if !url.is_network {
        if url.scheme != Scheme::File && url.path != "/" {
            let device = long_dev(url.used.device.as_deref().unwrap_or_default());
            let tmp = ctx.new_mountpoint()?;
            if let Err(e) = deps.mounter.mount_ro(Path::new(&device), &tmp) {
                tracing::info!(device, error = %e, "mount failed");
                return Ok(false);
            }
            url.tmp_mount = Some(tmp.clone());
            target = Some(join_mount(&tmp, &url.path));
        } else if url.scheme == Scheme::File {
            target = Some(PathBuf::from(&url.path));
        } else {
            target = Some(PathBuf::from(long_dev(
                url.used.device.as_deref().unwrap_or_default(),
            )));
        }
    } else {
        match url.scheme {
            Scheme::Nfs => {
                let server = url
                    .used
                    .server
                    .clone()
                    .or_else(|| url.server.clone())
                    .ok_or_else(|| Error::Mount("nfs: no server".into()))?;
                let mp = match dir {
                    Some(d) => d.to_path_buf(),
                    None => ctx.new_mountpoint()?,
                };
                match deps.mounter.mount_nfs(&server, &url.path, &mp) {
                    Ok(()) => {
                        url.mount = Some(mp.clone());
                        target = Some(mp);
                    }
                    Err(e @ (MountError::NotDir | MountError::NotFound)) => {
                        tracing::info!(path = %url.path, error = %e, "nfs: retrying parent directory");
                        // the export may end one component up, with the
                        // leaf being a file inside it
                        if let Some(pos) = url.path.rfind('/') {
                            let leaf = &url.path[pos + 1..];
                            if pos > 0 && !leaf.is_empty() {
                                let parent = url.path[..pos].to_string();
                                let leaf = leaf.to_string();
                                let tmp = ctx.new_mountpoint()?;
                                match deps.mounter.mount_nfs(&server, &parent, &tmp) {
                                    Ok(()) => {
                                        url.tmp_mount = Some(tmp.clone());
                                        target = Some(tmp.join(leaf));
                                    }
                                    Err(e) => {
                                        tracing::info!(parent, error = %e, "nfs: mount failed");
                                        return Ok(false);
                                    }
                                }
                            } else {
                                return Ok(false);
                            }
                        } else {
                            return Ok(false);
                        }
                    }
                    Err(e) => {
                        tracing::info!(path = %url.path, error = %e, "nfs: mount failed");
                        return Ok(false);
                    }
                }
            }

            Scheme::Smb => {
                let server = url
                    .used
                    .server
                    .clone()
                    .or_else(|| url.server.clone())
                    .ok_or_else(|| Error::Mount("smb: no server".into()))?;
                let share = url
                    .share
                    .clone()
                    .ok_or_else(|| Error::Mount("smb: no share".into()))?;
                // whole-share urls mount straight at the target dir,
                // sub-paths go via a temporary share mount
                let whole_share = url.path == "/";
                let mp = if whole_share {
                    match dir {
                        Some(d) => d.to_path_buf(),
                        None => ctx.new_mountpoint()?,
                    }
                } else {
                    ctx.new_mountpoint()?
                };
                match deps.mounter.mount_smb(
                    &server,
                    &share,
                    url.user.as_deref(),
                    url.password.as_deref(),
                    url.domain.as_deref(),
                    &mp,
                ) {
                    Ok(()) => {
                        if whole_share {
                            url.mount = Some(mp.clone());
                            target = Some(mp);
                        } else {
                            url.tmp_mount = Some(mp.clone());
                            target = Some(join_mount(&mp, &url.path));
                        }
                    }
                    Err(e) => {
                        tracing::info!(share, error = %e, "smb: mount failed");
                        return Ok(false);
                    }
                }
            }

            // pure download schemes have nothing to mount
            Scheme::Http | Scheme::Https | Scheme::Ftp | Scheme::Tftp => {}

            scheme => {
                tracing::warn!(%scheme, "unsupported scheme");
                return Ok(false);
            }
        }
    }

    if !url.is_mountable {
        return Ok(true);
    }

    let Some(target) = target else {
        return Ok(false);
    };

    let file_type = deps.mounter.path_type(&target);
    if file_type == PathType::File {
        url.is_file = true;
    }

    match file_type {
        PathType::Missing | PathType::Other => {
            tracing::info!(target = %target.display(), "no usable data");
            Ok(false)
        }
        PathType::File | PathType::BlockDev
            if url.download || !deps.mounter.is_mountable(&target) =>
        {
            // copy (decompressing if needed), then loopback-mount the copy
            let mp = match dir {
                Some(d) => d.to_path_buf(),
                None => ctx.new_mountpoint()?,
            };
            url.mount = Some(mp.clone());

            let src = Url::parse(&format!("file:{}", target.display()));
            let download = ctx.new_download();
            let opts = FetchOptions {
                unzip: true,
                label: None,
            };
            match transfer::fetch(deps.transport, &src, &download, &opts, deps.progress) {
                Ok(_) => {
                    if let Err(e) = deps.mounter.mount_ro(&download, &mp) {
                        tracing::info!(error = %e, "image mount failed");
                        let _ = std::fs::remove_file(&download);
                        Ok(false)
                    } else {
                        Ok(true)
                    }
                }
                Err(e) => {
                    tracing::info!(error = %e, "image download failed");
                    let _ = std::fs::remove_file(&download);
                    Ok(false)
                }
            }
        }
        _ => {
            if url.mount.is_none() {
                let mp = match dir {
                    Some(d) => d.to_path_buf(),
                    None => ctx.new_mountpoint()?,
                };
                url.mount = Some(mp.clone());
                match deps.mounter.mount_ro(&target, &mp) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        tracing::info!(target = %target.display(), error = %e, "mount failed");
                        Ok(false)
                    }
                }
            } else {
                // already mounted at the right place
                Ok(true)
            }
        }
    }
}

/// Resolve and mount `url`, scanning matching hardware when no concrete
/// device has been picked yet. On success `url.used` names the device
/// and `url.mount`/`url.tmp_mount` the active mounts.
pub fn mount_url<'a>(
    deps: &Deps,
    ctx: &mut Context,
    url: &mut Url,
    dir: Option<&Path>,
    mut test: Option<&mut (dyn AcceptTest + 'a)>,
) -> Result<()> {
    if url.scheme == Scheme::None {
        return Err(Error::NotFound("no scheme".into()));
    }

    // a concrete device (or a plain file) skips the scan
    if url.scheme == Scheme::File || url.used.device.is_some() {
        return match mount_candidate(deps, ctx, url, dir, test.as_deref_mut()) {
            Verdict::Rejected => Err(Error::Mount(url.format(crate::url::UrlFormat::Log))),
            _ => Ok(()),
        };
    }

    let hint = url.device.clone();
    let candidates = hwdetect::find_candidates(deps.hardware, url.scheme, hint.as_deref());
    tracing::info!(url = %url, candidates = candidates.len(), "scanning devices");

    let mut found = false;
    let mut err = false;

    for candidate in &candidates {
        let Some(device) = candidate.device.clone() else {
            continue;
        };
        url.used.unique_id = candidate.unique_id.clone();
        url.used.hwaddr = candidate.hwaddr.clone();
        url.used.model = match candidate.model.as_deref() {
            // bare "Partition" tells the user nothing
            Some("Partition") => Some(format!("Partition: {}", short_dev(&device))),
            other => other.map(str::to_string),
        };
        url.used.device = Some(device);
        url.is_wlan = candidate.is_wlan;

        match mount_candidate(deps, ctx, url, dir, test.as_deref_mut()) {
            Verdict::Rejected => err = true,
            Verdict::Accepted => {
                found = true;
                if candidate.is_class(HardwareClass::Cdrom) {
                    url.is_cdrom = true;
                }
                break;
            }
            Verdict::AcceptedContinue => {
                found = true;
                if candidate.is_class(HardwareClass::Cdrom) {
                    url.is_cdrom = true;
                }
            }
        }
    }

    // hinted device missing from the scan: try it literally, but only
    // if no scanned candidate was attempted at all
    if !err && !found && url.used.device.is_none() {
        if let Some(hint) = &hint {
            url.used = Used {
                device: Some(long_dev(hint)),
                ..Used::default()
            };
            match mount_candidate(deps, ctx, url, dir, test.as_deref_mut()) {
                Verdict::Rejected => err = true,
                _ => found = true,
            }
        }
    }

    if found {
        return Ok(());
    }

    url.used.clear();
    if err {
        Err(Error::Mount(url.format(crate::url::UrlFormat::Log)))
    } else {
        Err(Error::NotFound(url.format(crate::url::UrlFormat::Log)))
    }
}

/// Real mounter: mount(2) for block devices and directories, mount(8)
/// for image files and network filesystems.
pub struct SysMounter;

const BLOCK_FSTYPES: &[&str] = &[
    "iso9660", "udf", "squashfs", "cramfs", "ext4", "ext3", "ext2", "vfat", "xfs", "btrfs",
    "reiserfs",
];

impl SysMounter {
    fn run_mount(args: &[&str]) -> std::result::Result<(), MountError> {
        let output = Command::new("mount")
            .args(args)
            .output()
            .map_err(|e| MountError::Failed(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.contains("Not a directory") {
            Err(MountError::NotDir)
        } else if stderr.contains("No such file or directory")
            || stderr.contains("does not exist")
        {
            Err(MountError::NotFound)
        } else {
            Err(MountError::Failed(stderr.to_string()))
        }
    }
}

impl Mounter for SysMounter {
    fn mount_ro(&self, what: &Path, dir: &Path) -> std::result::Result<(), MountError> {
        use nix::mount::{mount, MsFlags};

        match self.path_type(what) {
            PathType::Dir => {
                mount(
                    Some(what),
                    dir,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(|e| MountError::Failed(e.to_string()))?;
                // MS_RDONLY is ignored on the bind itself; it only takes
                // effect on a remount of the new mount
                mount(
                    None::<&str>,
                    dir,
                    None::<&str>,
                    MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
                .map_err(|e| MountError::Failed(e.to_string()))
            }
            PathType::BlockDev => {
                let mut tried = Vec::new();
                if let Some(t) = self.fstype(what) {
                    tried.push(t);
                }
                tried.extend(BLOCK_FSTYPES.iter().map(|t| t.to_string()));
                let mut last = MountError::Failed("no filesystem type".into());
                for fstype in tried {
                    match mount(
                        Some(what),
                        dir,
                        Some(fstype.as_str()),
                        MsFlags::MS_RDONLY,
                        None::<&str>,
                    ) {
                        Ok(()) => return Ok(()),
                        Err(e) => last = MountError::Failed(format!("{fstype}: {e}")),
                    }
                }
                Err(last)
            }
            PathType::File => {
                let what = what.to_string_lossy();
                let dir = dir.to_string_lossy();
                Self::run_mount(&["-o", "loop,ro", &what, &dir])
            }
            _ => Err(MountError::NotFound),
        }
    }

    fn umount(&self, dir: &Path) -> bool {
        nix::mount::umount(dir).is_ok()
    }

    fn mount_nfs(
        &self,
        server: &str,
        export: &str,
        dir: &Path,
    ) -> std::result::Result<(), MountError> {
        let src = format!("{server}:{export}");
        let dir = dir.to_string_lossy();
        Self::run_mount(&["-t", "nfs", "-o", "ro,nolock", &src, &dir])
    }

    fn mount_smb(
        &self,
        server: &str,
        share: &str,
        user: Option<&str>,
        password: Option<&str>,
        domain: Option<&str>,
        dir: &Path,
    ) -> std::result::Result<(), MountError> {
        let src = format!("//{server}/{share}");
        let mut opts = String::from("ro");
        match user {
            Some(user) => {
                opts.push_str(&format!(",username={user}"));
                opts.push_str(&format!(",password={}", password.unwrap_or_default()));
            }
            None => opts.push_str(",guest"),
        }
        if let Some(domain) = domain {
            opts.push_str(&format!(",domain={domain}"));
        }
        let dir = dir.to_string_lossy();
        Self::run_mount(&["-t", "cifs", "-o", &opts, &src, &dir])
    }

    fn path_type(&self, path: &Path) -> PathType {
        use std::os::unix::fs::FileTypeExt;

        match std::fs::metadata(path) {
            Ok(meta) => {
                let ft = meta.file_type();
                if ft.is_dir() {
                    PathType::Dir
                } else if ft.is_file() {
                    PathType::File
                } else if ft.is_block_device() {
                    PathType::BlockDev
                } else {
                    PathType::Other
                }
            }
            Err(_) => PathType::Missing,
        }
    }

    fn is_mountable(&self, path: &Path) -> bool {
        match self.path_type(path) {
            PathType::Dir => true,
            PathType::File | PathType::BlockDev => {
                matches!(self.fstype(path), Some(t) if t != "swap" && t != "gzip")
            }
            _ => false,
        }
    }

    fn fstype(&self, device: &Path) -> Option<String> {
        let mut file = std::fs::File::open(device).ok()?;
        let mut buf = vec![0u8; 0x11000];
        let mut len = 0;
        while len < buf.len() {
            match std::io::Read::read(&mut file, &mut buf[len..]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(_) => break,
            }
        }
        buf.truncate(len);
        probe_fstype(&buf).map(str::to_string)
    }
}

/// Magic-byte filesystem probe, enough for the types an installation
/// medium plausibly carries.
fn probe_fstype(buf: &[u8]) -> Option<&'static str> {
    fn at<'a>(buf: &'a [u8], offset: usize, len: usize) -> Option<&'a [u8]> {
        buf.get(offset..offset + len)
    }

    if at(buf, 0, 2) == Some(&[0x1f, 0x8b]) {
        return Some("gzip");
    }
    if at(buf, 0, 4) == Some(b"hsqs") {
        return Some("squashfs");
    }
    if let Some(magic) = at(buf, 0, 4) {
        let m = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);
        if m == 0x28cd3d45 || m == 0x453dcd28 {
            return Some("cramfs");
        }
    }
    if at(buf, 0, 4) == Some(b"XFSB") {
        return Some("xfs");
    }
    if at(buf, 4086, 10) == Some(b"SWAPSPACE2") || at(buf, 4086, 10) == Some(b"SWAP-SPACE") {
        return Some("swap");
    }
    if at(buf, 0x8001, 5) == Some(b"CD001") {
        return Some("iso9660");
    }
    if at(buf, 0x400 + 0x38, 2) == Some(&[0x53, 0xef]) {
        return Some("ext4");
    }
    if at(buf, 0x10040, 8) == Some(b"_BHRfS_M") {
        return Some("btrfs");
    }
    if at(buf, 510, 2) == Some(&[0x55, 0xaa])
        && (at(buf, 82, 5) == Some(b"FAT32") || at(buf, 54, 3) == Some(b"FAT"))
    {
        return Some("vfat");
    }
    None
}
