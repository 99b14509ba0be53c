// src/repo/mod.rs

//! Repository and payload discovery.
//!
//! [`read_file`] fetches a file relative to an installation-source URL,
//! mounting the source first when necessary and checking the fetched
//! data against the digest manifest in secure mode.
//!
//! [`find_repository`] scans for a device carrying a repository: a
//! candidate counts as a repository when its `/content` manifest loads
//! (and verifies, in secure mode) and, for relative payload URLs, the
//! payload image can be made available. [`find_instsys`] resolves a
//! non-relative payload URL on its own.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::mount::{self, AcceptTest, Deps, PathType, Verdict};
use crate::progress::SilentProgress;
use crate::transfer::{self, FetchOptions};
use crate::url::{Scheme, Url};

/// Flags for [`read_file`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadFlags {
    pub unzip: bool,
    pub progress: bool,
    /// Skip the digest-manifest check even in secure mode (used for the
    /// manifest itself).
    pub no_digest: bool,
}

/// Verifies the repository manifest against its detached signature.
pub trait SignatureVerifier {
    fn verify(&self, manifest: &Path, signature: &Path) -> Result<bool>;
}

/// Accepts everything; for setups without a keyring.
pub struct NoVerifier;

impl SignatureVerifier for NoVerifier {
    fn verify(&self, _manifest: &Path, _signature: &Path) -> Result<bool> {
        Ok(true)
    }
}

/// Shells out to gpg with a dedicated keyring.
pub struct CommandVerifier {
    pub keyring: PathBuf,
}

impl SignatureVerifier for CommandVerifier {
    fn verify(&self, manifest: &Path, signature: &Path) -> Result<bool> {
        let status = Command::new("gpg")
            .arg("--batch")
            .arg("--no-default-keyring")
            .arg("--keyring")
            .arg(&self.keyring)
            .arg("--verify")
            .arg(signature)
            .arg(manifest)
            .status()
            .map_err(|e| Error::Other(format!("gpg: {e}")))?;
        Ok(status.success())
    }
}

/// Parse `<digest> <name>` manifest lines; other lines are ignored.
pub fn load_digest_manifest(path: &Path) -> Result<Vec<(String, String)>> {
    let text = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let (Some(digest), Some(name), None) = (parts.next(), parts.next(), parts.next()) {
            entries.push((digest.to_string(), name.to_string()));
        }
    }
    Ok(entries)
}

/// Join a relative file name onto a URL path without doubling slashes.
fn join_rel(base: &str, rel: &str) -> String {
    let rel = if rel == "/" { "" } else { rel };
    if base.is_empty() {
        return rel.to_string();
    }
    if rel.is_empty() {
        return base.to_string();
    }
    match (base.ends_with('/'), rel.starts_with('/')) {
        (true, true) => format!("{base}{}", &rel[1..]),
        (false, false) => format!("{base}/{rel}"),
        _ => format!("{base}{rel}"),
    }
}

/// Copies one file out of a (possibly just-mounted) source. Doubles as
/// the accept test for `read_file`'s device scan: a candidate that does
/// not hold the file is rejected.
struct CopyTest<'a> {
    src: &'a str,
    dst: &'a Path,
    label: Option<&'a str>,
    flags: ReadFlags,
}

impl CopyTest<'_> {
    fn copy(&self, deps: &Deps, ctx: &mut Context, url: &Url) -> bool {
        let mut fetch_url;

        if url.is_mountable && url.scheme != Scheme::File {
            let Some(mount) = &url.mount else {
                return false;
            };
            let candidate = mount.join(self.src.trim_start_matches('/'));
            if deps.mounter.path_type(&candidate) != PathType::File {
                tracing::debug!(file = %candidate.display(), "not present");
                return false;
            }
            fetch_url = Url::parse(&format!("file:{}", mount.display()));
        } else {
            fetch_url = url.clone();
        }

        fetch_url.path = join_rel(&fetch_url.path, self.src);

        let opts = FetchOptions {
            unzip: self.flags.unzip,
            label: self.label.map(str::to_string),
        };
        let progress = if self.flags.progress {
            deps.progress
        } else {
            &SilentProgress
        };

        tracing::info!(from = %fetch_url, to = %self.dst.display(), "loading");
        let digest = match transfer::fetch(deps.transport, &fetch_url, self.dst, &opts, progress) {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!(error = %e, code = e.code(), "load failed");
                return false;
            }
        };

        if ctx.secure {
            if self.flags.no_digest {
                tracing::debug!("digest not checked");
            } else if ctx.digest_matches(&digest, &fetch_url.path) {
                tracing::debug!(%digest, "digest ok");
            } else {
                tracing::warn!(%digest, path = %fetch_url.path, "digest check failed");
                ctx.digest_failed = true;
            }
        }

        true
    }
}

impl AcceptTest for CopyTest<'_> {
    fn accept(&mut self, deps: &Deps, ctx: &mut Context, url: &mut Url) -> Verdict {
        if self.copy(deps, ctx, url) {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }
}

/// Fetch `src`, interpreted relative to `url`, into `dst`.
///
/// With `src` of `None` the URL's own path is split into a source base
/// and the file to fetch, and `url` is updated in place to the base (so
/// later relative reads resolve against it). An unmounted mountable URL
/// is mounted first, scanning devices like [`mount::mount_url`].
pub fn read_file(
    deps: &Deps,
    ctx: &mut Context,
    url: &mut Url,
    dir: Option<&Path>,
    src: Option<&str>,
    dst: &Path,
    label: Option<&str>,
    flags: ReadFlags,
) -> Result<()> {
    let derived;
    let src = match src {
        Some(src) => src,
        None => {
            if url.mount.is_some() {
                return Err(Error::Other("no file name for mounted source".into()));
            }
            if url.scheme == Scheme::Nfs {
                // the last path component is the file, the rest the export
                let pos = url
                    .path
                    .rfind('/')
                    .ok_or_else(|| Error::Other(format!("bad nfs path: {}", url.path)))?;
                derived = url.path[pos + 1..].to_string();
                url.path.truncate(pos.max(1));
                &derived
            } else {
                derived = url.path.clone();
                url.path = if url.is_mountable {
                    "/".to_string()
                } else {
                    String::new()
                };
                &derived
            }
        }
    };

    let mut test = CopyTest {
        src,
        dst,
        label,
        flags,
    };

    if let Some(mount) = url.mount.clone() {
        // already mounted: read straight out of the mount
        let mut local = Url::parse(&format!("file:{}", mount.display()));
        if test.copy(deps, ctx, &mut local) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("{src} in {}", mount.display())))
        }
    } else if url.is_mountable && url.scheme != Scheme::File {
        mount::mount_url(deps, ctx, url, dir, Some(&mut test))
    } else if test.copy(deps, ctx, url) {
        Ok(())
    } else {
        Err(Error::NotFound(src.to_string()))
    }
}

/// Accept test for repository scanning.
struct RepoTest<'a> {
    verifier: &'a dyn SignatureVerifier,
}

impl RepoTest<'_> {
    /// Mount or download-and-mount one payload path at `mountpoint`.
    fn place_payload(
        &self,
        deps: &Deps,
        ctx: &mut Context,
        url: &mut Url,
        payload_path: &str,
        mountpoint: &Path,
        label: &str,
    ) -> bool {
        let in_place = !ctx.download_instsys
            && !ctx.rescue
            && url.is_mountable
            && url
                .mount
                .as_ref()
                .is_some_and(|m| {
                    deps.mounter
                        .is_mountable(&m.join(payload_path.trim_start_matches('/')))
                });

        if std::fs::create_dir_all(mountpoint).is_err() {
            return false;
        }

        if in_place {
            let src = url
                .mount
                .as_ref()
                .map(|m| m.join(payload_path.trim_start_matches('/')))
                .unwrap_or_default();
            match deps.mounter.mount_ro(&src, mountpoint) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(payload = payload_path, error = %e, "payload mount failed");
                    false
                }
            }
        } else {
            let download = ctx.new_download();
            let flags = ReadFlags {
                unzip: true,
                progress: true,
                no_digest: false,
            };
            if read_file(
                deps,
                ctx,
                url,
                None,
                Some(payload_path),
                &download,
                Some(label),
                flags,
            )
            .is_err()
            {
                return false;
            }
            match deps.mounter.mount_ro(&download, mountpoint) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(payload = payload_path, error = %e, "payload mount failed");
                    false
                }
            }
        }
    }
}

impl AcceptTest for RepoTest<'_> {
    fn accept(&mut self, deps: &Deps, ctx: &mut Context, url: &mut Url) -> Verdict {
        if url.is_mountable && url.mount.is_none() {
            return Verdict::Rejected;
        }
        let instsys = match &ctx.instsys {
            Some(u) if u.scheme != Scheme::None => (u.scheme, u.path.clone()),
            _ => return Verdict::Rejected,
        };

        ctx.digests.clear();

        let content = ctx.scratch().join("content");
        let no_digest = ReadFlags {
            no_digest: true,
            ..Default::default()
        };
        if read_file(
            deps,
            ctx,
            url,
            None,
            Some("/content"),
            &content,
            None,
            no_digest,
        )
        .is_err()
        {
            return Verdict::Rejected;
        }

        if ctx.secure {
            let signature = ctx.scratch().join("content.asc");
            if read_file(
                deps,
                ctx,
                url,
                None,
                Some("/content.asc"),
                &signature,
                None,
                no_digest,
            )
            .is_err()
            {
                return Verdict::Rejected;
            }
            match self.verifier.verify(&content, &signature) {
                Ok(true) => {
                    tracing::info!("signature ok");
                    ctx.digest_failed = false;
                }
                _ => {
                    tracing::warn!("signature check failed");
                    ctx.sig_failed = true;
                }
            }
            match load_digest_manifest(&content) {
                Ok(digests) => ctx.digests = digests,
                Err(e) => tracing::warn!(error = %e, "unreadable digest manifest"),
            }
        }

        // non-relative payloads are resolved separately
        let (instsys_scheme, instsys_path) = instsys;
        if instsys_scheme != Scheme::Rel {
            return Verdict::Accepted;
        }

        if url.is_mountable {
            let present = url
                .mount
                .as_ref()
                .map(|m| m.join(instsys_path.trim_start_matches('/')))
                .is_some_and(|p| deps.mounter.path_type(&p) != PathType::Missing);
            if !present {
                tracing::info!(payload = %instsys_path, "payload missing");
                return Verdict::Rejected;
            }
        }

        let instsys_dir = ctx.instsys_dir.clone();
        if !self.place_payload(deps, ctx, url, &instsys_path, &instsys_dir, "installer") {
            return Verdict::Rejected;
        }
        if let Some(u) = ctx.instsys.as_mut() {
            u.mount = Some(instsys_dir);
        }

        if ctx.wants_instsys2() {
            let path2 = match &ctx.instsys2 {
                Some(u) => u.path.clone(),
                None => return Verdict::Rejected,
            };
            let dir2 = match ctx.new_mountpoint() {
                Ok(d) => d,
                Err(_) => return Verdict::Rejected,
            };
            if !self.place_payload(deps, ctx, url, &path2, &dir2, "fonts") {
                if let Some(u) = ctx.instsys2.as_mut() {
                    u.mount = None;
                }
                return Verdict::Rejected;
            }
            if let Some(u) = ctx.instsys2.as_mut() {
                u.mount = Some(dir2);
            }
        }

        Verdict::Accepted
    }
}

/// Find and mount a repository for `url`, scanning devices as needed.
/// A relative payload URL in the context is mounted along the way.
pub fn find_repository(
    deps: &Deps,
    verifier: &dyn SignatureVerifier,
    ctx: &mut Context,
    url: &mut Url,
    dir: Option<&Path>,
) -> Result<()> {
    tracing::info!(url = %url, "repository: looking");

    let mut test = RepoTest { verifier };
    match mount::mount_url(deps, ctx, url, dir, Some(&mut test)) {
        Ok(()) => {
            tracing::info!(url = %url, mount = ?url.mount, "repository: using");
            Ok(())
        }
        Err(e) => {
            tracing::info!("repository: not found");
            Err(e)
        }
    }
}

/// Resolve a payload URL that is not relative to the repository: mount
/// it at `dir`, downloading and loopback-mounting when the source
/// cannot be mounted directly. The secondary payload, if wanted, is
/// placed at a fresh mountpoint.
pub fn find_instsys(deps: &Deps, ctx: &mut Context, url: &mut Url, dir: &Path) -> Result<()> {
    if url.scheme == Scheme::None || url.scheme == Scheme::Rel || url.path.is_empty() {
        return Err(Error::Other("unusable payload url".into()));
    }

    if ctx.download_instsys || ctx.rescue {
        url.download = true;
    }
    place_remote_payload(deps, ctx, url, dir, "installer")?;

    if ctx.wants_instsys2() {
        // take it out of the context to sidestep aliasing with ctx
        let Some(mut url2) = ctx.instsys2.take() else {
            return Ok(());
        };
        let dir2 = ctx.new_mountpoint()?;
        let result = place_remote_payload(deps, ctx, &mut url2, &dir2, "fonts");
        ctx.instsys2 = Some(url2);
        result?;
    }

    Ok(())
}

fn place_remote_payload(
    deps: &Deps,
    ctx: &mut Context,
    url: &mut Url,
    dir: &Path,
    label: &str,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    if url.is_mountable {
        return mount::mount_url(deps, ctx, url, Some(dir), None);
    }

    let download = ctx.new_download();
    let flags = ReadFlags {
        unzip: true,
        progress: true,
        no_digest: false,
    };
    read_file(deps, ctx, url, None, None, &download, Some(label), flags)?;
    deps.mounter
        .mount_ro(&download, dir)
        .map_err(|e| Error::Mount(format!("{}: {e}", download.display())))?;
    url.mount = Some(dir.to_path_buf());
    Ok(())
}
