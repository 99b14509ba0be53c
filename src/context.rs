// src/context.rs

//! Shared resolver state.
//!
//! Everything the original installer kept in process globals lives here
//! and is passed `&mut` through the resolution pipeline: scratch space
//! for mountpoints and downloads, the network configuration record, the
//! digest manifest, and the secondary-payload policy.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::url::Url;

/// How the current network device was configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetConfigured {
    #[default]
    None,
    Static,
    Dhcp,
    Bootp,
}

/// Identity and state of the interface brought up for network sources.
#[derive(Debug, Clone, Default)]
pub struct NetConfig {
    pub configured: NetConfigured,
    pub device: Option<String>,
    pub hwaddr: Option<String>,
    pub cardname: Option<String>,
    pub unique_id: Option<String>,
    /// Prefer DHCP over BOOTP when no static config is present.
    pub use_dhcp: bool,
}

pub struct Context {
    scratch: PathBuf,
    /// Keeps an ephemeral scratch dir alive for the context's lifetime.
    _scratch_guard: Option<tempfile::TempDir>,
    mountpoint_seq: u32,
    download_seq: u32,

    /// Where the primary payload gets mounted.
    pub instsys_dir: PathBuf,

    pub net: NetConfig,

    /// Verify digests and repository signatures.
    pub secure: bool,
    /// A file failed its digest-manifest check. Recorded, not fatal.
    pub digest_failed: bool,
    /// The repository manifest signature did not verify.
    pub sig_failed: bool,
    /// `(digest, file name)` pairs from the repository manifest.
    pub digests: Vec<(String, String)>,

    /// Secondary payload requested at boot, resolved during discovery.
    pub instsys: Option<Url>,
    pub instsys2: Option<Url>,
    /// Copy the payload instead of mounting it from the source.
    pub download_instsys: bool,
    pub rescue: bool,
    pub second_payload_enabled: bool,
}

impl Context {
    pub fn new(scratch: impl Into<PathBuf>) -> Context {
        let scratch = scratch.into();
        Context {
            instsys_dir: scratch.join("instsys"),
            scratch,
            _scratch_guard: None,
            mountpoint_seq: 0,
            download_seq: 0,
            net: NetConfig::default(),
            secure: false,
            digest_failed: false,
            sig_failed: false,
            digests: Vec::new(),
            instsys: None,
            instsys2: None,
            download_instsys: false,
            rescue: false,
            second_payload_enabled: true,
        }
    }

    /// Context backed by a temporary scratch dir, removed on drop.
    pub fn ephemeral() -> Result<Context> {
        let dir = tempfile::tempdir()?;
        let mut ctx = Context::new(dir.path());
        ctx._scratch_guard = Some(dir);
        Ok(ctx)
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Fresh, existing directory to mount on.
    pub fn new_mountpoint(&mut self) -> Result<PathBuf> {
        self.mountpoint_seq += 1;
        let dir = self.scratch.join(format!("mp_{:04}", self.mountpoint_seq));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Fresh path for a downloaded file. Not created; the transfer
    /// pipeline creates it.
    pub fn new_download(&mut self) -> PathBuf {
        self.download_seq += 1;
        self.scratch.join(format!("file_{:04}", self.download_seq))
    }

    /// Is `digest` listed in the manifest under a name that matches the
    /// tail of the fetched path? Unlisted files never pass.
    pub fn digest_matches(&self, digest: &str, path: &str) -> bool {
        self.digests
            .iter()
            .any(|(d, name)| d == digest && path.ends_with(name.as_str()))
    }

    /// Whether discovery should also resolve the second payload.
    pub fn wants_instsys2(&self) -> bool {
        self.instsys2.is_some() && !self.rescue && self.second_payload_enabled
    }
}
