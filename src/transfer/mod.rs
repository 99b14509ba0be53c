// src/transfer/mod.rs

//! Byte-stream transfer pipeline.
//!
//! [`fetch`] copies an installation source to a local destination file
//! through a [`Transport`], sniffing the first block of the stream to
//! recognize gzip data and cramfs images. Gzip streams are piped through
//! an external `gzip -dc` child when decompression was requested; the
//! embedded gzip file name (and the cramfs volume name) may carry the
//! uncompressed size, which drives percent-accurate progress.
//!
//! A SHA-256 digest over the raw (pre-decompression) bytes is returned
//! for manifest verification.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::url::{Scheme, Url, UrlFormat};

const SNIFF_LEN: usize = 256;
const CHUNK_LEN: usize = 8192;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_FLAG_NAME: u8 = 0x08;
const GZIP_NAME_OFFSET: usize = 10;

const CRAMFS_MAGIC: u32 = 0x28cd3d45;
const CRAMFS_SUPER_LEN: usize = 64;
const CRAMFS_NAME_OFFSET: usize = 48;
const CRAMFS_NAME_LEN: usize = 16;

/// An opened byte stream plus its raw length, when the transport knows it.
pub struct TransportStream {
    pub reader: Box<dyn Read>,
    pub total: Option<u64>,
}

/// Opens a URL for reading. One implementation per transfer family.
pub trait Transport {
    fn open(&self, url: &Url) -> Result<TransportStream>;
}

/// Local files, including files inside already-mounted sources.
pub struct FileTransport;

impl Transport for FileTransport {
    fn open(&self, url: &Url) -> Result<TransportStream> {
        let file = File::open(&url.path).map_err(|e| {
            Error::Transport {
                code: 1,
                message: format!("{}: {e}", url.path),
            }
        })?;
        let total = file.metadata().ok().map(|m| m.len());
        Ok(TransportStream {
            reader: Box::new(file),
            total,
        })
    }
}

/// HTTP(S) transport. Certificate verification is off: boot environments
/// have no trust store and the payload is digest-checked separately.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Transport {
                code: 2,
                message: e.to_string(),
            })?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &Url) -> Result<TransportStream> {
        // contact the resolved address when network bootstrap supplied one
        let mut effective = url.clone();
        if let Some(addr) = &url.used.server {
            effective.server = Some(addr.clone());
        }
        let text = effective.format(UrlFormat::PlainNoQuery);

        let response = self.client.get(&text).send().map_err(|e| Error::Transport {
            code: e.status().map(|s| s.as_u16() as i32).unwrap_or(7),
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport {
                code: status.as_u16() as i32,
                message: format!("{text}: {status}"),
            });
        }
        let total = response.content_length();
        Ok(TransportStream {
            reader: Box::new(response),
            total,
        })
    }
}

/// Scheme-dispatching transport used by the orchestrator and the CLI.
pub struct DefaultTransport {
    http: HttpTransport,
}

impl DefaultTransport {
    pub fn new() -> Result<DefaultTransport> {
        Ok(DefaultTransport {
            http: HttpTransport::new()?,
        })
    }
}

impl Transport for DefaultTransport {
    fn open(&self, url: &Url) -> Result<TransportStream> {
        match url.scheme {
            Scheme::File | Scheme::Rel | Scheme::Exec => FileTransport.open(url),
            Scheme::Http | Scheme::Https => self.http.open(url),
            scheme => Err(Error::Transport {
                code: 1,
                message: format!("no transport for {scheme} urls"),
            }),
        }
    }
}

/// Per-transfer options.
#[derive(Default)]
pub struct FetchOptions {
    /// Decompress a gzip stream through `gzip -dc`.
    pub unzip: bool,
    /// Progress label; defaults to the URL itself.
    pub label: Option<String>,
}

/// What the first block of the stream told us.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Sniff {
    pub gzip: bool,
    /// Uncompressed size hint from the gzip name or cramfs volume name.
    pub dec_total: Option<u64>,
}

/// `<word> <integer>` names encode the uncompressed size in KiB.
pub(crate) fn parse_size_name(name: &str) -> Option<u64> {
    let mut parts = name.split_whitespace();
    let word = parts.next()?;
    let size: u64 = parts.next()?.parse().ok()?;
    if word.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(size << 10)
}

pub(crate) fn sniff(buf: &[u8], unzip: bool) -> Sniff {
    let mut result = Sniff::default();

    // gzip only counts when decompression was asked for; otherwise the
    // stream is copied raw and the raw totals drive progress
    if unzip && buf.len() >= 2 && buf[..2] == GZIP_MAGIC {
        result.gzip = true;
        if buf.len() > GZIP_NAME_OFFSET && buf[3] & GZIP_FLAG_NAME != 0 {
            let tail = &buf[GZIP_NAME_OFFSET..];
            if let Some(end) = tail.iter().position(|&b| b == 0) {
                if let Ok(name) = std::str::from_utf8(&tail[..end]) {
                    result.dec_total = parse_size_name(name);
                }
            }
        }
        return result;
    }

    if buf.len() >= CRAMFS_SUPER_LEN {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic == CRAMFS_MAGIC || magic == CRAMFS_MAGIC.swap_bytes() {
            let name = &buf[CRAMFS_NAME_OFFSET..CRAMFS_NAME_OFFSET + CRAMFS_NAME_LEN];
            let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
            if let Ok(name) = std::str::from_utf8(&name[..end]) {
                result.dec_total = parse_size_name(name.trim());
            }
        }
    }

    result
}

/// Ignores SIGPIPE for the duration of a transfer so an exiting gzip
/// child surfaces as a write error instead of killing the process.
struct SigPipeGuard {
    old: nix::sys::signal::SigAction,
}

impl SigPipeGuard {
    fn install() -> Result<SigPipeGuard> {
        use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let old = unsafe { signal::sigaction(Signal::SIGPIPE, &ignore) }
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        Ok(SigPipeGuard { old })
    }
}

impl Drop for SigPipeGuard {
    fn drop(&mut self) {
        use nix::sys::signal::{self, Signal};
        unsafe {
            let _ = signal::sigaction(Signal::SIGPIPE, &self.old);
        }
    }
}

enum Sink {
    Direct(File),
    Gzip {
        child: Child,
        stderr: tempfile::NamedTempFile,
    },
}

impl Sink {
    fn open(dest: &Path, gzip: bool) -> Result<Sink> {
        let file = File::create(dest).map_err(|e| Error::OpenDestination {
            path: dest.display().to_string(),
            message: e.to_string(),
        })?;

        if !gzip {
            return Ok(Sink::Direct(file));
        }

        let stderr = tempfile::NamedTempFile::new()?;
        let stderr_handle = stderr.reopen()?;
        let child = Command::new("gzip")
            .arg("-dc")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(file))
            .stderr(Stdio::from(stderr_handle))
            .spawn()
            .map_err(|e| Error::Decompress(format!("failed to start gzip: {e}")))?;
        Ok(Sink::Gzip { child, stderr })
    }

    fn write_chunk(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Direct(file) => file.write_all(buf),
            Sink::Gzip { child, .. } => match child.stdin.as_mut() {
                Some(stdin) => stdin.write_all(buf),
                None => Err(std::io::Error::other("gzip stdin closed")),
            },
        }
    }

    fn child_error(stderr: &mut tempfile::NamedTempFile, status: std::process::ExitStatus) -> Error {
        let mut message = String::new();
        let _ = stderr.as_file_mut().sync_all();
        if let Ok(mut f) = stderr.reopen() {
            let _ = f.read_to_string(&mut message);
        }
        let message = message.trim();
        if message.is_empty() {
            Error::Decompress(format!("gzip exited with {status}"))
        } else {
            Error::Decompress(message.to_string())
        }
    }

    /// Close the sink. Gzip exit status 2 (warnings, e.g. trailing
    /// garbage) counts as success.
    fn finish(self) -> Result<()> {
        match self {
            Sink::Direct(file) => file
                .sync_all()
                .map_err(|e| Error::CloseFailed(e.to_string())),
            Sink::Gzip {
                mut child,
                mut stderr,
            } => {
                drop(child.stdin.take());
                let status = child
                    .wait()
                    .map_err(|e| Error::CloseFailed(e.to_string()))?;
                match status.code() {
                    Some(0) | Some(2) => Ok(()),
                    _ => Err(Self::child_error(&mut stderr, status)),
                }
            }
        }
    }

    /// Tear down a sink whose transfer is not going to finish. The
    /// child must still be reaped or it lingers as a zombie.
    fn abort(self) {
        if let Sink::Gzip { mut child, .. } = self {
            drop(child.stdin.take());
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Best effort after a write error: the child's stderr usually has
    /// the real story.
    fn error_after_write_failure(self) -> Option<Error> {
        match self {
            Sink::Direct(_) => None,
            Sink::Gzip {
                mut child,
                mut stderr,
            } => {
                drop(child.stdin.take());
                let status = child.wait().ok()?;
                match status.code() {
                    Some(0) | Some(2) => None,
                    _ => Some(Self::child_error(&mut stderr, status)),
                }
            }
        }
    }
}

/// Copy `url` to `dest`, returning the hex SHA-256 digest of the raw
/// stream. `dest` is replaced if it exists; on failure it is removed.
pub fn fetch(
    transport: &dyn Transport,
    url: &Url,
    dest: &Path,
    options: &FetchOptions,
    progress: &dyn ProgressTracker,
) -> Result<String> {
    let label = options
        .label
        .clone()
        .unwrap_or_else(|| url.format(UrlFormat::PlainNoQuery));
    progress.start(&label);

    let result = fetch_inner(transport, url, dest, options, progress);
    progress.done(result.is_ok());
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn fetch_inner(
    transport: &dyn Transport,
    url: &Url,
    dest: &Path,
    options: &FetchOptions,
    progress: &dyn ProgressTracker,
) -> Result<String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(dest);

    let mut stream = transport.open(url)?;
    let _sigpipe = SigPipeGuard::install()?;

    // first block decides whether we decompress
    let mut head = [0u8; SNIFF_LEN];
    let mut head_len = 0;
    while head_len < head.len() {
        let n = stream.reader.read(&mut head[head_len..])?;
        if n == 0 {
            break;
        }
        head_len += n;
    }

    let info = sniff(&head[..head_len], options.unzip);
    let unzip = info.gzip;
    tracing::debug!(
        gzip = info.gzip,
        unzip,
        dec_total = info.dec_total,
        raw_total = stream.total,
        "transfer start"
    );

    let mut sink = Sink::open(dest, unzip)?;
    let mut hasher = Sha256::new();
    let mut raw_now: u64 = 0;
    let mut last_percent: u8 = 0;
    let mut chunk = [0u8; CHUNK_LEN];
    let mut pending: &[u8] = &head[..head_len];

    loop {
        if !pending.is_empty() {
            hasher.update(pending);
            raw_now += pending.len() as u64;
            if let Err(io_err) = sink.write_chunk(pending) {
                return Err(sink
                    .error_after_write_failure()
                    .unwrap_or(Error::Io(io_err)));
            }

            let dec_now = if unzip {
                std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
            } else {
                raw_now
            };
            let dec_total = info.dec_total;
            let percent = match (dec_total, stream.total) {
                (Some(t), _) if t > 0 => Some((dec_now * 100 / t).min(100) as u8),
                (_, Some(t)) if t > 0 => Some((raw_now * 100 / t).min(100) as u8),
                _ => None,
            }
            .map(|p| {
                last_percent = last_percent.max(p);
                last_percent
            });

            let update = ProgressUpdate {
                raw_now,
                raw_total: stream.total,
                dec_now,
                dec_total,
                percent,
            };
            if progress.update(&update) {
                sink.abort();
                return Err(Error::Aborted);
            }
        }

        let n = match stream.reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                sink.abort();
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }
        pending = &chunk[..n];
    }

    sink.finish()?;
    Ok(hex::encode(hasher.finalize()))
}
