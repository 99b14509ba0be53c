// src/lib.rs

//! Installation-source resolver
//!
//! Turns an installation-source URL into usable local data for a
//! boot-time installer: parse the URL, pick matching hardware, bring up
//! the network when needed, mount the source (possibly downloading and
//! loopback-mounting an image), and verify repository manifests.
//!
//! # Architecture
//!
//! - URL-first: the [`url::Url`] record carries both the request and the
//!   resolution state (chosen device, active mounts)
//! - Collaborator traits at every system seam (hardware enumeration,
//!   mounting, network, transports) so resolution logic is testable
//! - Soft failure per candidate: one bad device never aborts the scan

pub mod context;
mod error;
pub mod hwdetect;
pub mod mount;
pub mod net;
pub mod progress;
pub mod repo;
pub mod transfer;
pub mod url;

pub use context::Context;
pub use error::{Error, Result};
pub use url::{Scheme, Url, UrlFormat};
