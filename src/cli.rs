// src/cli.rs
//! CLI definitions for the instsrc resolver
//!
//! This module contains all command-line interface definitions using clap.
//! The command implementations live in `main.rs`.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "instsrc")]
#[command(version)]
#[command(about = "Locate, mount, and fetch installer repositories", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse an installation-source URL and dump the result
    Parse {
        /// URL, e.g. disk:/dev/sda1/repo or nfs://server/export?device=eth0
        url: String,
    },

    /// Fetch a URL to a local file
    Fetch {
        /// Source URL (file:, http:, https:)
        url: String,

        /// Destination path
        dest: String,

        /// Decompress a gzipped stream on the fly
        #[arg(long)]
        unzip: bool,
    },

    /// Find and mount the repository a URL points at
    Repo {
        /// Installation-source URL
        url: String,

        /// Relative payload URL (mounted along with the repository)
        #[arg(long, default_value = "rel:boot/root")]
        instsys: String,

        /// Scratch directory for mountpoints and downloads
        #[arg(long, default_value = "/tmp/instsrc")]
        scratch: String,

        /// Verify digests and the repository signature
        #[arg(long)]
        secure: bool,

        /// gpg keyring for signature verification
        #[arg(long)]
        keyring: Option<String>,
    },
}
