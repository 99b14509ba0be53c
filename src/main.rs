// src/main.rs

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use instsrc::context::Context;
use instsrc::hwdetect::SysHardware;
use instsrc::mount::{Deps, SysMounter};
use instsrc::net::SysNetworkOps;
use instsrc::progress::LogProgress;
use instsrc::repo::{self, CommandVerifier, NoVerifier, SignatureVerifier};
use instsrc::transfer::{self, DefaultTransport, FetchOptions};
use instsrc::url::{Url, UrlFormat};

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { url } => cmd_parse(&url),
        Commands::Fetch { url, dest, unzip } => cmd_fetch(&url, &dest, unzip),
        Commands::Repo {
            url,
            instsys,
            scratch,
            secure,
            keyring,
        } => cmd_repo(&url, &instsys, &scratch, secure, keyring.as_deref()),
    }
}

fn cmd_parse(text: &str) -> Result<()> {
    let url = Url::parse(text);
    println!("scheme:    {}", url.scheme);
    if let Some(server) = &url.server {
        println!("server:    {server}");
    }
    if let Some(port) = url.port {
        println!("port:      {port}");
    }
    if let Some(share) = &url.share {
        println!("share:     {share}");
    }
    println!("path:      {}", url.path);
    if let Some(user) = &url.user {
        println!("user:      {user}");
    }
    if let Some(domain) = &url.domain {
        println!("domain:    {domain}");
    }
    if let Some(device) = &url.device {
        println!("device:    {device}");
    }
    if let Some(instsys) = &url.instsys {
        println!("instsys:   {instsys}");
    }
    println!(
        "flags:     mountable={} network={} cdrom={}",
        url.is_mountable, url.is_network, url.is_cdrom
    );
    println!("canonical: {}", url.format(UrlFormat::WithDevice));
    Ok(())
}

fn cmd_fetch(text: &str, dest: &str, unzip: bool) -> Result<()> {
    let url = Url::parse(text);
    let transport = DefaultTransport::new()?;
    let progress = LogProgress::new();
    let opts = FetchOptions {
        unzip,
        label: None,
    };
    let digest = transfer::fetch(&transport, &url, Path::new(dest), &opts, &progress)?;
    info!(%digest, dest, "fetched");
    println!("{digest}  {dest}");
    Ok(())
}

fn cmd_repo(
    text: &str,
    instsys: &str,
    scratch: &str,
    secure: bool,
    keyring: Option<&str>,
) -> Result<()> {
    let mut url = Url::parse(text);

    std::fs::create_dir_all(scratch)?;
    let mut ctx = Context::new(scratch);
    ctx.secure = secure;
    ctx.net.use_dhcp = true;
    ctx.instsys = Some(Url::parse(instsys));

    let verifier: Box<dyn SignatureVerifier> = match keyring {
        Some(path) => Box::new(CommandVerifier {
            keyring: PathBuf::from(path),
        }),
        None => Box::new(NoVerifier),
    };

    let transport = DefaultTransport::new()?;
    let progress = LogProgress::new();
    let deps = Deps {
        mounter: &SysMounter,
        hardware: &SysHardware,
        net: &SysNetworkOps,
        slp: None,
        transport: &transport,
        progress: &progress,
    };

    repo::find_repository(&deps, verifier.as_ref(), &mut ctx, &mut url, None)?;

    println!("repository: {}", url.format(UrlFormat::Log));
    if let Some(mount) = &url.mount {
        println!("mounted at: {}", mount.display());
    }
    if let Some(instsys) = &ctx.instsys {
        if let Some(mount) = &instsys.mount {
            println!("payload at: {}", mount.display());
        }
    }
    if ctx.digest_failed || ctx.sig_failed {
        bail!(
            "integrity problems: digest_failed={} sig_failed={}",
            ctx.digest_failed,
            ctx.sig_failed
        );
    }
    Ok(())
}
