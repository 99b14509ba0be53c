// src/net/mod.rs

//! Network bootstrap for network-backed installation sources.
//!
//! [`bring_up`] configures the interface a URL resolved to: stop any
//! previous configuration, record the device identity, configure
//! statically when a complete static config exists and by DHCP or BOOTP
//! otherwise, activate, run SLP discovery for `slp:` URLs, and resolve
//! the server name into a validated address. A device that is already
//! configured is reused without touching the link.
//!
//! The actual interface plumbing lives behind [`NetworkOps`]; this
//! module owns only the ordering and the failure policy.

use crate::context::{Context, NetConfigured};
use crate::error::{Error, Result};
use crate::url::{Scheme, Url};

/// Low-level network operations, implemented against the host's network
/// stack in production and mocked in tests.
pub trait NetworkOps {
    /// Tear down the currently configured interface, if any.
    fn stop(&self, net: &mut crate::context::NetConfig);

    /// A complete static address configuration is available.
    fn static_config_complete(&self) -> bool;

    fn configure_static(&self, net: &mut crate::context::NetConfig) -> Result<()>;

    fn dhcp(&self, net: &mut crate::context::NetConfig) -> Result<()>;

    fn bootp(&self, net: &mut crate::context::NetConfig) -> Result<()>;

    /// The last DHCP/BOOTP exchange produced a usable address.
    fn answer_complete(&self) -> bool;

    fn activate(&self, net: &crate::context::NetConfig) -> Result<()>;

    fn wlan_setup(&self, net: &crate::context::NetConfig) -> Result<()>;

    /// Resolve and validate a server name, returning the address to use.
    fn resolve(&self, server: &str) -> Result<String>;
}

/// SLP service discovery. Returns the URL string of a discovered
/// installation source.
pub trait SlpDiscovery {
    fn discover(&self, url: &Url) -> Result<String>;
}

/// Bring up the network for `url` and resolve its endpoint.
///
/// On success `url.used.server` holds the validated server address and,
/// for `slp:` URLs, the URL has been rewritten to the discovered source.
pub fn bring_up(
    ctx: &mut Context,
    ops: &dyn NetworkOps,
    slp: Option<&dyn SlpDiscovery>,
    url: &mut Url,
) -> Result<()> {
    if !url.is_network {
        return Ok(());
    }
    let device = url
        .used
        .device
        .clone()
        .ok_or_else(|| Error::BadDevice("none selected".into()))?;

    let same_device = ctx.net.configured != NetConfigured::None
        && ctx.net.device.as_deref() == Some(device.as_str());

    if same_device {
        tracing::debug!(device, "network already up");
    } else {
        // loopback and tunnel pseudo-devices never reach a repo server
        if device.starts_with("lo") || device.starts_with("sit") {
            return Err(Error::BadDevice(device));
        }

        ops.stop(&mut ctx.net);
        ctx.net.configured = NetConfigured::None;
        ctx.net.device = Some(device.clone());
        ctx.net.hwaddr = url.used.hwaddr.clone();
        ctx.net.cardname = url.used.model.clone();
        ctx.net.unique_id = url.used.unique_id.clone();

        if url.is_wlan {
            ops.wlan_setup(&ctx.net)?;
        }

        if ops.static_config_complete() {
            ops.configure_static(&mut ctx.net)?;
            ctx.net.configured = NetConfigured::Static;
        } else if ctx.net.use_dhcp {
            tracing::info!(device, "sending DHCP request");
            ops.dhcp(&mut ctx.net)?;
            if !ops.answer_complete() {
                return Err(Error::NoAnswer("DHCP"));
            }
            ctx.net.configured = NetConfigured::Dhcp;
        } else {
            tracing::info!(device, "sending BOOTP request");
            ops.bootp(&mut ctx.net)?;
            if !ops.answer_complete() {
                return Err(Error::NoAnswer("BOOTP"));
            }
            ctx.net.configured = NetConfigured::Bootp;
        }

        if let Err(e) = ops.activate(&ctx.net) {
            ctx.net.configured = NetConfigured::None;
            return Err(Error::ActivationFailed(e.to_string()));
        }
    }

    if url.scheme == Scheme::Slp {
        let text = url.format(crate::url::UrlFormat::PlainNoQuery);
        let discovered = match slp {
            Some(slp) => slp.discover(url)?,
            None => return Err(Error::SlpFailed(text)),
        };
        let found = Url::parse(&discovered);
        if found.scheme == Scheme::None {
            return Err(Error::SlpFailed(text));
        }
        tracing::info!(from = %text, to = %discovered, "SLP discovery");
        url.adopt_endpoint(&found);
    }

    if let Some(server) = url.server.clone() {
        match ops.resolve(&server) {
            Ok(addr) => url.used.server = Some(addr),
            Err(_) => {
                ctx.net.configured = NetConfigured::None;
                return Err(Error::InvalidAddress(server));
            }
        }
    }

    Ok(())
}

/// Network operations against the host's tools: dhclient for address
/// configuration, the resolver for address validation.
pub struct SysNetworkOps;

impl SysNetworkOps {
    fn has_address(device: &str) -> bool {
        let output = std::process::Command::new("ip")
            .args(["-4", "addr", "show", "dev", device])
            .output();
        match output {
            Ok(o) => String::from_utf8_lossy(&o.stdout).contains("inet "),
            Err(_) => false,
        }
    }
}

impl NetworkOps for SysNetworkOps {
    fn stop(&self, net: &mut crate::context::NetConfig) {
        if let Some(device) = &net.device {
            let _ = std::process::Command::new("ip")
                .args(["addr", "flush", "dev", device])
                .status();
        }
    }

    fn static_config_complete(&self) -> bool {
        // static config comes from boot parameters, which this binary
        // does not read; always negotiate
        false
    }

    fn configure_static(&self, _net: &mut crate::context::NetConfig) -> Result<()> {
        Err(Error::Other("no static network configuration".into()))
    }

    fn dhcp(&self, net: &mut crate::context::NetConfig) -> Result<()> {
        let device = net
            .device
            .clone()
            .ok_or_else(|| Error::BadDevice("no device".into()))?;
        let status = std::process::Command::new("dhclient")
            .args(["-1", &device])
            .status()
            .map_err(|e| Error::Other(format!("dhclient: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::NoAnswer("DHCP"))
        }
    }

    fn bootp(&self, net: &mut crate::context::NetConfig) -> Result<()> {
        // modern dhclient speaks BOOTP-compatible DHCP
        self.dhcp(net)
    }

    fn answer_complete(&self) -> bool {
        true
    }

    fn activate(&self, net: &crate::context::NetConfig) -> Result<()> {
        match &net.device {
            Some(device) if Self::has_address(device) => Ok(()),
            Some(device) => Err(Error::ActivationFailed(format!("{device}: no address"))),
            None => Err(Error::ActivationFailed("no device".into())),
        }
    }

    fn wlan_setup(&self, _net: &crate::context::NetConfig) -> Result<()> {
        Err(Error::Other("wlan setup requires interactive config".into()))
    }

    fn resolve(&self, server: &str) -> Result<String> {
        use std::net::ToSocketAddrs;
        let mut addrs = (server, 0)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress(server.to_string()))?;
        match addrs.next() {
            Some(addr) => Ok(addr.ip().to_string()),
            None => Err(Error::InvalidAddress(server.to_string())),
        }
    }
}
