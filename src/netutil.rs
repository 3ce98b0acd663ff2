use std::{io, net::IpAddr, sync::Arc};

use if_addrs::IfAddr;
use tracing::warn;

use crate::services::BoxFuture;

/// Splits `host:port`, `[v6]:port`, a bare host or a bare IPv6 literal.
pub fn split_host_port(s: &str) -> (&str, Option<&str>) {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            return (host, tail.strip_prefix(':').filter(|p| !p.is_empty()));
        }
        return (s, None);
    }
    match s.matches(':').count() {
        1 => {
            let (host, port) = s.split_once(':').unwrap_or((s, ""));
            (host, Some(port).filter(|p| !p.is_empty()))
        }
        _ => (s, None),
    }
}

pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// An interface address together with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpCidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            addr,
            prefix: prefix.min(max),
        }
    }

    /// `/32` for IPv4, `/128` for IPv6.
    pub fn is_host_mask(&self) -> bool {
        match self.addr {
            IpAddr::V4(_) => self.prefix == 32,
            IpAddr::V6(_) => self.prefix == 128,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix))
                    .unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for IpCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl std::str::FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length: {s}"))?;
        let addr: IpAddr = addr.parse().map_err(|e| format!("{addr}: {e}"))?;
        let prefix: u8 = prefix.parse().map_err(|e| format!("{prefix}: {e}"))?;
        Ok(Self::new(addr, prefix))
    }
}

/// Source of the local interface addresses.
pub trait InterfaceAddrs: Send + Sync {
    fn addrs(&self) -> io::Result<Vec<IpCidr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceAddrs for SystemInterfaces {
    fn addrs(&self) -> io::Result<Vec<IpCidr>> {
        system_interface_addrs()
    }
}

fn system_interface_addrs() -> io::Result<Vec<IpCidr>> {
    let cidrs = if_addrs::get_if_addrs()?
        .into_iter()
        .map(|iface| match iface.addr {
            IfAddr::V4(v4) => IpCidr::new(IpAddr::V4(v4.ip), prefix_len(IpAddr::V4(v4.netmask))),
            IfAddr::V6(v6) => IpCidr::new(IpAddr::V6(v6.ip), prefix_len(IpAddr::V6(v6.netmask))),
        })
        .collect();
    Ok(cidrs)
}

fn prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(m) => u32::from(m).count_ones() as u8,
        IpAddr::V6(m) => u128::from(m).count_ones() as u8,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddressError {
    NotFound { host: String },
}

impl std::fmt::Display for BindAddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { host } => {
                write!(f, "address {host} not found in any host interface")
            }
        }
    }
}

impl std::error::Error for BindAddressError {}

/// Maps the address a peer used to reach this node onto one of this node's real interface
/// addresses.
#[derive(Clone)]
pub struct BindAddressResolver {
    interfaces: Arc<dyn InterfaceAddrs>,
}

impl BindAddressResolver {
    pub fn new(interfaces: Arc<dyn InterfaceAddrs>) -> Self {
        Self { interfaces }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemInterfaces))
    }

    /// Resolution order:
    /// 1. an interface address equal to the requested host on a non host-only mask;
    /// 2. the address of the narrowest non host-only subnet containing the host (so a `/32`
    ///    virtual IP resolves to the physical address next to it), first enumerated on ties;
    /// 3. an interface address equal to the host on a host-only mask.
    ///
    /// If the interfaces cannot be listed the requested host is returned unchanged.
    pub fn find_matching_bind_address(
        &self,
        request_host_port: &str,
    ) -> Result<String, BindAddressError> {
        let (host, _) = split_host_port(request_host_port);
        let cidrs = match self.interfaces.addrs() {
            Ok(cidrs) => cidrs,
            Err(err) => {
                warn!(
                    host = host,
                    error = %err,
                    "failed to list interface addresses; using requested host"
                );
                return Ok(host.to_string());
            }
        };
        select_bind_address(&cidrs, host)
            .map(|ip| ip.to_string())
            .ok_or_else(|| BindAddressError::NotFound {
                host: host.to_string(),
            })
    }
}

fn select_bind_address(cidrs: &[IpCidr], host: &str) -> Option<IpAddr> {
    let ip: IpAddr = host.parse().ok()?;

    if let Some(exact) = cidrs.iter().find(|c| c.addr == ip && !c.is_host_mask()) {
        return Some(exact.addr);
    }

    let mut best: Option<&IpCidr> = None;
    for cidr in cidrs.iter().filter(|c| !c.is_host_mask() && c.contains(ip)) {
        if best.is_none_or(|b| cidr.prefix > b.prefix) {
            best = Some(cidr);
        }
    }
    if let Some(best) = best {
        return Some(best.addr);
    }

    cidrs.iter().find(|c| c.addr == ip).map(|c| c.addr)
}

/// Forward DNS for joining node hostnames.
pub trait HostResolver: Send + Sync {
    fn lookup(&self, host: &str) -> BoxFuture<'_, io::Result<Vec<IpAddr>>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup(&self, host: &str) -> BoxFuture<'_, io::Result<Vec<IpAddr>>> {
        let host = host.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host.as_str(), 0)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}
