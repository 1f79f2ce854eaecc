//! CIDR allowlists for tunnel access control.
//!
//! An empty set contains nothing, so a tunnel without any allowed network
//! refuses every caller.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tracing::warn;

/// An ordered list of networks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    nets: Vec<IpNet>,
}

impl IpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from CIDR strings, skipping the ones that fail to parse.
    pub fn from_cidrs<I, S>(cidrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for cidr in cidrs {
            if let Err(e) = set.add(cidr.as_ref()) {
                warn!("Skipping invalid network {}: {}", cidr.as_ref(), e);
            }
        }
        set
    }

    /// Add a network in CIDR notation.
    ///
    /// Host bits are cleared, so `10.1.2.3/8` is stored as `10.0.0.0/8`.
    pub fn add(&mut self, cidr: &str) -> Result<(), ipnet::AddrParseError> {
        let net: IpNet = cidr.trim().parse()?;
        self.nets.push(net.trunc());
        Ok(())
    }

    /// Add a single address as a /32 or /128 network.
    pub fn add_host(&mut self, ip: IpAddr) {
        self.nets.push(IpNet::from(ip));
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(ip))
    }

    /// Membership test for a textual address; unparsable input is never a member.
    pub fn contains_str(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(ip) => self.contains(&ip),
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}

impl fmt::Display for IpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, net) in self.nets.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", net)?;
        }
        Ok(())
    }
}
