// Endpoint addressing: (domain, port) pairs and the fixed port ranges per device class.

use super::error::BindFailure;
use std::fmt;

/// Small integer naming a domain (VM) on this host.
pub type DomainId = u16;

/// The device-model domain (host side of every device channel).
pub const DOMID_DM: DomainId = 0x7ffd;

/// Wildcard partner: accept from any domain.
pub const DOMID_ANY: DomainId = 0x7ff4;

/// Storage host adapters: one port per host id.
pub const STORAGE_PORT_BASE: u32 = 0xd0000;
/// Display heads: one port per head.
pub const DISPLAY_PORT_BASE: u32 = 0xd0100;
/// Network interfaces.
pub const NETWORK_PORT_BASE: u32 = 0xc0000;
/// VM telemetry (single well-known port).
pub const DIAGNOSTICS_PORT: u32 = 44461;
pub const DIAGNOSTICS_RING_LEN: usize = 256 * 1024;
pub const DIAGNOSTICS_MAX_PAYLOAD: usize = 4089;

/// Width of each class range.
const CLASS_SPAN: u32 = 0x100;

/// An endpoint address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    pub domain: DomainId,
    pub port: u32,
}

impl Addr {
    pub const fn new(domain: DomainId, port: u32) -> Self {
        Self { domain, port }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.domain, self.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Device classes, each owning a fixed, non-overlapping port range.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PortClass {
    Storage,
    Display,
    Network,
    Diagnostics,
}

impl PortClass {
    pub const fn base(self) -> u32 {
        match self {
            PortClass::Storage => STORAGE_PORT_BASE,
            PortClass::Display => DISPLAY_PORT_BASE,
            PortClass::Network => NETWORK_PORT_BASE,
            PortClass::Diagnostics => DIAGNOSTICS_PORT,
        }
    }

    /// Number of ports in the class range.
    pub const fn span(self) -> u32 {
        match self {
            PortClass::Diagnostics => 1,
            _ => CLASS_SPAN,
        }
    }

    /// Port for the `index`-th instance of this class.
    pub fn port(self, index: u32) -> Result<u32, BindFailure> {
        if index >= self.span() {
            return Err(BindFailure::InvalidPort(self.base().wrapping_add(index)));
        }
        Ok(self.base() + index)
    }

    /// Class whose range contains `port`, if any.
    pub fn of(port: u32) -> Option<PortClass> {
        [
            PortClass::Storage,
            PortClass::Display,
            PortClass::Network,
            PortClass::Diagnostics,
        ]
        .into_iter()
        .find(|class| port >= class.base() && port - class.base() < class.span())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_ranges_do_not_overlap() {
        assert_eq!(PortClass::of(STORAGE_PORT_BASE + 3), Some(PortClass::Storage));
        assert_eq!(PortClass::of(DISPLAY_PORT_BASE), Some(PortClass::Display));
        assert_eq!(PortClass::of(DIAGNOSTICS_PORT), Some(PortClass::Diagnostics));
        assert_eq!(PortClass::of(DIAGNOSTICS_PORT + 1), None);
        assert_eq!(PortClass::of(0x1234), None);
    }

    #[test]
    fn port_index_is_bounded() {
        assert_eq!(PortClass::Storage.port(2), Ok(0xd0002));
        assert!(PortClass::Storage.port(CLASS_SPAN).is_err());
        assert!(PortClass::Diagnostics.port(1).is_err());
    }
}
