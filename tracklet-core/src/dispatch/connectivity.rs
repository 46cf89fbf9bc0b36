//! Network reachability oracle.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Link classification reported by a [`Connectivity`] oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    None,
    Mobile,
    Wifi,
}

/// Answers "can we reach the network, and over what" on demand.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;

    fn network_type(&self) -> NetworkType;
}

/// Connectivity that is whatever it was last set to.
///
/// Desktop and server processes rarely have a link-type API; they start
/// connected over wifi and flip to offline explicitly.
#[derive(Debug)]
pub struct ManualConnectivity {
    connected: AtomicBool,
    network: AtomicU8,
}

impl ManualConnectivity {
    pub fn new(connected: bool, network: NetworkType) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            network: AtomicU8::new(encode(network)),
        }
    }

    pub fn online() -> Self {
        Self::new(true, NetworkType::Wifi)
    }

    pub fn offline() -> Self {
        Self::new(false, NetworkType::None)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_network_type(&self, network: NetworkType) {
        self.network.store(encode(network), Ordering::SeqCst);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::online()
    }
}

impl Connectivity for ManualConnectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn network_type(&self) -> NetworkType {
        if !self.is_connected() {
            return NetworkType::None;
        }
        match self.network.load(Ordering::SeqCst) {
            2 => NetworkType::Wifi,
            1 => NetworkType::Mobile,
            _ => NetworkType::None,
        }
    }
}

fn encode(network: NetworkType) -> u8 {
    match network {
        NetworkType::None => 0,
        NetworkType::Mobile => 1,
        NetworkType::Wifi => 2,
    }
}
