//! Dispatch modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// When the dispatcher is allowed to use the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Dispatch whenever the network is reachable
    #[default]
    Always,
    /// Dispatch only over wifi
    WifiOnly,
    /// Treat the network as unreachable so everything spills to disk.
    /// Used while the process is going down abnormally; never persisted.
    ForceOffline,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Always => "always",
            DispatchMode::WifiOnly => "wifi_only",
            DispatchMode::ForceOffline => "force_offline",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DispatchMode::Always => 0,
            DispatchMode::WifiOnly => 1,
            DispatchMode::ForceOffline => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DispatchMode::WifiOnly,
            2 => DispatchMode::ForceOffline,
            _ => DispatchMode::Always,
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(DispatchMode::Always),
            "wifi_only" => Ok(DispatchMode::WifiOnly),
            "force_offline" => Ok(DispatchMode::ForceOffline),
            other => Err(format!("unknown dispatch mode: {}", other)),
        }
    }
}
