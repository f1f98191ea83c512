//! Fundamental Types
//!
//! Defines the small typed vocabulary used throughout the baseband core.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Cell identity carried in every wire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

/// The kind of one symbol slot in the frame template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Beacon symbol, transmitted by the base station for synchronization
    Beacon,
    /// Uplink pilot symbol, one per user antenna
    Pilot,
    /// Uplink data symbol
    UplinkData,
    /// Downlink data symbol
    DownlinkData,
    /// Uplink reciprocity-calibration symbol
    UplinkCal,
    /// Downlink reciprocity-calibration symbol
    DownlinkCal,
    /// Guard period, no transmission either way
    Guard,
}

impl SymbolKind {
    /// Map a frame-template character to its symbol kind.
    pub fn from_code(c: char) -> Option<Self> {
        match c {
            'B' => Some(SymbolKind::Beacon),
            'P' => Some(SymbolKind::Pilot),
            'U' => Some(SymbolKind::UplinkData),
            'D' => Some(SymbolKind::DownlinkData),
            'L' => Some(SymbolKind::UplinkCal),
            'C' => Some(SymbolKind::DownlinkCal),
            'G' => Some(SymbolKind::Guard),
            _ => None,
        }
    }

    /// True if the base station receives IQ packets for this symbol.
    pub fn is_received(&self) -> bool {
        matches!(
            self,
            SymbolKind::Pilot | SymbolKind::UplinkData | SymbolKind::UplinkCal
        )
    }
}

/// Modulation order for data symbols.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize,
)]
pub enum Modulation {
    /// QPSK, 2 bits per subcarrier
    Qpsk = 2,
    /// 16-QAM, 4 bits per subcarrier
    Qam16 = 4,
    /// 64-QAM, 6 bits per subcarrier
    Qam64 = 6,
}

impl Modulation {
    /// Number of bits carried by one modulated subcarrier.
    pub fn bits(&self) -> usize {
        *self as usize
    }

    /// Number of constellation points.
    pub fn order(&self) -> usize {
        1 << self.bits()
    }

    /// Parse the configuration spelling ("QPSK", "16QAM", "64QAM").
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "QPSK" => Some(Modulation::Qpsk),
            "16QAM" => Some(Modulation::Qam16),
            "64QAM" => Some(Modulation::Qam64),
            _ => None,
        }
    }
}

/// Role of a pinned thread, used for placement and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    Master,
    Rx,
    Tx,
    Worker,
}

impl ThreadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadType::Master => "master",
            ThreadType::Rx => "rx",
            ThreadType::Tx => "tx",
            ThreadType::Worker => "worker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_kind_codes() {
        assert_eq!(SymbolKind::from_code('P'), Some(SymbolKind::Pilot));
        assert_eq!(SymbolKind::from_code('U'), Some(SymbolKind::UplinkData));
        assert_eq!(SymbolKind::from_code('D'), Some(SymbolKind::DownlinkData));
        assert_eq!(SymbolKind::from_code('X'), None);
    }

    #[test]
    fn test_received_kinds() {
        assert!(SymbolKind::Pilot.is_received());
        assert!(SymbolKind::UplinkData.is_received());
        assert!(!SymbolKind::DownlinkData.is_received());
        assert!(!SymbolKind::Guard.is_received());
    }

    #[test]
    fn test_modulation() {
        assert_eq!(Modulation::Qpsk.bits(), 2);
        assert_eq!(Modulation::Qam16.order(), 16);
        assert_eq!(Modulation::from_name("64QAM"), Some(Modulation::Qam64));
        assert_eq!(Modulation::from_name("8PSK"), None);
    }
}
