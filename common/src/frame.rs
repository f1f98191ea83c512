//! Frame Template
//!
//! Parses the frame template string (e.g. `"BPPUUDD"`) into a typed,
//! immutable symbol schedule and answers symbol-kind and per-kind-index
//! queries for the scheduler.

use crate::types::SymbolKind;
use thiserror::Error;

/// Errors raised while parsing a frame template.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame template: unknown symbol code '{0}'")]
    BadFrameTemplate(char),

    #[error("bad frame template: empty template")]
    EmptyTemplate,
}

/// The immutable per-frame symbol schedule.
///
/// Per-kind indices are dense: the k-th pilot of the frame has pilot
/// index k, independent of where it sits in the template.
#[derive(Debug, Clone)]
pub struct FrameSchedule {
    template: String,
    kinds: Vec<SymbolKind>,
    /// kind_index[s] is the dense index of symbol s among symbols of its kind
    kind_index: Vec<usize>,
    beacon_symbols: Vec<usize>,
    pilot_symbols: Vec<usize>,
    ul_symbols: Vec<usize>,
    dl_symbols: Vec<usize>,
    ul_cal_symbols: Vec<usize>,
    dl_cal_symbols: Vec<usize>,
}

impl FrameSchedule {
    /// Parse a template string. Rejects unknown codes and empty templates.
    pub fn parse(template: &str) -> Result<Self, FrameError> {
        if template.is_empty() {
            return Err(FrameError::EmptyTemplate);
        }

        let mut kinds = Vec::with_capacity(template.len());
        let mut kind_index = Vec::with_capacity(template.len());
        let mut beacon_symbols = Vec::new();
        let mut pilot_symbols = Vec::new();
        let mut ul_symbols = Vec::new();
        let mut dl_symbols = Vec::new();
        let mut ul_cal_symbols = Vec::new();
        let mut dl_cal_symbols = Vec::new();

        for (s, c) in template.chars().enumerate() {
            let kind = SymbolKind::from_code(c).ok_or(FrameError::BadFrameTemplate(c))?;
            let bucket: Option<&mut Vec<usize>> = match kind {
                SymbolKind::Beacon => Some(&mut beacon_symbols),
                SymbolKind::Pilot => Some(&mut pilot_symbols),
                SymbolKind::UplinkData => Some(&mut ul_symbols),
                SymbolKind::DownlinkData => Some(&mut dl_symbols),
                SymbolKind::UplinkCal => Some(&mut ul_cal_symbols),
                SymbolKind::DownlinkCal => Some(&mut dl_cal_symbols),
                SymbolKind::Guard => None,
            };
            match bucket {
                Some(v) => {
                    kind_index.push(v.len());
                    v.push(s);
                }
                None => kind_index.push(0),
            }
            kinds.push(kind);
        }

        Ok(Self {
            template: template.to_string(),
            kinds,
            kind_index,
            beacon_symbols,
            pilot_symbols,
            ul_symbols,
            dl_symbols,
            ul_cal_symbols,
            dl_cal_symbols,
        })
    }

    /// The template string this schedule was parsed from.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Total number of symbol slots per frame.
    pub fn num_symbols(&self) -> usize {
        self.kinds.len()
    }

    /// The kind of symbol `symbol_id`. Panics on out-of-range ids, which
    /// cannot be produced by validated packets.
    pub fn kind(&self, symbol_id: usize) -> SymbolKind {
        self.kinds[symbol_id]
    }

    /// Checked kind lookup, for packet-header validation.
    pub fn kind_checked(&self, symbol_id: usize) -> Option<SymbolKind> {
        self.kinds.get(symbol_id).copied()
    }

    /// Dense per-kind index of symbol `symbol_id` (e.g. its pilot index).
    pub fn kind_index(&self, symbol_id: usize) -> usize {
        self.kind_index[symbol_id]
    }

    pub fn num_beacon_symbols(&self) -> usize {
        self.beacon_symbols.len()
    }

    pub fn num_pilot_symbols(&self) -> usize {
        self.pilot_symbols.len()
    }

    pub fn num_ul_symbols(&self) -> usize {
        self.ul_symbols.len()
    }

    pub fn num_dl_symbols(&self) -> usize {
        self.dl_symbols.len()
    }

    pub fn num_ul_cal_symbols(&self) -> usize {
        self.ul_cal_symbols.len()
    }

    pub fn num_dl_cal_symbols(&self) -> usize {
        self.dl_cal_symbols.len()
    }

    /// Symbol ids of all pilots, in template order.
    pub fn pilot_symbols(&self) -> &[usize] {
        &self.pilot_symbols
    }

    /// Symbol ids of all uplink data symbols, in template order.
    pub fn ul_symbols(&self) -> &[usize] {
        &self.ul_symbols
    }

    /// Symbol ids of all downlink data symbols, in template order.
    pub fn dl_symbols(&self) -> &[usize] {
        &self.dl_symbols
    }

    /// Symbol id of the k-th pilot of the frame.
    pub fn pilot_symbol(&self, k: usize) -> usize {
        self.pilot_symbols[k]
    }

    /// Number of symbols the base station receives packets for
    /// (pilots, uplink data and uplink calibration).
    pub fn num_rx_symbols(&self) -> usize {
        self.pilot_symbols.len() + self.ul_symbols.len() + self.ul_cal_symbols.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_template() {
        let fs = FrameSchedule::parse("BPPUUGDD").unwrap();
        assert_eq!(fs.num_symbols(), 8);
        assert_eq!(fs.kind(0), SymbolKind::Beacon);
        assert_eq!(fs.kind(1), SymbolKind::Pilot);
        assert_eq!(fs.kind(5), SymbolKind::Guard);
        assert_eq!(fs.num_pilot_symbols(), 2);
        assert_eq!(fs.num_ul_symbols(), 2);
        assert_eq!(fs.num_dl_symbols(), 2);
        assert_eq!(fs.pilot_symbols(), &[1, 2]);
        assert_eq!(fs.ul_symbols(), &[3, 4]);
        assert_eq!(fs.dl_symbols(), &[6, 7]);
    }

    #[test]
    fn test_dense_kind_indices() {
        let fs = FrameSchedule::parse("PUPU").unwrap();
        assert_eq!(fs.kind_index(0), 0);
        assert_eq!(fs.kind_index(1), 0);
        assert_eq!(fs.kind_index(2), 1);
        assert_eq!(fs.kind_index(3), 1);
        assert_eq!(fs.pilot_symbol(1), 2);
    }

    #[test]
    fn test_calibration_symbols() {
        let fs = FrameSchedule::parse("PLCU").unwrap();
        assert_eq!(fs.num_ul_cal_symbols(), 1);
        assert_eq!(fs.num_dl_cal_symbols(), 1);
        // UL cal symbols arrive over the air, DL cal symbols do not
        assert_eq!(fs.num_rx_symbols(), 3);
    }

    #[test]
    fn test_reject_malformed() {
        assert_eq!(
            FrameSchedule::parse("PQ").unwrap_err(),
            FrameError::BadFrameTemplate('Q')
        );
        assert_eq!(FrameSchedule::parse("").unwrap_err(), FrameError::EmptyTemplate);
    }
}
