//! Shared harness for the end-to-end tests: builds small configurations
//! and synthesizes the over-the-air uplink signal a UE and a flat
//! channel would produce.

use baseband::kernel::fft::{ofdm_modulate, FftEngine};
use baseband::kernel::ldpc::LdpcCode;
use baseband::kernel::modulation::ModTable;
use baseband::kernel::pilot::pilot_sequence;
use common::config::Config;
use common::utils::cfloat_to_ci16;
use num_complex::Complex32;
use std::net::UdpSocket;
use std::sync::Arc;
use transport::packet::{serialize, PacketHeader};

/// A small single-user cell: 2 antennas, 128-point FFT, 100 data
/// subcarriers, QPSK, one codeblock (5 info bytes) per data symbol.
pub fn small_cell(frame_template: &str, frame_window: usize, extra: &str) -> Arc<Config> {
    let json = format!(
        r#"{{
            "antennas": 2, "ues": 1,
            "ofdm_ca": 128, "cp_len": 16,
            "ofdm_data_start": 14, "ofdm_data_num": 100,
            "frame_template": "{frame_template}",
            "modulation": "QPSK",
            "ldpc": {{ "base_graph": 2, "lifting_size": 4 }},
            "frame_window": {frame_window},
            "zf_block_size": 25, "demul_block_size": 50,
            "rx_threads": 1,
            "ring_depth": 16,
            "rx_port_base": 0
            {extra}
        }}"#
    );
    Arc::new(Config::from_json_str(&json).unwrap())
}

/// Synthesizes what the base station receives from one single-antenna
/// UE over a flat per-antenna channel.
pub struct UplinkGenerator {
    cfg: Arc<Config>,
    engine: FftEngine,
    ldpc: LdpcCode,
    table: ModTable,
    pilots: Vec<Complex32>,
    /// Flat channel gain per base-station antenna
    pub channel: Vec<Complex32>,
}

impl UplinkGenerator {
    pub fn new(cfg: Arc<Config>, channel: Vec<Complex32>) -> Self {
        assert_eq!(channel.len(), cfg.antennas);
        Self {
            engine: FftEngine::new(cfg.ofdm_ca),
            ldpc: LdpcCode::new(&cfg.ldpc),
            table: ModTable::new(cfg.modulation),
            pilots: pilot_sequence(cfg.ofdm_data_num),
            cfg,
            channel,
        }
    }

    /// Encode and modulate one data symbol's payload into frequency
    /// points (the UE transmit signal).
    pub fn data_symbol_freq(&mut self, payload: &[u8]) -> Vec<Complex32> {
        let cfg = &self.cfg;
        let n = self.ldpc.coded_bits();
        let info_bytes = cfg.ldpc.info_bytes();
        let mut coded = vec![0u8; cfg.ofdm_data_num * cfg.modulation.bits()];
        for block in 0..cfg.codeblocks_per_ue {
            self.ldpc.encode(
                &payload[block * info_bytes..(block + 1) * info_bytes],
                &mut coded[block * n..(block + 1) * n],
            );
        }
        let bits = cfg.modulation.bits();
        (0..cfg.ofdm_data_num)
            .map(|sc| self.table.map_bits(&coded[sc * bits..(sc + 1) * bits]))
            .collect()
    }

    /// All packets of one frame, in (symbol, antenna) order. `payload`
    /// holds the information bytes of every uplink data symbol,
    /// concatenated.
    pub fn frame_packets(&mut self, frame_id: u32, payload: &[u8]) -> Vec<Vec<u8>> {
        let cfg = Arc::clone(&self.cfg);
        let per_symbol = cfg.codeblocks_per_ue * cfg.ldpc.info_bytes();
        let mut packets = Vec::new();

        for symbol_id in 0..cfg.frame.num_symbols() {
            let kind = cfg.frame.kind(symbol_id);
            if !kind.is_received() {
                continue;
            }
            let freq: Vec<Complex32> = match kind {
                common::types::SymbolKind::Pilot => self.pilots.clone(),
                common::types::SymbolKind::UplinkData => {
                    let ul_idx = cfg.frame.kind_index(symbol_id);
                    self.data_symbol_freq(&payload[ul_idx * per_symbol..(ul_idx + 1) * per_symbol])
                }
                // Uplink calibration symbols reuse the pilot sequence
                _ => self.pilots.clone(),
            };
            let time = ofdm_modulate(&mut self.engine, &freq, cfg.ofdm_data_start, cfg.cp_len);

            for (antenna_id, &h) in self.channel.iter().enumerate() {
                let faded: Vec<Complex32> = time.iter().map(|&x| x * h).collect();
                let header = PacketHeader {
                    frame_id,
                    symbol_id: symbol_id as u32,
                    cell_id: 0,
                    antenna_id: antenna_id as u32,
                };
                packets.push(serialize(&header, &cfloat_to_ci16(&faded)).to_vec());
            }
        }
        packets
    }
}

/// Fire-and-forget UDP send of prebuilt packets.
pub fn send_packets(socket: &UdpSocket, dest: std::net::SocketAddr, packets: &[Vec<u8>]) {
    for pkt in packets {
        socket.send_to(pkt, dest).expect("loopback send");
    }
}
