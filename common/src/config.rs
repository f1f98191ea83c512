//! JSON Configuration
//!
//! Deserializes the system configuration document, applies documented
//! defaults, rejects unknown fields, and derives the block/codeblock
//! constants the scheduler and kernels index by. All derived values are
//! computed once here; the rest of the system treats the configuration
//! as read-only.

use crate::frame::{FrameError, FrameSchedule};
use crate::types::{CellId, Modulation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal configuration errors. These terminate startup with exit code 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    BadFrameTemplate(#[from] FrameError),

    #[error("unknown modulation \"{0}\" (expected QPSK, 16QAM or 64QAM)")]
    BadModulation(String),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),

    #[error(
        "big-station stage threads (fft {fft} + zf {zf} + demul {demul} + decode {decode}) \
         do not sum to worker_threads {workers}"
    )]
    InconsistentThreads {
        fft: usize,
        zf: usize,
        demul: usize,
        decode: usize,
        workers: usize,
    },
}

/// LDPC code parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LdpcConfig {
    /// Base graph, 1 or 2
    #[serde(default = "default_base_graph")]
    pub base_graph: u16,
    /// Lifting size Z
    #[serde(default = "default_lifting_size")]
    pub lifting_size: usize,
    /// Maximum bit-flipping iterations per codeblock
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Stop early once all parity checks pass
    #[serde(default = "default_early_termination")]
    pub early_termination: bool,
}

impl Default for LdpcConfig {
    fn default() -> Self {
        Self {
            base_graph: default_base_graph(),
            lifting_size: default_lifting_size(),
            max_iterations: default_max_iterations(),
            early_termination: default_early_termination(),
        }
    }
}

impl LdpcConfig {
    /// Information bits per codeblock (22·Z for BG1, 10·Z for BG2).
    pub fn info_bits(&self) -> usize {
        let kb = if self.base_graph == 1 { 22 } else { 10 };
        kb * self.lifting_size
    }

    /// Coded bits per codeblock (66·Z for BG1, 50·Z for BG2).
    pub fn coded_bits(&self) -> usize {
        let nb = if self.base_graph == 1 { 66 } else { 50 };
        nb * self.lifting_size
    }

    /// Information bytes per codeblock.
    pub fn info_bytes(&self) -> usize {
        self.info_bits() / 8
    }
}

fn default_base_graph() -> u16 {
    2
}
fn default_lifting_size() -> usize {
    48
}
fn default_max_iterations() -> usize {
    10
}
fn default_early_termination() -> bool {
    true
}

/// The raw configuration document. Every field has a documented default;
/// unknown fields are rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Cell identity stamped on every packet
    #[serde(default)]
    pub cell_id: u32,
    /// Number of base-station antennas
    #[serde(default = "default_antennas")]
    pub antennas: usize,
    /// Number of single-antenna users
    #[serde(default = "default_ues")]
    pub ues: usize,
    /// Total OFDM subcarriers (FFT size)
    #[serde(default = "default_ofdm_ca")]
    pub ofdm_ca: usize,
    /// Cyclic prefix length in samples
    #[serde(default = "default_cp_len")]
    pub cp_len: usize,
    /// First data subcarrier
    #[serde(default = "default_ofdm_data_start")]
    pub ofdm_data_start: usize,
    /// Number of data subcarriers
    #[serde(default = "default_ofdm_data_num")]
    pub ofdm_data_num: usize,
    /// Frame template string, one code per symbol slot
    #[serde(default = "default_frame_template")]
    pub frame_template: String,
    /// Modulation: "QPSK", "16QAM" or "64QAM"
    #[serde(default = "default_modulation")]
    pub modulation: String,
    /// LDPC parameters
    #[serde(default)]
    pub ldpc: LdpcConfig,
    /// Frames kept in flight (window size W)
    #[serde(default = "default_frame_window")]
    pub frame_window: usize,
    /// Data subcarriers per zero-forcing task
    #[serde(default = "default_zf_block_size")]
    pub zf_block_size: usize,
    /// Data subcarriers per demodulation task
    #[serde(default = "default_demul_block_size")]
    pub demul_block_size: usize,
    /// Compute worker threads
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Receive threads; antennas are split evenly across them
    #[serde(default = "default_rx_threads")]
    pub rx_threads: usize,
    /// Packet landings per receive-thread ring
    #[serde(default = "default_ring_depth")]
    pub ring_depth: usize,
    /// First core of the pinned layout (master, then rx, workers, tx)
    #[serde(default)]
    pub core_offset: usize,
    /// Pin threads to cores; failures are fatal only when strict
    #[serde(default)]
    pub pin_threads: bool,
    /// Treat a failed core pin as fatal instead of degrading
    #[serde(default)]
    pub strict_pinning: bool,
    /// Statically type each worker to one stage group
    #[serde(default)]
    pub bigstation_mode: bool,
    /// Big-station stage thread counts; must sum to worker_threads
    #[serde(default)]
    pub fft_threads: usize,
    #[serde(default)]
    pub zf_threads: usize,
    #[serde(default)]
    pub demul_threads: usize,
    #[serde(default)]
    pub decode_threads: usize,
    /// Park packets ahead of the window instead of dropping them
    #[serde(default = "default_true")]
    pub park_out_of_window: bool,
    /// UDP bind address for receive threads
    #[serde(default = "default_loopback")]
    pub rx_addr: String,
    /// Base UDP port; rx thread t binds rx_port_base + t (0 = ephemeral)
    #[serde(default = "default_rx_port_base")]
    pub rx_port_base: u16,
    /// Destination for downlink IQ packets
    #[serde(default = "default_loopback")]
    pub tx_addr: String,
    #[serde(default = "default_tx_port_base")]
    pub tx_port_base: u16,
    /// Stop after retiring this many frames (0 = run until signalled)
    #[serde(default)]
    pub frames_to_process: usize,
    /// Also write the per-worker duration breakdown at shutdown
    #[serde(default)]
    pub detailed_timing: bool,
    /// Directory for the timestamp and duration files
    #[serde(default = "default_timestamp_dir")]
    pub timestamp_dir: String,
    /// Repeating MAC payload pattern for downlink symbols, hex
    #[serde(default = "default_dl_payload")]
    pub dl_payload: String,
}

fn default_antennas() -> usize {
    8
}
fn default_ues() -> usize {
    2
}
fn default_ofdm_ca() -> usize {
    2048
}
fn default_cp_len() -> usize {
    160
}
fn default_ofdm_data_start() -> usize {
    424
}
fn default_ofdm_data_num() -> usize {
    1200
}
fn default_frame_template() -> String {
    "BPPUUUUUUU".to_string()
}
fn default_modulation() -> String {
    "QPSK".to_string()
}
fn default_frame_window() -> usize {
    40
}
fn default_zf_block_size() -> usize {
    40
}
fn default_demul_block_size() -> usize {
    48
}
fn default_worker_threads() -> usize {
    4
}
fn default_rx_threads() -> usize {
    1
}
fn default_ring_depth() -> usize {
    2048
}
fn default_true() -> bool {
    true
}
fn default_loopback() -> String {
    "127.0.0.1".to_string()
}
fn default_rx_port_base() -> u16 {
    8000
}
fn default_tx_port_base() -> u16 {
    9000
}
fn default_timestamp_dir() -> String {
    ".".to_string()
}
fn default_dl_payload() -> String {
    "DEADBEEF".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// Validated configuration with all derived constants, shared read-only
/// across every thread.
#[derive(Debug)]
pub struct Config {
    pub cell_id: CellId,
    pub antennas: usize,
    pub ues: usize,
    pub ofdm_ca: usize,
    pub cp_len: usize,
    pub ofdm_data_start: usize,
    pub ofdm_data_num: usize,
    pub frame: FrameSchedule,
    pub modulation: Modulation,
    pub ldpc: LdpcConfig,
    pub frame_window: usize,
    pub zf_block_size: usize,
    pub demul_block_size: usize,
    pub worker_threads: usize,
    pub rx_threads: usize,
    pub ring_depth: usize,
    pub core_offset: usize,
    pub pin_threads: bool,
    pub strict_pinning: bool,
    pub bigstation_mode: bool,
    pub stage_threads: [usize; 4],
    pub park_out_of_window: bool,
    pub rx_addr: String,
    pub rx_port_base: u16,
    pub tx_addr: String,
    pub tx_port_base: u16,
    pub frames_to_process: usize,
    pub detailed_timing: bool,
    pub timestamp_dir: String,
    pub dl_payload: Vec<u8>,

    // Derived once at load
    /// IQ samples per time-domain symbol (CP + FFT size)
    pub samples_per_symbol: usize,
    /// Zero-forcing tasks per frame
    pub zf_events_per_symbol: usize,
    /// Demodulation tasks per data symbol
    pub demul_events_per_symbol: usize,
    /// Codeblocks per data symbol for one user
    pub codeblocks_per_ue: usize,
    /// Codeblocks per data symbol across all users
    pub codeblocks_per_symbol: usize,
}

impl Config {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        Self::from_file(file)
    }

    /// Validate a raw configuration and derive the scheduling constants.
    pub fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let frame = FrameSchedule::parse(&file.frame_template)?;
        let modulation = Modulation::from_name(&file.modulation)
            .ok_or_else(|| ConfigError::BadModulation(file.modulation.clone()))?;

        if file.antennas == 0 || file.ues == 0 {
            return Err(ConfigError::Inconsistent(
                "antennas and ues must be at least 1".into(),
            ));
        }
        if file.ues > file.antennas {
            return Err(ConfigError::Inconsistent(format!(
                "ues ({}) exceed antennas ({})",
                file.ues, file.antennas
            )));
        }
        if file.ofdm_data_start + file.ofdm_data_num > file.ofdm_ca {
            return Err(ConfigError::Inconsistent(format!(
                "data span {}+{} exceeds ofdm_ca {}",
                file.ofdm_data_start, file.ofdm_data_num, file.ofdm_ca
            )));
        }
        if !file.ofdm_ca.is_power_of_two() {
            return Err(ConfigError::Inconsistent(format!(
                "ofdm_ca {} is not a power of two",
                file.ofdm_ca
            )));
        }
        if file.frame_window == 0 {
            return Err(ConfigError::Inconsistent("frame_window must be positive".into()));
        }
        if file.worker_threads == 0 || file.rx_threads == 0 {
            return Err(ConfigError::Inconsistent(
                "worker_threads and rx_threads must be at least 1".into(),
            ));
        }
        if file.antennas % file.rx_threads != 0 {
            return Err(ConfigError::Inconsistent(format!(
                "antennas ({}) not divisible by rx_threads ({})",
                file.antennas, file.rx_threads
            )));
        }
        if file.ldpc.base_graph != 1 && file.ldpc.base_graph != 2 {
            return Err(ConfigError::Inconsistent(format!(
                "ldpc base_graph must be 1 or 2, got {}",
                file.ldpc.base_graph
            )));
        }
        if file.ldpc.info_bits() % 8 != 0 {
            return Err(ConfigError::Inconsistent(format!(
                "ldpc information bits ({}) must be byte aligned",
                file.ldpc.info_bits()
            )));
        }

        for (name, block) in [
            ("zf_block_size", file.zf_block_size),
            ("demul_block_size", file.demul_block_size),
        ] {
            if block == 0 || file.ofdm_data_num % block != 0 {
                return Err(ConfigError::Inconsistent(format!(
                    "ofdm_data_num ({}) not divisible by {} ({})",
                    file.ofdm_data_num, name, block
                )));
            }
        }

        let bits_per_symbol = file.ofdm_data_num * modulation.bits();
        let coded = file.ldpc.coded_bits();
        if bits_per_symbol % coded != 0 {
            return Err(ConfigError::Inconsistent(format!(
                "symbol bits ({bits_per_symbol}) not divisible by coded bits per block ({coded})"
            )));
        }
        let codeblocks_per_ue = bits_per_symbol / coded;

        let has_data = frame.num_ul_symbols() > 0 || frame.num_dl_symbols() > 0;
        if has_data && frame.num_pilot_symbols() != file.ues {
            return Err(ConfigError::Inconsistent(format!(
                "frame has {} pilot symbols for {} users; one pilot per user is required",
                frame.num_pilot_symbols(),
                file.ues
            )));
        }

        let stage_threads = [
            file.fft_threads,
            file.zf_threads,
            file.demul_threads,
            file.decode_threads,
        ];
        if file.bigstation_mode {
            let sum: usize = stage_threads.iter().sum();
            if sum != file.worker_threads {
                return Err(ConfigError::InconsistentThreads {
                    fft: file.fft_threads,
                    zf: file.zf_threads,
                    demul: file.demul_threads,
                    decode: file.decode_threads,
                    workers: file.worker_threads,
                });
            }
            if stage_threads.iter().any(|&n| n == 0) {
                return Err(ConfigError::Inconsistent(
                    "big-station mode requires at least one thread per stage group".into(),
                ));
            }
        }

        // Every id must fit its tag field
        if frame.num_symbols() > 1 << 12 {
            return Err(ConfigError::Inconsistent(format!(
                "frame template has {} symbols; tags carry at most {}",
                frame.num_symbols(),
                1 << 12
            )));
        }
        let max_index = [
            file.antennas,
            file.ofdm_data_num / file.zf_block_size,
            file.ofdm_data_num / file.demul_block_size,
            codeblocks_per_ue * file.ues,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        if max_index > 1 << 16 {
            return Err(ConfigError::Inconsistent(format!(
                "a per-task index reaches {max_index}; tags carry at most {}",
                1 << 16
            )));
        }
        if file.rx_threads > 1 << 8 || file.ring_depth == 0 || file.ring_depth > 1 << 24 {
            return Err(ConfigError::Inconsistent(format!(
                "rx_threads ({}) / ring_depth ({}) exceed the rx tag fields",
                file.rx_threads, file.ring_depth
            )));
        }

        let dl_payload = parse_hex(&file.dl_payload).ok_or_else(|| {
            ConfigError::Inconsistent(format!("dl_payload \"{}\" is not valid hex", file.dl_payload))
        })?;
        if dl_payload.is_empty() {
            return Err(ConfigError::Inconsistent("dl_payload must not be empty".into()));
        }

        Ok(Self {
            cell_id: CellId(file.cell_id),
            antennas: file.antennas,
            ues: file.ues,
            ofdm_ca: file.ofdm_ca,
            cp_len: file.cp_len,
            ofdm_data_start: file.ofdm_data_start,
            ofdm_data_num: file.ofdm_data_num,
            samples_per_symbol: file.ofdm_ca + file.cp_len,
            zf_events_per_symbol: file.ofdm_data_num / file.zf_block_size,
            demul_events_per_symbol: file.ofdm_data_num / file.demul_block_size,
            codeblocks_per_ue,
            codeblocks_per_symbol: codeblocks_per_ue * file.ues,
            frame,
            modulation,
            ldpc: file.ldpc,
            frame_window: file.frame_window,
            zf_block_size: file.zf_block_size,
            demul_block_size: file.demul_block_size,
            worker_threads: file.worker_threads,
            rx_threads: file.rx_threads,
            ring_depth: file.ring_depth,
            core_offset: file.core_offset,
            pin_threads: file.pin_threads,
            strict_pinning: file.strict_pinning,
            bigstation_mode: file.bigstation_mode,
            stage_threads,
            park_out_of_window: file.park_out_of_window,
            rx_addr: file.rx_addr,
            rx_port_base: file.rx_port_base,
            tx_addr: file.tx_addr,
            tx_port_base: file.tx_port_base,
            frames_to_process: file.frames_to_process,
            detailed_timing: file.detailed_timing,
            timestamp_dir: file.timestamp_dir,
            dl_payload,
        })
    }

    /// Antennas handled by one receive thread.
    pub fn antennas_per_rx_thread(&self) -> usize {
        self.antennas / self.rx_threads
    }

    /// Bytes in one wire packet: 16-byte header plus IQ payload.
    pub fn packet_bytes(&self) -> usize {
        16 + 4 * self.samples_per_symbol
    }

    /// Packets expected per frame over all receive symbols and antennas.
    pub fn rx_packets_per_frame(&self) -> usize {
        self.frame.num_rx_symbols() * self.antennas
    }

    /// Uplink codeblocks that must decode before a frame's uplink is done.
    pub fn ul_codeblocks_per_frame(&self) -> usize {
        self.frame.num_ul_symbols() * self.codeblocks_per_symbol
    }

    /// IFFT completions that finish a frame's downlink.
    pub fn dl_iffts_per_frame(&self) -> usize {
        self.frame.num_dl_symbols() * self.antennas
    }

    /// Decoded payload bytes per frame for one user.
    pub fn ul_bytes_per_frame_per_ue(&self) -> usize {
        self.frame.num_ul_symbols() * self.codeblocks_per_ue * self.ldpc.info_bytes()
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len() / 2)
        .map(|i| u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_json() -> String {
        // 100 data subcarriers, QPSK, BG2 Z=4: one codeblock per symbol
        r#"{
            "antennas": 2,
            "ues": 1,
            "ofdm_ca": 128,
            "cp_len": 16,
            "ofdm_data_start": 14,
            "ofdm_data_num": 100,
            "frame_template": "PU",
            "modulation": "QPSK",
            "ldpc": { "base_graph": 2, "lifting_size": 4 },
            "frame_window": 4,
            "zf_block_size": 25,
            "demul_block_size": 50,
            "worker_threads": 2
        }"#
        .to_string()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_json_str("{}").unwrap();
        assert_eq!(cfg.antennas, 8);
        assert_eq!(cfg.frame_window, 40);
        assert_eq!(cfg.modulation, Modulation::Qpsk);
        assert_eq!(cfg.samples_per_symbol, 2048 + 160);
        assert!(cfg.park_out_of_window);
    }

    #[test]
    fn test_derived_constants() {
        let cfg = Config::from_json_str(&small_json()).unwrap();
        assert_eq!(cfg.zf_events_per_symbol, 4);
        assert_eq!(cfg.demul_events_per_symbol, 2);
        // 100 subcarriers * 2 bits = 200 coded bits = one BG2 Z=4 block
        assert_eq!(cfg.codeblocks_per_ue, 1);
        assert_eq!(cfg.ldpc.info_bytes(), 5);
        assert_eq!(cfg.rx_packets_per_frame(), 4);
        assert_eq!(cfg.packet_bytes(), 16 + 4 * 144);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::from_json_str(r#"{ "antenas": 4 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_bad_template_rejected() {
        let err = Config::from_json_str(r#"{ "frame_template": "PZ" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::BadFrameTemplate(_)));
    }

    #[test]
    fn test_pilot_user_mismatch_rejected() {
        // Two users but a single pilot symbol
        let err = Config::from_json_str(r#"{ "ues": 2, "frame_template": "PU" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_bigstation_thread_sum_rejected() {
        let json = r#"{
            "bigstation_mode": true,
            "worker_threads": 4,
            "fft_threads": 1, "zf_threads": 1, "demul_threads": 1, "decode_threads": 2
        }"#;
        let err = Config::from_json_str(json).unwrap_err();
        assert!(matches!(err, ConfigError::InconsistentThreads { .. }));
    }
}
