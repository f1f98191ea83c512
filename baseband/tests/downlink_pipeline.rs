//! End-to-end downlink scenario: pilots in, precoded TX IQ out. A
//! simulated UE receiver applies the reciprocal channel to the emitted
//! packets and must recover the configured MAC payload exactly.

mod util;

use baseband::kernel::fft::FftEngine;
use baseband::kernel::ldpc::{LdpcCode, LdpcScratch};
use baseband::kernel::modulation::ModTable;
use baseband::Runtime;
use common::utils::ci16_to_cfloat;
use num_complex::Complex32;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::{Duration, Instant};
use transport::packet::{PacketHeader, HEADER_BYTES};
use util::{send_packets, small_cell, UplinkGenerator};

fn test_channel() -> Vec<Complex32> {
    vec![Complex32::new(1.0, 0.0), Complex32::new(0.6, -0.3)]
}

#[test]
fn s2_pure_downlink_emits_decodable_tx_packets() {
    let frames = 5u32;

    // The TX sink plays the role of the RRU/channel simulator
    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    sink.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let sink_port = sink.local_addr().unwrap().port();

    let dir = std::env::temp_dir().join("bb_s2");
    std::fs::create_dir_all(&dir).unwrap();
    let cfg = small_cell(
        "PD",
        4,
        &format!(
            r#", "frames_to_process": {frames},
                "tx_port_base": {sink_port},
                "timestamp_dir": "{}""#,
            dir.display()
        ),
    );

    let runtime = Runtime::start(cfg.clone()).unwrap();
    let dest = runtime.rx_addrs()[0];
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let channel = test_channel();
    let mut generator = UplinkGenerator::new(cfg.clone(), channel.clone());

    for frame_id in 0..frames {
        // A pure-downlink frame still needs its uplink pilots
        send_packets(&socket, dest, &generator.frame_packets(frame_id, &[]));
        std::thread::sleep(Duration::from_millis(2));
    }

    // One TX packet per (frame, dl symbol, antenna)
    let expected = frames as usize * cfg.dl_iffts_per_frame();
    let mut tx_packets: HashMap<(u32, u32), Vec<Complex32>> = HashMap::new();
    let mut buf = vec![0u8; cfg.packet_bytes() + 64];
    let deadline = Instant::now() + Duration::from_secs(10);
    while tx_packets.len() < expected && Instant::now() < deadline {
        let Ok((n, _)) = sink.recv_from(&mut buf) else {
            continue;
        };
        assert_eq!(n, cfg.packet_bytes());
        let header = PacketHeader::parse(&buf).unwrap();
        assert_eq!(header.symbol_id, 1, "only the D symbol transmits");
        let iq: Vec<i16> = buf[HEADER_BYTES..n]
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        tx_packets.insert(
            (header.frame_id, header.antenna_id),
            ci16_to_cfloat(&iq),
        );
    }
    let summary = runtime.join().unwrap();
    assert_eq!(summary.frames_retired, frames as usize);
    assert_eq!(summary.tx_packets, expected as u64);
    assert_eq!(tx_packets.len(), expected);

    // Simulated UE: y(sc) = sum_a h_a * x_a(sc); the precoder inverts
    // the channel, so hard demapping must recover the encoded bits
    let mut engine = FftEngine::new(cfg.ofdm_ca);
    let table = ModTable::new(cfg.modulation);
    let ldpc = LdpcCode::new(&cfg.ldpc);
    let mut scratch = LdpcScratch::new(&ldpc);
    let mod_bits = cfg.modulation.bits();
    let expected_info: Vec<u8> = cfg
        .dl_payload
        .iter()
        .copied()
        .cycle()
        .take(cfg.ldpc.info_bytes())
        .collect();

    for frame_id in 0..frames {
        // Per-antenna frequency-domain TX signal
        let mut freq_per_ant = Vec::new();
        for (a, _) in channel.iter().enumerate() {
            let time = &tx_packets[&(frame_id, a as u32)];
            engine.buf.clear();
            engine.buf.extend_from_slice(&time[cfg.cp_len..]);
            engine.forward();
            freq_per_ant.push(engine.buf.clone());
        }

        let mut llr = vec![0i8; cfg.ofdm_data_num * mod_bits];
        for sc in 0..cfg.ofdm_data_num {
            let mut y = Complex32::default();
            for (a, h) in channel.iter().enumerate() {
                y += h * freq_per_ant[a][cfg.ofdm_data_start + sc];
            }
            table.demap_soft(y, &mut llr[sc * mod_bits..(sc + 1) * mod_bits]);
        }

        let mut info = vec![0u8; cfg.ldpc.info_bytes()];
        let dirty = ldpc.decode(&llr[..ldpc.coded_bits()], &mut info, &mut scratch);
        assert!(!dirty, "frame {frame_id} failed parity at the UE");
        assert_eq!(info, expected_info, "frame {frame_id} payload");
    }
}
