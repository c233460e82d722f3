//! Builders for synthetic archive files.
//!
//! Hand-constructed, uncompressed Archive II fragments for tests; also
//! used by downstream crates to feed the full pipeline without shipping
//! real radar captures.

use crate::message::MESSAGE_HEADER_SIZE;

/// One synthetic moment block: `num_gates` gates, all carrying `raw`.
#[derive(Debug, Clone, Copy)]
pub struct MomentSpec {
    pub name: [u8; 3],
    pub num_gates: u16,
    pub first_gate_m: u16,
    pub gate_spacing_m: u16,
    pub scale: f32,
    pub offset: f32,
    pub word_size: u8,
    pub raw: u16,
}

/// Payloads are padded to this size so every synthetic message is at
/// least 512 bytes, like real radial messages. The decoder's zero-run
/// skip inside ARCHIVE2 streams assumes message sizes whose halfword
/// count does not start with a zero byte.
pub const MIN_PAYLOAD: usize = 496;

/// 24-byte volume header with the given ICAO id and time fields.
pub fn volume_header(station: &str, julian_date: u32, milliseconds: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.extend_from_slice(b"AR2V0006.001");
    buf.extend_from_slice(&julian_date.to_be_bytes());
    buf.extend_from_slice(&milliseconds.to_be_bytes());
    let mut id = [b' '; 4];
    id[..station.len().min(4)].copy_from_slice(&station.as_bytes()[..station.len().min(4)]);
    buf.extend_from_slice(&id);
    buf
}

/// Wrap a payload in a 16-byte message header (single segment).
pub fn wrap_message(msg_type: u8, sequence_num: u16, payload: &[u8]) -> Vec<u8> {
    wrap_segment(msg_type, sequence_num, 1, 1, payload)
}

/// Wrap one segment of a multi-segment message.
pub fn wrap_segment(
    msg_type: u8,
    sequence_num: u16,
    num_segments: u16,
    segment_num: u16,
    payload: &[u8],
) -> Vec<u8> {
    assert!(payload.len() % 2 == 0, "message payloads are halfword sized");
    let size_halfwords = ((MESSAGE_HEADER_SIZE + payload.len()) / 2) as u16;
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&size_halfwords.to_be_bytes());
    buf.push(0); // redundancy channel
    buf.push(msg_type);
    buf.extend_from_slice(&sequence_num.to_be_bytes());
    buf.extend_from_slice(&20863u16.to_be_bytes()); // julian date
    buf.extend_from_slice(&0u32.to_be_bytes()); // milliseconds
    buf.extend_from_slice(&num_segments.to_be_bytes());
    buf.extend_from_slice(&segment_num.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Message 31 payload: fixed header, pointer table, moment blocks.
pub fn message31(
    azimuth_deg: f32,
    elevation_deg: f32,
    radial_status: u8,
    elev_number: u8,
    moments: &[MomentSpec],
) -> Vec<u8> {
    let base = 32 + 4 * moments.len();
    let mut payload = vec![0u8; base];

    payload[..4].copy_from_slice(b"KTLX");
    payload[12..16].copy_from_slice(&azimuth_deg.to_be_bytes());
    payload[21] = radial_status;
    payload[22] = elev_number;
    payload[24..28].copy_from_slice(&elevation_deg.to_be_bytes());
    payload[30..32].copy_from_slice(&(moments.len() as u16).to_be_bytes());

    for (i, spec) in moments.iter().enumerate() {
        let block_offset = payload.len() as u32;
        payload[32 + i * 4..36 + i * 4].copy_from_slice(&block_offset.to_be_bytes());
        payload.extend_from_slice(&moment_block(spec));
    }
    pad_payload(&mut payload);
    payload
}

fn pad_payload(payload: &mut Vec<u8>) {
    if payload.len() < MIN_PAYLOAD {
        payload.resize(MIN_PAYLOAD, 0);
    }
    if payload.len() % 2 != 0 {
        payload.push(0);
    }
}

fn moment_block(spec: &MomentSpec) -> Vec<u8> {
    let mut block = vec![0u8; 28];
    block[0] = b'D';
    block[1..4].copy_from_slice(&spec.name);
    block[8..10].copy_from_slice(&spec.num_gates.to_be_bytes());
    block[10..12].copy_from_slice(&spec.first_gate_m.to_be_bytes());
    block[12..14].copy_from_slice(&spec.gate_spacing_m.to_be_bytes());
    block[18] = spec.word_size;
    block[20..24].copy_from_slice(&spec.scale.to_be_bytes());
    block[24..28].copy_from_slice(&spec.offset.to_be_bytes());
    for _ in 0..spec.num_gates {
        match spec.word_size {
            16 => block.extend_from_slice(&spec.raw.to_be_bytes()),
            _ => block.push(spec.raw as u8),
        }
    }
    block
}

/// Message 1 payload: legacy header fields plus a byte-per-gate run.
pub fn legacy_message(
    azimuth_raw: u16,
    elevation_raw: u16,
    radial_status: u8,
    nyquist_raw: u16,
    first_gate_m: u16,
    num_gates: u16,
    gate_raw: u8,
) -> Vec<u8> {
    let mut payload = vec![0u8; 46 + num_gates as usize];
    payload[1] = radial_status;
    payload[8..10].copy_from_slice(&azimuth_raw.to_be_bytes());
    payload[16..18].copy_from_slice(&elevation_raw.to_be_bytes());
    payload[20..22].copy_from_slice(&first_gate_m.to_be_bytes());
    payload[22..24].copy_from_slice(&250u16.to_be_bytes()); // gate size
    payload[24..26].copy_from_slice(&num_gates.to_be_bytes());
    payload[26..28].copy_from_slice(&1150u16.to_be_bytes()); // unambiguous range
    payload[28..30].copy_from_slice(&nyquist_raw.to_be_bytes());
    for g in 0..num_gates as usize {
        payload[46 + g] = gate_raw;
    }
    pad_payload(&mut payload);
    payload
}
