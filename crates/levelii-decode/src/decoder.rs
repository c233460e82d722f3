//! The archive decode state machine.
//!
//! One call to [`decode_products`] turns a single (possibly compressed)
//! archive file into one [`RadarFrame`] per requested product. The
//! decoder is a pure function over byte buffers: it never touches the
//! filesystem or network, and per-radial corruption is dropped without
//! failing the file.

use crate::bytes::read_u16_be;
use crate::decompress::auto_decompress;
use crate::message::{
    radial_status, DataBlockHeader, Message31Header, MessageHeader, MomentBlock, RadialBlock,
    RadialMessage, VolumeBlock, ARCHIVE2_METADATA_SLOTS, ARCHIVE2_SLOT_SIZE, MESSAGE_HEADER_SIZE,
    VOLUME_HEADER_SIZE,
};
use crate::segment::MessageSegmenter;
use levelii_core::{
    round_tenth, tilt_key, volume_timestamp, Bin, Product, RadarFrame, Sweep,
};
use std::collections::HashMap;

/// Legacy (Message 1) angle quantum: degrees per count.
const LEGACY_ANGLE_SCALE: f32 = 360.0 / 65536.0;
/// Legacy gate data starts at this payload offset.
const LEGACY_GATE_DATA_OFFSET: usize = 46;
/// Upper bound on messages per file; a runaway-scan backstop.
const MAX_MESSAGES: usize = 200_000;
/// Data block pointers per radial are capped here.
const MAX_BLOCK_COUNT: u16 = 100;

/// Tunables for the decode pass. Defaults match the reference corpus;
/// change them only when replaying against archives that need it.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// How far the byte-by-byte header hunt extends when the {0, +12}
    /// probes miss inside an ARCHIVE2 stream.
    pub header_search_window: usize,
    /// Segment-count cap handed to the reassembler.
    pub max_segments: u16,
    /// Stride over gates; 1 keeps every gate.
    pub gate_stride: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            header_search_window: 4096,
            max_segments: MessageSegmenter::DEFAULT_MAX_SEGMENTS,
            gate_stride: 1,
        }
    }
}

/// Decode every requested product from one archive file.
///
/// `scratch` receives the decompressed message stream (callers hand in
/// a pooled buffer so repeated decodes reuse one large allocation).
/// Station and timestamp hints seed the frames and are overridden by
/// the volume header when it parses.
///
/// Always returns a frame per product; frames are empty when the file
/// could not be unpacked.
pub fn decode_products(
    data: &[u8],
    products: &[Product],
    station_hint: &str,
    timestamp_hint: &str,
    scratch: &mut Vec<u8>,
    options: &DecodeOptions,
) -> HashMap<Product, RadarFrame> {
    let mut frames: HashMap<Product, RadarFrame> = products
        .iter()
        .map(|&p| (p, RadarFrame::new(station_hint, timestamp_hint, p)))
        .collect();

    let Some(volume) = crate::message::VolumeHeader::parse(data) else {
        tracing::debug!(len = data.len(), "file too small for volume header");
        return frames;
    };
    let timestamp = volume_timestamp(volume.julian_date, volume.milliseconds)
        .unwrap_or_else(|| timestamp_hint.to_string());
    for frame in frames.values_mut() {
        frame.station = volume.radar_id.clone();
        frame.timestamp = timestamp.clone();
    }

    if let Err(err) = auto_decompress(data, scratch) {
        tracing::debug!(station = %volume.radar_id, %err, "archive unpack failed");
        return frames;
    }
    let stream: &[u8] = if scratch.is_empty() {
        data
    } else {
        scratch.as_slice()
    };
    if stream.len() < VOLUME_HEADER_SIZE {
        return frames;
    }

    Pass::new(&mut frames, stream, options).run();

    for frame in frames.values_mut() {
        frame.finalize();
    }
    frames
}

/// Mutable state threaded through one scan of the message stream.
struct Pass<'a> {
    frames: &'a mut HashMap<Product, RadarFrame>,
    stream: &'a [u8],
    options: &'a DecodeOptions,
    segmenter: MessageSegmenter,
    is_archive2: bool,

    current_sweep: Option<usize>,
    current_elev_num: u8,
    current_sweep_elevation: f32,
    radial_count: u32,
    ray_counts: HashMap<i32, u32>,
}

impl<'a> Pass<'a> {
    fn new(
        frames: &'a mut HashMap<Product, RadarFrame>,
        stream: &'a [u8],
        options: &'a DecodeOptions,
    ) -> Self {
        let segmenter = MessageSegmenter::with_max_segments(options.max_segments);
        Self {
            frames,
            stream,
            options,
            segmenter,
            is_archive2: false,
            current_sweep: None,
            current_elev_num: 0xFF,
            current_sweep_elevation: -99.0,
            radial_count: 0,
            ray_counts: HashMap::new(),
        }
    }

    fn run(&mut self) {
        let stream = self.stream;
        let mut offset = 0usize;

        if stream.starts_with(b"ARCHIVE2") || stream.starts_with(b"AR2V") {
            self.is_archive2 = true;
            offset = VOLUME_HEADER_SIZE;
        }

        // The metadata record: 134 fixed-width slots carrying VCP and
        // calibration messages. They initialize reassembler state and
        // are then skipped wholesale.
        if self.is_archive2
            && offset + ARCHIVE2_METADATA_SLOTS * ARCHIVE2_SLOT_SIZE <= stream.len()
        {
            for slot in 0..ARCHIVE2_METADATA_SLOTS {
                let slot_offset = offset + slot * ARCHIVE2_SLOT_SIZE + 12;
                let Some(header) = MessageHeader::parse(stream, slot_offset) else {
                    continue;
                };
                if header.msg_type == 0 {
                    continue;
                }
                let payload_start = slot_offset + MESSAGE_HEADER_SIZE;
                let payload_end = offset + (slot + 1) * ARCHIVE2_SLOT_SIZE;
                self.segmenter
                    .add(&header, &stream[payload_start..payload_end.min(stream.len())]);
            }
            offset += ARCHIVE2_METADATA_SLOTS * ARCHIVE2_SLOT_SIZE;
        }

        let mut message_count = 0usize;
        while offset + MESSAGE_HEADER_SIZE <= stream.len() && message_count < MAX_MESSAGES {
            if self.is_archive2 {
                while offset < stream.len() && stream[offset] == 0 {
                    offset += 1;
                }
            }
            if offset + MESSAGE_HEADER_SIZE > stream.len() {
                break;
            }

            let Some((header_offset, header)) = self.locate_header(offset) else {
                offset += 1;
                continue;
            };

            let message_size = header.size_bytes();
            if message_size < MESSAGE_HEADER_SIZE
                || header_offset + message_size > stream.len()
            {
                offset = header_offset + 1;
                continue;
            }

            // Small non-radial messages inside an ARCHIVE2 stream still
            // occupy a full fixed-width slot.
            let mut next_offset = header_offset + message_size;
            if self.is_archive2
                && message_size < ARCHIVE2_SLOT_SIZE - 12
                && header.msg_type != 31
                && header.msg_type != 29
            {
                next_offset = header_offset + (ARCHIVE2_SLOT_SIZE - 12);
            }

            let segment = &stream[header_offset + MESSAGE_HEADER_SIZE..header_offset + message_size];
            if let Some(message) = self.segmenter.add(&header, segment) {
                match RadialMessage::classify(message.msg_type, &message.data) {
                    Some(RadialMessage::Legacy(payload)) => self.handle_message1(payload),
                    Some(RadialMessage::Generic(payload)) => self.handle_message31(payload),
                    None => {}
                }
            }

            offset = next_offset;
            message_count += 1;
        }

        let radial_count = self.radial_count;
        let ray_counts = self.ray_counts.clone();
        for frame in self.frames.values_mut() {
            frame.num_rays = radial_count;
            frame.sweep_ray_counts = ray_counts.clone();
        }
    }

    /// Find a plausible message header at `offset`: first the aligned
    /// probes {0, +12}, then (in ARCHIVE2 streams only) a byte-by-byte
    /// hunt across the configured window.
    fn locate_header(&self, offset: usize) -> Option<(usize, MessageHeader)> {
        for skip in [0usize, 12] {
            if let Some(header) = MessageHeader::parse(self.stream, offset + skip) {
                if header.plausible() {
                    return Some((offset + skip, header));
                }
            }
        }
        if self.is_archive2 {
            for skip in 1..=self.options.header_search_window {
                if let Some(header) = MessageHeader::parse(self.stream, offset + skip) {
                    if header.plausible() {
                        return Some((offset + skip, header));
                    }
                }
            }
        }
        None
    }

    /// Open a new sweep at `elevation` across all frames.
    fn open_sweep(&mut self, elevation: f32, elev_num: u8) {
        let index = self.current_sweep.map_or(0, |i| i + 1);
        self.current_sweep = Some(index);
        self.current_elev_num = elev_num;
        self.current_sweep_elevation = elevation;
        for frame in self.frames.values_mut() {
            frame.sweeps.push(Sweep {
                index,
                elevation_num: elev_num,
                elevation_deg: elevation,
                ..Default::default()
            });
        }
    }

    /// Count the current radial against the active sweep.
    fn count_radial(&mut self) {
        let key = tilt_key(self.current_sweep_elevation);
        *self.ray_counts.entry(key).or_insert(0) += 1;
        if let Some(index) = self.current_sweep {
            for frame in self.frames.values_mut() {
                frame.sweeps[index].ray_count += 1;
            }
        }
        self.radial_count += 1;
    }

    /// Legacy digital radar data: byte-per-gate reflectivity.
    fn handle_message1(&mut self, payload: &[u8]) {
        if payload.len() < 32 {
            return;
        }
        let azimuth =
            read_u16_be(payload, 8).expect("length checked") as f32 * LEGACY_ANGLE_SCALE;
        let elevation =
            read_u16_be(payload, 16).expect("length checked") as f32 * LEGACY_ANGLE_SCALE;
        if !angles_valid(azimuth, elevation) {
            return;
        }

        let status = payload[1];
        if radial_status::opens_sweep(status) || self.current_sweep.is_none() {
            self.open_sweep(elevation, 0);
        }
        let Some(sweep_index) = self.current_sweep else {
            return;
        };
        self.count_radial();

        if payload.len() < LEGACY_GATE_DATA_OFFSET {
            return;
        }
        let unambiguous_raw = read_u16_be(payload, 26).unwrap_or(0);
        let nyquist_raw = read_u16_be(payload, 28).unwrap_or(0);
        let num_gates = read_u16_be(payload, 24).unwrap_or(0);
        let first_gate_m = read_u16_be(payload, 20).unwrap_or(0) as f32;
        let gate_size_m = read_u16_be(payload, 22).unwrap_or(0) as f32;
        let tilt = tilt_key(self.current_sweep_elevation);
        let stride = self.options.gate_stride.max(1);

        for frame in self.frames.values_mut() {
            if frame.product != Product::Reflectivity {
                continue;
            }
            if unambiguous_raw > 0 {
                frame.unambiguous_range_meters = unambiguous_raw as f32 * 100.0;
                frame.max_range_meters =
                    frame.max_range_meters.max(frame.unambiguous_range_meters);
            }
            if nyquist_raw > 0 {
                let nyquist = nyquist_raw as f32 * 0.1;
                frame.nyquist_velocity.insert(tilt, nyquist);
                frame.sweeps[sweep_index].nyquist_velocity = nyquist;
            }
            if num_gates == 0
                || payload.len() < LEGACY_GATE_DATA_OFFSET + num_gates as usize
            {
                continue;
            }
            frame.freeze_geometry(num_gates, gate_size_m, first_gate_m);

            let mut g = 0usize;
            while g < num_gates as usize {
                let gate = g;
                g += stride;
                let raw = payload[LEGACY_GATE_DATA_OFFSET + gate];
                if raw <= 1 {
                    continue;
                }
                let value = (raw as f32 - 66.0) * 0.5;
                if value < -32.0 {
                    continue;
                }
                frame.sweeps[sweep_index].bins.push(Bin {
                    azimuth_deg: azimuth,
                    range_m: first_gate_m + gate as f32 * gate_size_m,
                    value: round_tenth(value),
                });
            }
        }
    }

    /// Generic digital radar data: walk the data-block pointers.
    fn handle_message31(&mut self, payload: &[u8]) {
        let Some(m31) = Message31Header::parse(payload) else {
            return;
        };
        if m31.block_count > MAX_BLOCK_COUNT {
            return;
        }
        if !angles_valid(m31.azimuth_deg, m31.elevation_deg) {
            return;
        }

        let elevation_changed =
            m31.elev_number != self.current_elev_num && self.current_sweep.is_some();
        if radial_status::opens_sweep(m31.radial_status)
            || elevation_changed
            || self.current_sweep.is_none()
        {
            if m31.radial_status == radial_status::START_VOLUME {
                // Fresh volume: stale partial segments must not stitch
                // into the new one.
                self.segmenter.clear();
            }
            self.open_sweep(m31.elevation_deg, m31.elev_number);
        }
        let Some(sweep_index) = self.current_sweep else {
            return;
        };
        self.count_radial();
        let tilt = tilt_key(self.current_sweep_elevation);

        for b in 0..m31.block_count as usize {
            let Some(pointer) = Message31Header::block_pointer(payload, b) else {
                continue;
            };
            let block_offset = pointer as usize;
            let Some(block) = DataBlockHeader::parse(payload, block_offset) else {
                continue;
            };

            if &block.name == b"VOL" {
                if let Some(vol) = VolumeBlock::parse(payload, block_offset) {
                    for frame in self.frames.values_mut() {
                        frame.vcp_number = vol.vcp_number;
                    }
                }
            } else if &block.name == b"RAD" {
                if let Some(rad) = RadialBlock::parse(payload, block_offset) {
                    for frame in self.frames.values_mut() {
                        if rad.nyquist_mps > 0.0 {
                            frame.nyquist_velocity.insert(tilt, rad.nyquist_mps);
                            frame.sweeps[sweep_index].nyquist_velocity = rad.nyquist_mps;
                        }
                        if rad.unambiguous_range_m > 0.0 {
                            frame.unambiguous_range_meters = rad.unambiguous_range_m;
                            frame.max_range_meters =
                                frame.max_range_meters.max(rad.unambiguous_range_m);
                        }
                    }
                }
            } else if block.block_type == b'D' {
                let Some(moment) = MomentBlock::parse(payload, block_offset) else {
                    continue;
                };
                self.extract_moment(payload, block_offset, &moment, m31.azimuth_deg, sweep_index);
            }
        }
    }

    /// Copy one moment block's gates into every frame it targets.
    fn extract_moment(
        &mut self,
        payload: &[u8],
        block_offset: usize,
        moment: &MomentBlock,
        azimuth: f32,
        sweep_index: usize,
    ) {
        let stride = self.options.gate_stride.max(1);
        for frame in self.frames.values_mut() {
            if !frame.product.matches_block(&moment.name) {
                continue;
            }
            frame.freeze_geometry(moment.num_gates, moment.gate_spacing_m, moment.first_gate_m);
            let floor = frame.product.validity_floor();

            let mut g = 0usize;
            while g < moment.num_gates as usize {
                let raw = moment
                    .gate_raw(payload, block_offset, g)
                    .expect("gate run bounds-checked at parse");
                let gate = g;
                g += stride;
                if raw <= 1 {
                    continue;
                }
                let value = (raw as f32 - moment.offset) / moment.scale;
                if floor.is_some_and(|f| value < f) {
                    continue;
                }
                frame.sweeps[sweep_index].bins.push(Bin {
                    azimuth_deg: azimuth,
                    range_m: moment.first_gate_m + gate as f32 * moment.gate_spacing_m,
                    value: round_tenth(value),
                });
            }
        }
    }
}

fn angles_valid(azimuth: f32, elevation: f32) -> bool {
    (-0.1..=360.1).contains(&azimuth) && (-5.0..=90.0).contains(&elevation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{legacy_message, message31, volume_header, wrap_message, MomentSpec};

    fn decode(
        data: &[u8],
        products: &[Product],
    ) -> HashMap<Product, RadarFrame> {
        let mut scratch = Vec::new();
        decode_products(
            data,
            products,
            "????",
            "00000000_000000",
            &mut scratch,
            &DecodeOptions::default(),
        )
    }

    #[test]
    fn minimal_reflectivity_file() {
        let mut file = volume_header("KTLX", 20863, 58_964_000);
        let payload = message31(
            45.0,
            0.5,
            radial_status::START_VOLUME,
            1,
            &[MomentSpec {
                name: *b"REF",
                num_gates: 100,
                first_gate_m: 1000,
                gate_spacing_m: 250,
                scale: 2.0,
                offset: 2.0,
                word_size: 8,
                raw: 128,
            }],
        );
        file.extend_from_slice(&wrap_message(31, 1, &payload));

        let frames = decode(&file, &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];

        assert_eq!(frame.station, "KTLX");
        assert_eq!(frame.timestamp, "20270213_162244");
        assert_eq!(frame.sweeps.len(), 1);
        assert_eq!(frame.sweeps[0].elevation_deg, 0.5);
        assert_eq!(frame.sweeps[0].bins.len(), 100);
        assert_eq!(frame.num_gates, 100);
        assert_eq!(frame.first_gate_meters, 1000.0);
        assert_eq!(frame.gate_spacing_meters, 250.0);
        assert_eq!(frame.available_tilts, vec![0.5]);

        // raw 128 with scale 2.0, offset 2.0 dequantizes to 63.0 dBZ.
        for bin in &frame.sweeps[0].bins {
            assert_eq!(bin.azimuth_deg, 45.0);
            assert!((bin.value - 63.0).abs() < 1e-4);
        }
        assert_eq!(frame.sweeps[0].bins[0].range_m, 1000.0);
        assert_eq!(frame.sweeps[0].bins[1].range_m, 1250.0);
    }

    #[test]
    fn elevation_change_opens_new_sweep() {
        let mut file = volume_header("KTLX", 20863, 0);
        let spec = MomentSpec {
            name: *b"REF",
            num_gates: 20,
            first_gate_m: 0,
            gate_spacing_m: 250,
            scale: 1.0,
            offset: 0.0,
            word_size: 8,
            raw: 100,
        };
        file.extend_from_slice(&wrap_message(
            31,
            1,
            &message31(10.0, 0.5, radial_status::START_VOLUME, 1, &[spec]),
        ));
        file.extend_from_slice(&wrap_message(
            31,
            2,
            &message31(11.0, 0.5, 1, 1, &[spec]),
        ));
        // Same status byte but new elevation number: still a new sweep.
        file.extend_from_slice(&wrap_message(
            31,
            3,
            &message31(10.0, 1.5, 1, 2, &[spec]),
        ));

        let frames = decode(&file, &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];
        assert_eq!(frame.sweeps.len(), 2);
        assert_eq!(frame.sweeps[0].ray_count, 2);
        assert_eq!(frame.sweeps[1].ray_count, 1);
        assert_eq!(frame.available_tilts, vec![0.5, 1.5]);
        assert_eq!(frame.num_rays, 3);
    }

    #[test]
    fn products_filter_moment_blocks() {
        let mut file = volume_header("KCRP", 20863, 0);
        let payload = message31(
            90.0,
            0.5,
            radial_status::START_VOLUME,
            1,
            &[
                MomentSpec {
                    name: *b"REF",
                    num_gates: 16,
                    first_gate_m: 0,
                    gate_spacing_m: 250,
                    scale: 2.0,
                    offset: 2.0,
                    word_size: 8,
                    raw: 128,
                },
                MomentSpec {
                    name: *b"VEL",
                    num_gates: 16,
                    first_gate_m: 0,
                    gate_spacing_m: 250,
                    scale: 2.0,
                    offset: 129.0,
                    word_size: 8,
                    raw: 150,
                },
            ],
        );
        file.extend_from_slice(&wrap_message(31, 1, &payload));

        let frames = decode(&file, &[Product::Reflectivity, Product::Velocity]);
        assert_eq!(frames[&Product::Reflectivity].sweeps[0].bins.len(), 16);
        let vel = &frames[&Product::Velocity].sweeps[0].bins;
        assert_eq!(vel.len(), 16);
        assert!((vel[0].value - 10.5).abs() < 1e-4);
    }

    #[test]
    fn reflectivity_floor_drops_low_values() {
        let mut file = volume_header("KTLX", 20863, 0);
        // raw 10 with scale 1, offset 66 gives -56 dBZ: below the floor.
        let payload = message31(
            0.0,
            0.5,
            radial_status::START_VOLUME,
            1,
            &[MomentSpec {
                name: *b"REF",
                num_gates: 12,
                first_gate_m: 0,
                gate_spacing_m: 250,
                scale: 1.0,
                offset: 66.0,
                word_size: 8,
                raw: 10,
            }],
        );
        file.extend_from_slice(&wrap_message(31, 1, &payload));

        let frames = decode(&file, &[Product::Reflectivity]);
        assert!(frames[&Product::Reflectivity].sweeps[0].bins.is_empty());
    }

    #[test]
    fn sixteen_bit_gates_decode() {
        let mut file = volume_header("KEWX", 20863, 0);
        let payload = message31(
            180.0,
            0.5,
            radial_status::START_VOLUME,
            1,
            &[MomentSpec {
                name: *b"RHO",
                num_gates: 8,
                first_gate_m: 500,
                gate_spacing_m: 250,
                scale: 300.0,
                offset: -60.5,
                word_size: 16,
                raw: 240,
            }],
        );
        file.extend_from_slice(&wrap_message(31, 1, &payload));

        let frames = decode(&file, &[Product::CorrelationCoefficient]);
        let bins = &frames[&Product::CorrelationCoefficient].sweeps[0].bins;
        assert_eq!(bins.len(), 8);
        assert!((bins[0].value - 1.0).abs() < 0.01);
    }

    #[test]
    fn invalid_radials_are_skipped_not_fatal() {
        let mut file = volume_header("KTLX", 20863, 0);
        let spec = MomentSpec {
            name: *b"REF",
            num_gates: 20,
            first_gate_m: 0,
            gate_spacing_m: 250,
            scale: 1.0,
            offset: 0.0,
            word_size: 8,
            raw: 100,
        };
        // Elevation far out of range: dropped.
        file.extend_from_slice(&wrap_message(
            31,
            1,
            &message31(10.0, 95.0, radial_status::START_VOLUME, 1, &[spec]),
        ));
        file.extend_from_slice(&wrap_message(
            31,
            2,
            &message31(10.0, 0.5, radial_status::START_VOLUME, 1, &[spec]),
        ));

        let frames = decode(&file, &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];
        assert_eq!(frame.sweeps.len(), 1);
        assert_eq!(frame.num_rays, 1);
        assert_eq!(frame.sweeps[0].bins.len(), 20);
    }

    #[test]
    fn legacy_message1_decodes_reflectivity() {
        let mut file = volume_header("KTLX", 20863, 0);
        // azimuth 45 deg, elevation 0.5 deg in legacy counts.
        let payload = legacy_message(8192, 91, 0, 100, 1000, 150, 130);
        file.extend_from_slice(&wrap_message(1, 1, &payload));

        let frames = decode(&file, &[Product::Reflectivity, Product::Velocity]);
        let frame = &frames[&Product::Reflectivity];
        assert_eq!(frame.sweeps.len(), 1);
        assert_eq!(frame.sweeps[0].bins.len(), 150);
        // raw 130 -> (130 - 66) * 0.5 = 32 dBZ
        assert!((frame.sweeps[0].bins[0].value - 32.0).abs() < 1e-4);
        assert_eq!(frame.num_gates, 150);
        assert_eq!(frame.first_gate_meters, 1000.0);
        // Message 1 carries no other moments.
        assert!(frames[&Product::Velocity].sweeps[0].bins.is_empty());
    }

    #[test]
    fn segmented_message31_reassembles_through_the_decoder() {
        let mut file = volume_header("KTLX", 20863, 0);
        let mut payload = message31(
            45.0,
            0.5,
            radial_status::START_ELEVATION,
            1,
            &[MomentSpec {
                name: *b"REF",
                num_gates: 100,
                first_gate_m: 1000,
                gate_spacing_m: 250,
                scale: 2.0,
                offset: 2.0,
                word_size: 8,
                raw: 128,
            }],
        );
        // Large enough that each half still makes a full-size message.
        payload.resize(2 * crate::testutil::MIN_PAYLOAD, 0);
        let half = payload.len() / 2;
        assert_eq!(half % 2, 0);
        file.extend_from_slice(&crate::testutil::wrap_segment(31, 7, 2, 1, &payload[..half]));
        file.extend_from_slice(&crate::testutil::wrap_segment(31, 7, 2, 2, &payload[half..]));

        let frames = decode(&file, &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];
        assert_eq!(frame.sweeps.len(), 1);
        assert_eq!(frame.sweeps[0].bins.len(), 100);
        assert!((frame.sweeps[0].bins[0].value - 63.0).abs() < 1e-4);
    }

    #[test]
    fn small_messages_round_up_to_slot_boundaries() {
        // An ARCHIVE2 stream places small non-radial messages in fixed
        // 2,432-byte slots; the next message sits at the slot boundary.
        let mut file = volume_header("KTLX", 20863, 0);
        let status_payload = vec![0u8; 500];
        file.extend_from_slice(&wrap_message(2, 1, &status_payload)); // 516 bytes
        file.resize(24 + 2420, 0); // pad the rest of the slot

        let spec = MomentSpec {
            name: *b"REF",
            num_gates: 500,
            first_gate_m: 0,
            gate_spacing_m: 250,
            scale: 1.0,
            offset: 0.0,
            word_size: 8,
            raw: 100,
        };
        file.extend_from_slice(&wrap_message(
            31,
            2,
            &message31(10.0, 0.5, radial_status::START_VOLUME, 1, &[spec]),
        ));

        let frames = decode(&file, &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];
        assert_eq!(frame.sweeps.len(), 1);
        assert_eq!(frame.sweeps[0].bins.len(), 500);
    }

    #[test]
    fn empty_products_empty_result() {
        let file = volume_header("KTLX", 20863, 0);
        let frames = decode(&file, &[]);
        assert!(frames.is_empty());
    }

    #[test]
    fn garbage_input_yields_empty_frames() {
        let frames = decode(&[0u8; 64], &[Product::Reflectivity]);
        let frame = &frames[&Product::Reflectivity];
        assert!(frame.sweeps.is_empty());
        assert!(!frame.has_samples());
    }
}
