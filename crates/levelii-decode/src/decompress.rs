//! Archive container decompression.
//!
//! Archive files arrive in three shapes: a single bzip2 stream ("BZ"
//! magic), an LDM-framed container (24-byte volume header followed by
//! `(control word, bzip2 block)` records), or already-uncompressed
//! bytes. [`auto_decompress`] detects the shape and produces one flat
//! buffer for the decoder.

use crate::bytes::read_i32_be;
use crate::message::{CONTROL_WORD_SIZE, VOLUME_HEADER_SIZE};
use bzip2::{Decompress, Status};
use levelii_core::{LeveliiError, Result};

/// Expected worst-case expansion of NEXRAD bzip2 data; used to seed
/// output allocations so the growth loop rarely triggers.
const EXPANSION_ESTIMATE: usize = 12;

/// Detect the container shape and decompress `data` into `out`.
///
/// `out` is cleared first; on success it holds the flat message stream
/// (for LDM input, the 24-byte volume header followed by every record's
/// decompressed bytes in order).
///
/// # Errors
///
/// [`LeveliiError::MalformedContainer`] when the container framing is
/// broken before a single record decompressed;
/// [`LeveliiError::Decompression`] when bzip2 rejects the data.
pub fn auto_decompress(data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    if data.is_empty() {
        return Err(LeveliiError::MalformedContainer("empty archive"));
    }

    if data.starts_with(b"BZ") {
        out.reserve(data.len().saturating_mul(EXPANSION_ESTIMATE));
        bunzip_append(data, out)?;
        return Ok(());
    }

    if data.len() >= VOLUME_HEADER_SIZE + CONTROL_WORD_SIZE {
        // An LDM record's payload is itself a bzip2 stream; if the first
        // record lacks the magic, the file is an uncompressed message
        // stream and passes through unchanged.
        let first_block = VOLUME_HEADER_SIZE + CONTROL_WORD_SIZE;
        if data.get(first_block..first_block + 2) == Some(b"BZ".as_slice()) {
            out.reserve(data.len().saturating_mul(EXPANSION_ESTIMATE) + VOLUME_HEADER_SIZE);
            decompress_ldm(data, out)?;
            return Ok(());
        }
    }

    out.extend_from_slice(data);
    Ok(())
}

/// Walk the LDM records after the volume header, appending each
/// decompressed block to `out`. Terminates on a zero control word, a
/// short read, or a bzip2 error after at least one good record.
fn decompress_ldm(data: &[u8], out: &mut Vec<u8>) -> Result<usize> {
    out.extend_from_slice(&data[..VOLUME_HEADER_SIZE]);

    let mut offset = VOLUME_HEADER_SIZE;
    let mut records = 0usize;

    while offset + CONTROL_WORD_SIZE < data.len() {
        let control = read_i32_be(data, offset).expect("bounds checked by loop condition");
        // The control word's sign flags the final record; its absolute
        // value is the compressed block length.
        let block_len = control.unsigned_abs() as usize;
        offset += CONTROL_WORD_SIZE;
        if block_len == 0 {
            break;
        }
        let end = offset.saturating_add(block_len).min(data.len());

        match bunzip_append(&data[offset..end], out) {
            Ok(_) => records += 1,
            Err(err) if records == 0 => return Err(err),
            Err(err) => {
                tracing::debug!(%err, records, "stopping LDM walk on bad record");
                break;
            }
        }
        offset += block_len;
    }

    if records == 0 {
        return Err(LeveliiError::MalformedContainer("truncated control word"));
    }
    Ok(records)
}

/// Decompress one bzip2 stream, appending to `out`.
///
/// Output space is seeded at 12x the input and grown by 1.5x on
/// exhaustion, bounding reallocation cost at the compression ratios
/// this data actually exhibits.
fn bunzip_append(input: &[u8], out: &mut Vec<u8>) -> Result<u64> {
    let mut stream = Decompress::new(false);
    let start = out.len();
    out.resize(
        start + input.len().saturating_mul(EXPANSION_ESTIMATE).max(4096),
        0,
    );

    loop {
        let consumed = stream.total_in() as usize;
        let produced = stream.total_out() as usize;

        let status = stream
            .decompress(&input[consumed..], &mut out[start + produced..])
            .map_err(|e| {
                out.truncate(start);
                LeveliiError::Decompression(format!("{e:?}"))
            })?;

        if matches!(status, Status::StreamEnd) {
            let produced = stream.total_out();
            out.truncate(start + produced as usize);
            return Ok(produced);
        }

        if start + stream.total_out() as usize == out.len() {
            let grow = ((out.len() - start) / 2).max(4096);
            out.resize(out.len() + grow, 0);
        } else if stream.total_in() as usize == input.len() {
            // Input exhausted with space to spare: the stream is cut off.
            out.truncate(start);
            return Err(LeveliiError::Decompression(
                "truncated bzip2 stream".into(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::read::BzEncoder;
    use bzip2::Compression;
    use std::io::Read;

    fn bzip(data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        BzEncoder::new(data, Compression::default())
            .read_to_end(&mut compressed)
            .unwrap();
        compressed
    }

    fn volume_header() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"AR2V0006.001");
        buf.extend_from_slice(&20863u32.to_be_bytes());
        buf.extend_from_slice(&58_964_000u32.to_be_bytes());
        buf.extend_from_slice(b"KTLX");
        buf
    }

    fn ldm_container(blocks: &[&[u8]]) -> Vec<u8> {
        let mut data = volume_header();
        for (i, block) in blocks.iter().enumerate() {
            let compressed = bzip(block);
            let mut control = compressed.len() as i32;
            if i == blocks.len() - 1 {
                control = -control; // last record is negated in real files
            }
            data.extend_from_slice(&control.to_be_bytes());
            data.extend_from_slice(&compressed);
        }
        data
    }

    #[test]
    fn whole_file_bzip2_round_trips() {
        let payload = b"level two message stream".repeat(100);
        let mut out = Vec::new();
        auto_decompress(&bzip(&payload), &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn ldm_concatenates_records_after_header() {
        let a = vec![0xAAu8; 3000];
        let b = vec![0xBBu8; 5000];
        let container = ldm_container(&[&a, &b]);

        let mut out = Vec::new();
        auto_decompress(&container, &mut out).unwrap();

        assert_eq!(&out[..VOLUME_HEADER_SIZE], &volume_header()[..]);
        assert_eq!(&out[VOLUME_HEADER_SIZE..VOLUME_HEADER_SIZE + 3000], &a[..]);
        assert_eq!(&out[VOLUME_HEADER_SIZE + 3000..], &b[..]);
    }

    #[test]
    fn zero_control_word_terminates() {
        let a = vec![0x11u8; 1024];
        let mut container = ldm_container(&[&a]);
        container.extend_from_slice(&0i32.to_be_bytes());
        container.extend_from_slice(b"junk after terminator");

        let mut out = Vec::new();
        auto_decompress(&container, &mut out).unwrap();
        assert_eq!(out.len(), VOLUME_HEADER_SIZE + 1024);
    }

    #[test]
    fn corrupt_first_record_is_an_error() {
        let mut data = volume_header();
        data.extend_from_slice(&100i32.to_be_bytes());
        data.extend_from_slice(b"BZ");
        data.extend_from_slice(&[0u8; 98]); // magic but garbage body

        let mut out = Vec::new();
        let err = auto_decompress(&data, &mut out).unwrap_err();
        assert!(matches!(err, LeveliiError::Decompression(_)));
    }

    #[test]
    fn corrupt_later_record_keeps_earlier_output() {
        let a = vec![0x22u8; 2048];
        let mut container = ldm_container(&[&a]);
        container.extend_from_slice(&64i32.to_be_bytes());
        container.extend_from_slice(&[0xDE; 64]); // not a bzip2 stream

        let mut out = Vec::new();
        auto_decompress(&container, &mut out).unwrap();
        assert_eq!(out.len(), VOLUME_HEADER_SIZE + 2048);
    }

    #[test]
    fn uncompressed_input_passes_through() {
        let mut data = volume_header();
        data.extend_from_slice(&[0u8; 512]); // message bytes, no BZ magic

        let mut out = Vec::new();
        auto_decompress(&data, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn empty_input_is_malformed() {
        let mut out = Vec::new();
        assert!(matches!(
            auto_decompress(&[], &mut out),
            Err(LeveliiError::MalformedContainer(_))
        ));
    }

    #[test]
    fn truncated_bzip2_stream_is_an_error() {
        let compressed = bzip(&[0x55u8; 10_000]);
        let mut out = Vec::new();
        let err = auto_decompress(&compressed[..compressed.len() / 2], &mut out).unwrap_err();
        assert!(matches!(err, LeveliiError::Decompression(_)));
    }
}
