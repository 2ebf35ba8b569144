//! `OverallSegment` codec: `Compress -> frame -> AddPadding -> (caller
//! encrypts)`, and the reverse on read (spec §4.3).
//!
//! Encryption itself lives in `vault-crypto`; this module only produces
//! and consumes the padded plaintext that gets handed to the AEAD layer.

use serde::{Deserialize, Serialize};
use vault_common::{Error, Result};

/// The framed, pre-padding container. Wire-stable: `data` carries the
/// compressed plaintext, length-prefixed by `bincode`'s standard `Vec<u8>`
/// encoding.
#[derive(Serialize, Deserialize)]
struct OverallSegment {
    data: Vec<u8>,
}

/// Compresses `plain` with zstd. Exposed on its own (not just inlined in
/// [`encode_plaintext`]) because the parity subsystem needs this exact
/// compressed byte string as the erasure-coding input for data chunks,
/// cached in the catalog's `tmp_data_compressed` column ahead of the
/// frame+pad step that only matters for wire transport.
pub fn compress(plain: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(plain, 0).map_err(|e| Error::internal(format!("compress: {e}")))
}

/// Reverses [`compress`].
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(compressed).map_err(|e| Error::invalid_format(format!("decompress: {e}")))
}

/// `bincode`'s standard encoding prefixes a `Vec<u8>` with its length as
/// a fixed 8-byte `u64`; `OverallSegment` carries exactly one such vec,
/// so this is the whole of [`frame_and_pad`]'s framing overhead.
const FRAME_OVERHEAD: usize = 8;

/// Conservative worst-case size of `compress(plain)` for `plain_len` raw
/// bytes. zstd's frame/block headers mean compression can *expand*
/// incompressible input (random or already-compressed data — the
/// common case for a backup/sync vault); real overhead for a
/// single-block frame is a small fixed constant plus roughly 1/256 of
/// the input, but this deliberately pads that margin out further so a
/// genuinely incompressible chunk never overflows after framing.
const fn compressed_size_bound(plain_len: usize) -> usize {
    plain_len + plain_len / 128 + 64
}

/// Largest raw chunk size the data path may hand to [`compress`] such
/// that [`frame_and_pad`] is guaranteed to fit within `segment_size`,
/// even for incompressible input. The caller must chunk plaintext at
/// this size (not at `segment_size` itself — compression can expand a
/// chunk, and framing adds further overhead on top of that).
///
/// Fails with [`Error::InvalidFormat`] when `segment_size` is too small
/// to hold a framed, compressed chunk of any length at all (not even
/// zero bytes).
pub fn max_plain_chunk_size(segment_size: u32) -> Result<usize> {
    let segment_size = segment_size as usize;
    let fits = |n: usize| compressed_size_bound(n) + FRAME_OVERHEAD <= segment_size;

    if !fits(0) {
        return Err(Error::invalid_format(format!(
            "segment_size ({segment_size} bytes) is too small to hold a framed, \
             compressed chunk of any length"
        )));
    }

    let (mut lo, mut hi) = (0usize, segment_size);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

/// Frames `compressed` into an `OverallSegment` and pads it to exactly
/// `segment_size` bytes, ready for per-locator encryption. Padding bytes
/// are zero and are never inspected on decode (the frame's length prefix
/// tells the decoder exactly how many bytes are real).
pub fn frame_and_pad(compressed: Vec<u8>, segment_size: u32) -> Result<Vec<u8>> {
    let framed = bincode::serialize(&OverallSegment { data: compressed })
        .map_err(|e| Error::internal(format!("frame: {e}")))?;

    let segment_size = segment_size as usize;
    if framed.len() > segment_size {
        return Err(Error::invalid_format(format!(
            "framed segment ({} bytes) exceeds segment_size ({} bytes); raise segment_size or shrink chunk size",
            framed.len(),
            segment_size
        )));
    }

    let mut padded = framed;
    padded.resize(segment_size, 0);
    Ok(padded)
}

/// Reverses [`frame_and_pad`]: strips padding (implicitly, via the
/// frame's own length prefix) and unframes, yielding the compressed
/// bytes (caller decompresses if it wants plaintext back).
pub fn unframe(padded: &[u8]) -> Result<Vec<u8>> {
    let framed: OverallSegment = bincode::deserialize(padded)
        .map_err(|e| Error::invalid_format(format!("unframe: {e}")))?;
    Ok(framed.data)
}

/// `Compress -> frame -> AddPadding`, in one step.
pub fn encode_plaintext(plain: &[u8], segment_size: u32) -> Result<Vec<u8>> {
    frame_and_pad(compress(plain)?, segment_size)
}

/// Reverses [`encode_plaintext`].
pub fn decode_plaintext(padded: &[u8]) -> Result<Vec<u8>> {
    decompress(&unframe(padded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_small_payload() {
        let plain = b"hello deterministic vault";
        let padded = encode_plaintext(plain, 4096).unwrap();
        assert_eq!(padded.len(), 4096);
        let recovered = decode_plaintext(&padded).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn roundtrips_incompressible_payload() {
        use rand::RngCore;
        let mut plain = vec![0u8; 8 * 1024];
        rand::thread_rng().fill_bytes(&mut plain);
        let padded = encode_plaintext(&plain, 64 * 1024).unwrap();
        assert_eq!(padded.len(), 64 * 1024);
        let recovered = decode_plaintext(&padded).unwrap();
        assert_eq!(recovered, plain);
    }

    #[test]
    fn all_padding_is_indistinguishable_in_length() {
        let small = encode_plaintext(b"a", 4096).unwrap();
        let bigger = encode_plaintext(&vec![7u8; 2000], 4096).unwrap();
        assert_eq!(small.len(), bigger.len());
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let plain = vec![1u8; 10_000];
        let err = encode_plaintext(&plain, 128).unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn decoding_garbage_fails_as_invalid_format() {
        let garbage = vec![0xFFu8; 256];
        assert!(decode_plaintext(&garbage).is_err());
    }

    #[test]
    fn compress_is_deterministic_for_the_same_input() {
        let plain = b"the quick brown fox jumps over the lazy dog, twice over";
        assert_eq!(compress(plain).unwrap(), compress(plain).unwrap());
    }

    #[test]
    fn compress_then_frame_and_pad_matches_encode_plaintext() {
        let plain = b"split pipeline matches the combined one";
        let compressed = compress(plain).unwrap();
        let padded = frame_and_pad(compressed, 2048).unwrap();
        assert_eq!(padded, encode_plaintext(plain, 2048).unwrap());
        assert_eq!(decompress(&unframe(&padded).unwrap()).unwrap(), plain);
    }

    #[test]
    fn max_plain_chunk_size_admits_worst_case_incompressible_input() {
        use rand::RngCore;
        for segment_size in [73u32, 128, 512, 4096, 512 * 1024] {
            let chunk_size = max_plain_chunk_size(segment_size).unwrap();
            let mut plain = vec![0u8; chunk_size];
            rand::thread_rng().fill_bytes(&mut plain);
            let padded = encode_plaintext(&plain, segment_size).unwrap();
            assert_eq!(padded.len(), segment_size as usize);
        }
    }

    #[test]
    fn max_plain_chunk_size_rejects_segment_too_small_for_any_chunk() {
        assert!(max_plain_chunk_size(8).is_err());
    }

    #[test]
    fn max_plain_chunk_size_is_monotonic_in_segment_size() {
        assert!(max_plain_chunk_size(4096).unwrap() > max_plain_chunk_size(512).unwrap());
    }
}
