//! Self-describing payload compression.
//!
//! A tagged payload is laid out as:
//!
//! ```text
//! ┌──────────────┬──────────────────┬─────────────────────────────┐
//! │ 4 bytes      │ 4 bytes BE u32   │ algorithm-native bytes      │
//! │ 0x89 'R' 'F' 'S' │ algorithm id │ (gzip / zstd / xz stream)   │
//! └──────────────┴──────────────────┴─────────────────────────────┘
//! ```
//!
//! Algorithm ids: `0` none, `1` gzip, `2` zstd, `3` xz.  Bytes that do not
//! start with the magic are untagged pass-through ("none").  Decoding reads
//! the header first and never guesses: an unknown id, a truncated header or
//! a mismatch against the caller's expected algorithm is an
//! [`FsError::InvalidPayload`].

use std::fmt;
use std::io::{Read, Write};

use serde::Deserialize;

use crate::errors::{FsError, FsResult};

/// Leading bytes of every tagged payload.
pub const HEADER_MAGIC: [u8; 4] = [0x89, b'R', b'F', b'S'];

/// Magic plus the big-endian algorithm id.
pub const HEADER_LEN: usize = 8;

/// Payloads shorter than this are passed through untouched.
pub const DEFAULT_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;
const XZ_PRESET: u32 = 6;

// ---------------------------------------------------------------------------
// Algorithm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    None,
    Gzip,
    Zstd,
    Xz,
}

impl Algorithm {
    /// The three real algorithms, in the order `suggest` tries them.
    pub const SUPPORTED: [Algorithm; 3] = [Algorithm::Zstd, Algorithm::Gzip, Algorithm::Xz];

    pub fn id(self) -> u32 {
        match self {
            Algorithm::None => 0,
            Algorithm::Gzip => 1,
            Algorithm::Zstd => 2,
            Algorithm::Xz => 3,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Algorithm::None),
            1 => Some(Algorithm::Gzip),
            2 => Some(Algorithm::Zstd),
            3 => Some(Algorithm::Xz),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::None => "none",
            Algorithm::Gzip => "gzip",
            Algorithm::Zstd => "zstd",
            Algorithm::Xz => "xz",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Algorithm {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Algorithm::None),
            "gzip" | "gz" => Ok(Algorithm::Gzip),
            "zstd" | "zst" => Ok(Algorithm::Zstd),
            "xz" => Ok(Algorithm::Xz),
            other => Err(FsError::Config(format!("unknown compression algorithm '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Write policy
// ---------------------------------------------------------------------------

/// How much of a payload [`CompressionPolicy::Adaptive`] feeds to `suggest`.
pub const SUGGEST_SAMPLE: usize = 64 * 1024;

/// Which algorithm the bridge uses when writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CompressionPolicy {
    /// Pick the best algorithm for a sample of each payload.
    #[default]
    Adaptive,
    Fixed(Algorithm),
    Off,
}

impl CompressionPolicy {
    /// The algorithm to encode `data` with.
    pub fn choose(self, compressor: &Compressor, data: &[u8]) -> Algorithm {
        match self {
            CompressionPolicy::Off => Algorithm::None,
            CompressionPolicy::Fixed(algorithm) => algorithm,
            CompressionPolicy::Adaptive if data.len() < compressor.threshold() => Algorithm::None,
            CompressionPolicy::Adaptive => {
                compressor.suggest(&data[..data.len().min(SUGGEST_SAMPLE)])
            }
        }
    }
}

impl std::str::FromStr for CompressionPolicy {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adaptive" | "auto" => Ok(CompressionPolicy::Adaptive),
            "off" | "none" => Ok(CompressionPolicy::Off),
            other => other.parse().map(CompressionPolicy::Fixed),
        }
    }
}

impl TryFrom<String> for CompressionPolicy {
    type Error = FsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn header(algorithm: Algorithm) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&HEADER_MAGIC);
    out.extend_from_slice(&algorithm.id().to_be_bytes());
    out
}

/// Read the header of `data`, returning the algorithm and the trailing bytes.
pub fn detect(data: &[u8]) -> FsResult<(Algorithm, &[u8])> {
    if !data.starts_with(&HEADER_MAGIC) {
        return Ok((Algorithm::None, data));
    }
    if data.len() < HEADER_LEN {
        return Err(FsError::InvalidPayload(format!(
            "truncated compression header ({} bytes)",
            data.len()
        )));
    }
    let mut id = [0u8; 4];
    id.copy_from_slice(&data[4..HEADER_LEN]);
    let id = u32::from_be_bytes(id);
    let algorithm = Algorithm::from_id(id)
        .ok_or_else(|| FsError::InvalidPayload(format!("unknown compression algorithm id {id}")))?;
    Ok((algorithm, &data[HEADER_LEN..]))
}

// ---------------------------------------------------------------------------
// Codec primitives
// ---------------------------------------------------------------------------

fn compress_into(algorithm: Algorithm, data: &[u8], out: Vec<u8>) -> std::io::Result<Vec<u8>> {
    match algorithm {
        Algorithm::None => {
            let mut out = out;
            out.extend_from_slice(data);
            Ok(out)
        }
        Algorithm::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            enc.write_all(data)?;
            enc.finish()
        }
        Algorithm::Zstd => {
            let mut out = out;
            zstd::stream::copy_encode(data, &mut out, ZSTD_LEVEL)?;
            Ok(out)
        }
        Algorithm::Xz => {
            let mut enc = xz2::write::XzEncoder::new(out, XZ_PRESET);
            enc.write_all(data)?;
            enc.finish()
        }
    }
}

fn decompress(algorithm: Algorithm, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2));
    match algorithm {
        Algorithm::None => out.extend_from_slice(data),
        Algorithm::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Algorithm::Zstd => {
            zstd::stream::copy_decode(data, &mut out)?;
        }
        Algorithm::Xz => {
            xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Compressor
// ---------------------------------------------------------------------------

/// Encodes and decodes tagged payloads.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold: usize,
    default_algorithm: Algorithm,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl Compressor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            default_algorithm: Algorithm::Zstd,
        }
    }

    /// Algorithm used by [`encode`](Self::encode) when the caller names none.
    pub fn with_default_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.default_algorithm = algorithm;
        self
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode `data` with `algorithm` (or the default one).
    ///
    /// Payloads below the threshold and requests for [`Algorithm::None`] are
    /// passed through; they only gain a header when the raw bytes would
    /// otherwise be mistaken for a tagged payload.
    pub fn encode(&self, data: &[u8], algorithm: Option<Algorithm>) -> FsResult<Vec<u8>> {
        let algorithm = algorithm.unwrap_or(self.default_algorithm);
        if data.len() < self.threshold || algorithm == Algorithm::None {
            if data.starts_with(&HEADER_MAGIC) {
                let mut out = header(Algorithm::None);
                out.extend_from_slice(data);
                return Ok(out);
            }
            return Ok(data.to_vec());
        }
        compress_into(algorithm, data, header(algorithm))
            .map_err(|e| FsError::InvalidPayload(format!("{algorithm} encode failed: {e}")))
    }

    /// Decode a (possibly) tagged payload.
    ///
    /// When `expected` is given it must match the header exactly.
    pub fn decode(&self, data: &[u8], expected: Option<Algorithm>) -> FsResult<Vec<u8>> {
        let (actual, body) = detect(data)?;
        if let Some(expected) = expected
            && expected != actual
        {
            return Err(FsError::InvalidPayload(format!(
                "expected {expected} payload, header says {actual}"
            )));
        }
        decompress(actual, body)
            .map_err(|e| FsError::InvalidPayload(format!("{actual} decode failed: {e}")))
    }

    /// Run every supported algorithm over `sample` and return the one with
    /// the smallest output, or [`Algorithm::None`] when none shrinks it.
    pub fn suggest(&self, sample: &[u8]) -> Algorithm {
        let mut best = (Algorithm::None, sample.len());
        for algorithm in Algorithm::SUPPORTED {
            match compress_into(algorithm, sample, Vec::new()) {
                Ok(out) if out.len() < best.1 => best = (algorithm, out.len()),
                Ok(_) => {}
                Err(e) => tracing::debug!(%algorithm, error = %e, "suggest: encoder failed"),
            }
        }
        best.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
