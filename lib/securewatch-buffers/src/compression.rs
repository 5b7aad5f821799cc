//! Per-payload Zstandard codec with adaptive level and an optionally
//! trained dictionary.
//!
//! Every frame carries a one-byte mode marker so the reader can decode
//! regardless of the settings in force when the frame was written. Payloads
//! below the size threshold, and compression results that do not beat the
//! input by at least 10%, are stored raw.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::config::CompressionConfig;

/// How a stored frame was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Raw,
    Zstd,
    ZstdDictionary,
}

impl PayloadEncoding {
    fn marker(self) -> u8 {
        match self {
            PayloadEncoding::Raw => 0x00,
            PayloadEncoding::Zstd => 0x01,
            PayloadEncoding::ZstdDictionary => 0x02,
        }
    }

    fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(PayloadEncoding::Raw),
            0x01 => Some(PayloadEncoding::Zstd),
            0x02 => Some(PayloadEncoding::ZstdDictionary),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum CompressionError {
    #[snafu(display("compression failed: {source}"))]
    Compress { source: std::io::Error },

    #[snafu(display("decompression failed: {source}"))]
    Decompress { source: std::io::Error },

    #[snafu(display("unknown frame encoding marker {marker:#04x}"))]
    UnknownEncoding { marker: u8 },

    #[snafu(display("frame was written with a dictionary that is not loaded"))]
    DictionaryUnavailable,

    #[snafu(display("empty frame"))]
    EmptyFrame,
}

/// Rolling codec statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompressionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub operations: u64,
    pub total_time: Duration,
}

impl CompressionStats {
    /// Output over input; 1.0 means no gain.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }

    /// Input bytes per second across all operations.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_in as f64 / secs
        }
    }

    pub fn average_time(&self) -> Duration {
        if self.operations == 0 {
            Duration::ZERO
        } else {
            self.total_time / u32::try_from(self.operations).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Debug, Default)]
struct SampleBuffer {
    samples: Vec<Vec<u8>>,
    bytes: usize,
}

/// The compressor shared by the disk spill path.
pub struct Compressor {
    config: CompressionConfig,
    level: AtomicI32,
    dictionary: ArcSwapOption<Vec<u8>>,
    samples: Mutex<SampleBuffer>,
    stats: Mutex<CompressionStats>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("level", &self.level.load(Ordering::Relaxed))
            .field("dictionary", &self.dictionary.load().is_some())
            .finish_non_exhaustive()
    }
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        let dictionary = config
            .dictionary_path
            .as_ref()
            .and_then(|path| load_dictionary(path));

        Self {
            level: AtomicI32::new(config.level),
            dictionary: ArcSwapOption::from(dictionary.map(Arc::new)),
            samples: Mutex::new(SampleBuffer::default()),
            stats: Mutex::new(CompressionStats::default()),
            config,
        }
    }

    pub fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    /// Change the compression level, clamped into zstd's 1..=22.
    pub fn adjust_level(&self, level: i32) {
        let clamped = level.clamp(1, 22);
        self.level.store(clamped, Ordering::Relaxed);
        debug!(message = "Compression level adjusted.", level = clamped);
    }

    /// Suggest a level for the given CPU headroom and desired throughput.
    ///
    /// High CPU load or a high throughput target pushes toward fast levels;
    /// an idle machine with a modest target can afford strong ones.
    pub fn recommend_level(&self, cpu_load: f64, target_throughput: f64) -> i32 {
        let cpu_load = cpu_load.clamp(0.0, 1.0);
        let base = 19.0 - cpu_load * 16.0;
        // Above ~200 MiB/s only the fast levels keep up.
        let cap = if target_throughput >= 200.0 * 1024.0 * 1024.0 {
            3.0
        } else if target_throughput >= 50.0 * 1024.0 * 1024.0 {
            9.0
        } else {
            22.0
        };
        (base.min(cap).round() as i32).clamp(1, 22)
    }

    pub fn has_dictionary(&self) -> bool {
        self.dictionary.load().is_some()
    }

    pub fn stats(&self) -> CompressionStats {
        *self.stats.lock()
    }

    /// Encode a payload into a self-describing frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if !self.config.enabled || payload.len() < self.config.min_size {
            return Ok(frame(PayloadEncoding::Raw, payload));
        }

        self.record_sample(payload);

        let started = Instant::now();
        let level = self.level();
        let dictionary = self.dictionary.load_full();

        let (encoding, compressed) = match &dictionary {
            Some(dict) => {
                let mut compressor =
                    zstd::bulk::Compressor::with_dictionary(level, dict).context(CompressSnafu)?;
                let out = compressor.compress(payload).context(CompressSnafu)?;
                (PayloadEncoding::ZstdDictionary, out)
            }
            None => {
                let out = zstd::bulk::compress(payload, level).context(CompressSnafu)?;
                (PayloadEncoding::Zstd, out)
            }
        };
        let elapsed = started.elapsed();

        {
            let mut stats = self.stats.lock();
            stats.bytes_in += payload.len() as u64;
            stats.operations += 1;
            stats.total_time += elapsed;
            stats.bytes_out += compressed.len().min(payload.len()) as u64;
        }

        // A result within 10% of the input is not worth the decode cost.
        if compressed.len() as f64 > payload.len() as f64 * 0.9 {
            return Ok(frame(PayloadEncoding::Raw, payload));
        }

        Ok(frame(encoding, &compressed))
    }

    /// Decode a frame produced by `encode`, under any settings.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let (marker, body) = data.split_first().ok_or(CompressionError::EmptyFrame)?;
        let encoding = PayloadEncoding::from_marker(*marker)
            .ok_or(CompressionError::UnknownEncoding { marker: *marker })?;

        match encoding {
            PayloadEncoding::Raw => Ok(body.to_vec()),
            PayloadEncoding::Zstd => {
                zstd::bulk::decompress(body, MAX_DECOMPRESSED_SIZE).context(DecompressSnafu)
            }
            PayloadEncoding::ZstdDictionary => {
                let dictionary = self
                    .dictionary
                    .load_full()
                    .ok_or(CompressionError::DictionaryUnavailable)?;
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&dictionary)
                    .context(DecompressSnafu)?;
                decompressor
                    .decompress(body, MAX_DECOMPRESSED_SIZE)
                    .context(DecompressSnafu)
            }
        }
    }

    /// The encoding a frame was written with, without decoding it.
    pub fn frame_encoding(data: &[u8]) -> Option<PayloadEncoding> {
        data.first().copied().and_then(PayloadEncoding::from_marker)
    }

    fn record_sample(&self, payload: &[u8]) {
        if !self.config.dictionary_enabled
            || self.has_dictionary()
            || payload.len() > MAX_SAMPLE_SIZE
        {
            return;
        }

        let trained = {
            let mut buffer = self.samples.lock();
            buffer.samples.push(payload.to_vec());
            buffer.bytes += payload.len();
            if buffer.samples.len() >= self.config.dictionary_sample_count {
                let samples = std::mem::take(&mut buffer.samples);
                buffer.bytes = 0;
                Some(samples)
            } else {
                None
            }
        };

        if let Some(samples) = trained {
            match zstd::dict::from_samples(&samples, self.config.dictionary_max_size) {
                Ok(dict) => {
                    info!(
                        message = "Compression dictionary trained.",
                        samples = samples.len(),
                        dictionary_size = dict.len(),
                    );
                    if let Some(path) = &self.config.dictionary_path {
                        if let Err(error) = std::fs::write(path, &dict) {
                            warn!(message = "Failed to persist compression dictionary.", %error);
                        }
                    }
                    self.dictionary.store(Some(Arc::new(dict)));
                }
                Err(error) => {
                    debug!(message = "Dictionary training failed, continuing without.", %error);
                }
            }
        }
    }
}

const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;
const MAX_SAMPLE_SIZE: usize = 64 * 1024;

fn frame(encoding: PayloadEncoding, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(encoding.marker());
    out.extend_from_slice(body);
    out
}

fn load_dictionary(path: &PathBuf) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(dict) if !dict.is_empty() => Some(dict),
        Ok(_) => None,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            warn!(message = "Failed to load compression dictionary.", %error);
            None
        }
    }
}
