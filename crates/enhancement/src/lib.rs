//! A pure Rust LCEVC-style enhancement layer codec core.
//!
//! The crate implements the full enhancement pipeline: typed pel surfaces,
//! canonical Huffman coding, the run-length entropy models, the DD/DDS
//! integer transforms, quantization with signalled dead-zone and offset
//! derivation, the temporal prediction engine, resampling with
//! predicted-residual adjustment, the syntax block serializer and
//! deserializer, NAL/SEI encapsulation, and the per-frame encode/decode
//! drivers.
//!
//! External concerns (YUV files, base codec binaries, reporters) live in
//! the companion tool crate; this crate is deterministic and IO-free.

/// Plane addition, subtraction and block comparison.
pub mod compose;
/// Signalled configuration records.
pub mod config;
/// Bit depth conversion and conformance cropping.
pub mod convert;
/// Per-frame decode driver.
pub mod decoder;
/// Level-1 residual filtering.
pub mod deblock;
/// Per-plane, per-LoQ geometry.
pub mod dimensions;
/// Output dithering.
pub mod dither;
/// Downsampling kernels.
pub mod downsample;
/// Per-frame encode driver.
pub mod encoder;
/// Run-length entropy models.
pub mod entropy;
/// Canonical Huffman codec.
pub mod huffman;
/// Image planes and descriptions.
pub mod image;
/// NAL and SEI encapsulation.
pub mod nal;
/// Quantization and dequantization.
pub mod quantize;
/// Pel surfaces.
pub mod surface;
/// Syntax block serializer and deserializer.
pub mod syntax;
/// Temporal prediction engine.
pub mod temporal;
/// Integer transforms.
pub mod transform;
/// Upsampling kernels and predicted-residual adjustment.
pub mod upsample;

pub use self::config::SignaledConfiguration;
pub use self::decoder::Decoder;
pub use self::encoder::Encoder;
pub use self::image::{Colourspace, Image, ImageDescription, Plane};
pub use self::surface::Surface;

/// Maximum number of processed planes.
pub const MAX_NUM_PLANES: usize = 3;
/// Number of levels of quality carrying residual layers.
pub const MAX_NUM_LOQS: usize = 2;
/// Residual layers plus the optional temporal signalling layer.
pub const MAX_NUM_LAYERS: usize = 17;

/// Sub-layer between base and intermediate pictures.
pub const LOQ_LEVEL_1: usize = 1;
/// Sub-layer between intermediate and output pictures.
pub const LOQ_LEVEL_2: usize = 0;

/// Smallest signalable quantization step width.
pub const MIN_STEP_WIDTH: i32 = 1;
/// Largest signalable quantization step width.
pub const MAX_STEP_WIDTH: i32 = 32767;

/// Errors produced by the enhancement codec core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration that cannot be represented in the bitstream.
    #[error("configuration: {0}")]
    Configuration(String),
    /// Malformed enhancement payload.
    #[error("bitstream: {0}")]
    Bitstream(String),
    /// IO error from packet plumbing.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, Error>;
