//! Run-length entropy models.
//!
//! Three models share one structure: each logical symbol lands in one of
//! `N` states, each state accumulates its own Huffman tree, and the final
//! packet is `N` codebooks followed by the coded symbol stream. Every
//! model produces a pair of packets, one with the symbols as raw 8-bit
//! literals and one prefix coded; the serializer transmits whichever is
//! smaller.

use bytes::Bytes;
use lcevc_bitio::{BitReader, BitWriter};

use crate::config::CompressionType;
use crate::huffman::{HuffmanBuilder, HuffmanDecoder, HuffmanEncoder};
use crate::surface::Surface;
use crate::temporal::{TEMPORAL_INTR, TEMPORAL_PRED};

/// A pair of packets from one entropy coder: raw and prefix coded.
#[derive(Debug, Clone, Default)]
pub struct EncodedChunk {
    /// Symbols as 8-bit literals.
    pub raw: Bytes,
    /// Symbols Huffman coded.
    pub prefix: Bytes,
}

impl EncodedChunk {
    /// Selects the transmitted form: `(data, rle_only)`.
    pub fn select(&self) -> (&Bytes, bool) {
        if self.prefix.len() > self.raw.len() {
            (&self.raw, true)
        } else {
            (&self.prefix, false)
        }
    }
}

// Residual RLE states.
const STATE_LSB: usize = 0;
const STATE_MSB: usize = 1;
const STATE_ZERO: usize = 2;
// Flag RLE states.
const STATE_ZERO_RUN: usize = 0;
const STATE_ONE_RUN: usize = 1;

/// Shared N-state RLE accumulator.
struct RleModel<const N: usize> {
    builders: [HuffmanBuilder; N],
    symbols: Vec<(u8, u8)>,
}

impl<const N: usize> RleModel<N> {
    fn new() -> Self {
        Self {
            builders: std::array::from_fn(|_| HuffmanBuilder::default()),
            symbols: Vec::new(),
        }
    }

    fn push(&mut self, state: usize, symbol: u8) {
        self.symbols.push((state as u8, symbol));
        self.builders[state].add_symbol(symbol, 1);
    }

    /// Emits `count` as 7-bit groups, most significant first, with the
    /// continuation flag on every byte but the last.
    fn push_high_count(&mut self, state: usize, count: u32) {
        if count > 0x7f {
            self.push_high_count(state, count >> 7);
        }
        self.push(state, ((count & 0x7f) | 0x80) as u8);
    }

    fn finish(self, start_value: Option<bool>) -> EncodedChunk {
        let encoders: Vec<HuffmanEncoder> = self.builders.iter().map(HuffmanBuilder::finish).collect();

        let mut raw = BitWriter::new();
        let mut prefix = BitWriter::new();

        for encoder in &encoders {
            encoder.write_codes(&mut prefix);
        }

        if let Some(start) = start_value {
            raw.put_bits(8, start as u32);
            prefix.put_bits(8, start as u32);
        }

        for &(state, symbol) in &self.symbols {
            raw.put_bits(8, u32::from(symbol));
            encoders[state as usize].write_symbol(&mut prefix, symbol);
        }

        EncodedChunk {
            raw: raw.finish(),
            prefix: prefix.finish(),
        }
    }
}

/// Reads symbols for `N` states, either raw literals or prefix coded.
struct SymbolReader<const N: usize> {
    decoders: Option<[HuffmanDecoder; N]>,
}

impl<const N: usize> SymbolReader<N> {
    /// Reads the codebooks when the stream is prefix coded.
    fn new(r: &mut BitReader, rle_only: bool) -> Self {
        Self {
            decoders: (!rle_only).then(|| std::array::from_fn(|_| HuffmanDecoder::read_codes(r))),
        }
    }

    fn next(&self, r: &mut BitReader, state: usize) -> u8 {
        match &self.decoders {
            Some(decoders) => decoders[state].decode_symbol(r),
            None => r.read_bits(8) as u8,
        }
    }

    /// Multibyte run count, most significant group first.
    fn read_count(&self, r: &mut BitReader, state: usize) -> u32 {
        let mut value = 0u32;
        loop {
            let s = self.next(r, state);
            value = (value << 7) | u32::from(s & 0x7f);
            if s & 0x80 == 0 || r.has_overrun() {
                return value;
            }
        }
    }
}

/// Walks `(x, y)` positions of a `width` x `height` grid in 32-pel-tile
/// raster order; `d` is the tile span in transform units.
fn for_each_tiled(width: u32, height: u32, d: u32, mut f: impl FnMut(u32, u32)) {
    let mut ty = 0;
    while ty < height {
        let mut tx = 0;
        while tx < width {
            for y in ty..(ty + d).min(height) {
                for x in tx..(tx + d).min(width) {
                    f(x, y);
                }
            }
            tx += d;
        }
        ty += d;
    }
}

//// Residuals
//

struct ResidualRuns {
    model: RleModel<3>,
    residual: i16,
    zeros: u32,
    has_entropy: bool,
    first: bool,
}

impl ResidualRuns {
    fn new() -> Self {
        Self {
            model: RleModel::new(),
            residual: 0,
            zeros: 0,
            has_entropy: false,
            first: true,
        }
    }

    fn step(&mut self, r: i16) {
        if r != 0 {
            self.has_entropy = true;
        }

        // The first pel seeds the run even when zero.
        if self.first {
            self.first = false;
            self.residual = r;
            self.zeros = 0;
            return;
        }

        if r == 0 {
            self.zeros += 1;
        } else {
            self.emit_run();
            self.residual = r;
            self.zeros = 0;
        }
    }

    fn emit_run(&mut self) {
        let residual = i32::from(self.residual);
        let zeros_bit = if self.zeros > 0 { 0x80u16 } else { 0 };

        if (-32..32).contains(&residual) {
            self.model
                .push(STATE_LSB, (((residual * 2 + 0x40) as u16) | zeros_bit) as u8);
        } else {
            let clamped = ((residual + 0x2000).clamp(0, 0x3fff) as u16) << 1;
            self.model.push(STATE_LSB, ((clamped & 0xfe) | 0x01) as u8);
            self.model.push(STATE_MSB, (((clamped >> 8) & 0x7f) | zeros_bit) as u8);
        }

        if zeros_bit != 0 {
            if self.zeros > 0x7f {
                self.model.push_high_count(STATE_ZERO, self.zeros >> 7);
            }
            self.model.push(STATE_ZERO, (self.zeros & 0x7f) as u8);
        }
    }

    fn finish(mut self) -> Option<EncodedChunk> {
        self.emit_run();
        self.has_entropy.then(|| self.model.finish(None))
    }
}

/// Entropy codes a residual layer in full raster order. Returns `None`
/// when the whole surface is zero.
pub fn encode_residuals(surface: &Surface<i16>) -> Option<EncodedChunk> {
    let mut runs = ResidualRuns::new();
    for y in 0..surface.height() {
        for x in 0..surface.width() {
            runs.step(surface.get(x, y));
        }
    }
    runs.finish()
}

/// Entropy codes a residual layer in 32-pel-tile raster order, used when
/// coding units apply (temporal prediction or tiling).
pub fn encode_residuals_tiled(surface: &Surface<i16>, transform_block_size: u32) -> Option<EncodedChunk> {
    let d = 32 / transform_block_size;
    let mut runs = ResidualRuns::new();
    for_each_tiled(surface.width(), surface.height(), d, |x, y| {
        runs.step(surface.get(x, y));
    });
    runs.finish()
}

struct ResidualPels<'a, 'b> {
    source: SymbolReader<3>,
    reader: &'a mut BitReader<'b>,
    pending_zeros: u32,
}

impl ResidualPels<'_, '_> {
    fn next(&mut self) -> i16 {
        if self.pending_zeros > 0 {
            self.pending_zeros -= 1;
            return 0;
        }

        let lsb = self.source.next(self.reader, STATE_LSB);
        let (pel, zeros_flag) = if lsb & 0x01 == 0 {
            let pel = i16::from((lsb & 0x7f) >> 1) - 0x20;
            (pel, lsb & 0x80 != 0)
        } else {
            let msb = self.source.next(self.reader, STATE_MSB);
            let clamped = (u16::from(msb & 0x7f) << 8) | u16::from(lsb & 0xfe);
            ((clamped >> 1) as i16 - 0x2000, msb & 0x80 != 0)
        };

        if zeros_flag {
            self.pending_zeros = self.source.read_count(self.reader, STATE_ZERO);
        }

        pel
    }
}

/// Decodes a residual layer coded in full raster order.
pub fn decode_residuals(
    width: u32,
    height: u32,
    entropy_enabled: bool,
    rle_only: bool,
    r: &mut BitReader,
) -> Surface<i16> {
    if !entropy_enabled {
        return Surface::blank(width, height);
    }

    let mut pels = ResidualPels {
        source: SymbolReader::new(r, rle_only),
        reader: r,
        pending_zeros: 0,
    };
    Surface::generate(width, height, |_, _| pels.next())
}

/// Decodes a residual layer coded in 32-pel-tile raster order.
pub fn decode_residuals_tiled(
    width: u32,
    height: u32,
    entropy_enabled: bool,
    rle_only: bool,
    r: &mut BitReader,
    transform_block_size: u32,
) -> Surface<i16> {
    if !entropy_enabled {
        return Surface::blank(width, height);
    }

    let d = 32 / transform_block_size;
    let mut pels = ResidualPels {
        source: SymbolReader::new(r, rle_only),
        reader: r,
        pending_zeros: 0,
    };
    let mut b = crate::surface::SurfaceBuilder::new(width, height);
    for_each_tiled(width, height, d, |x, y| {
        b.write(x, y, pels.next());
    });
    b.finish()
}

//// Temporal flags
//

/// Entropy codes the per-transform INTRA/PRED mask in tile raster order.
/// With reduced signalling, a tile whose first flag is INTRA skips its
/// remaining flags. Returns `None` when every flag is PRED.
pub fn encode_temporal(
    surface: &Surface<u8>,
    transform_block_size: u32,
    use_reduced_signalling: bool,
) -> Option<EncodedChunk> {
    let d = 32 / transform_block_size;
    let mut model = RleModel::<2>::new();

    let mut start = false;
    let mut value = false;
    let mut count = 0u32;
    let mut has_entropy = false;
    let mut intra_tile = false;

    for_each_tiled(surface.width(), surface.height(), d, |x, y| {
        let first_transform_in_tile = x % d == 0 && y % d == 0;
        let v = surface.get(x, y) == TEMPORAL_INTR;

        if v {
            has_entropy = true;
        }

        if use_reduced_signalling && first_transform_in_tile {
            intra_tile = v;
        }

        // Reduced signalling: skip the rest of an intra tile.
        if !first_transform_in_tile && use_reduced_signalling && intra_tile {
            return;
        }

        if x == 0 && y == 0 {
            start = v;
            value = v;
            count = 1;
        } else if v == value {
            count += 1;
        } else {
            emit_flag_run(&mut model, value, count);
            value = v;
            count = 1;
        }
    });

    emit_flag_run(&mut model, value, count);

    has_entropy.then(|| model.finish(Some(start)))
}

fn emit_flag_run(model: &mut RleModel<2>, value: bool, count: u32) {
    let state = if value { STATE_ONE_RUN } else { STATE_ZERO_RUN };
    if count > 0x7f {
        model.push_high_count(state, count >> 7);
    }
    model.push(state, (count & 0x7f) as u8);
}

/// Decodes the per-transform temporal mask. Surfaces hold
/// [`TEMPORAL_INTR`] / [`TEMPORAL_PRED`].
pub fn decode_temporal(
    width: u32,
    height: u32,
    entropy_enabled: bool,
    rle_only: bool,
    r: &mut BitReader,
    transform_block_size: u32,
    use_reduced_signalling: bool,
) -> Surface<u8> {
    if !entropy_enabled {
        return Surface::filled(TEMPORAL_PRED, width, height);
    }

    let d = 32 / transform_block_size;
    let source = SymbolReader::<2>::new(r, rle_only);

    // The starting value is an 8-bit literal in both stream forms.
    let start = r.read_bits(8) != 0;
    let mut value = start;
    let mut remaining = source.read_count(r, if value { STATE_ONE_RUN } else { STATE_ZERO_RUN });
    let mut intra_tile = false;

    let mut b = crate::surface::SurfaceBuilder::new(width, height);
    for_each_tiled(width, height, d, |x, y| {
        let first_transform_in_tile = x % d == 0 && y % d == 0;

        // Flags inside an intra tile were never coded.
        if !first_transform_in_tile && use_reduced_signalling && intra_tile {
            b.write(x, y, TEMPORAL_INTR);
            return;
        }

        if remaining == 0 {
            value = !value;
            remaining = source.read_count(r, if value { STATE_ONE_RUN } else { STATE_ZERO_RUN });
        }
        remaining = remaining.saturating_sub(1);

        if use_reduced_signalling && first_transform_in_tile {
            intra_tile = value;
        }

        b.write(x, y, if value { TEMPORAL_INTR } else { TEMPORAL_PRED });
    });
    b.finish()
}

//// Plain flags (per-tile entropy enabled)
//

/// Entropy codes a plane of boolean flags in raster order.
pub fn encode_flags(surface: &Surface<u8>) -> EncodedChunk {
    let mut model = RleModel::<2>::new();

    let mut start = false;
    let mut value = false;
    let mut count = 0u32;

    for y in 0..surface.height() {
        for x in 0..surface.width() {
            let v = surface.get(x, y) != 0;
            if x == 0 && y == 0 {
                start = v;
                value = v;
                count = 1;
            } else if v == value {
                count += 1;
            } else {
                emit_flag_run(&mut model, value, count);
                value = v;
                count = 1;
            }
        }
    }

    emit_flag_run(&mut model, value, count);
    model.finish(Some(start))
}

/// Decodes a plane of boolean flags (stored as 0/1).
pub fn decode_flags(width: u32, height: u32, r: &mut BitReader, rle_only: bool) -> Surface<u8> {
    let source = SymbolReader::<2>::new(r, rle_only);

    // The starting value is an 8-bit literal in both stream forms.
    let start = r.read_bits(8) != 0;
    let mut value = start;
    let mut remaining = source.read_count(r, if value { STATE_ONE_RUN } else { STATE_ZERO_RUN });

    Surface::generate(width, height, |_, _| {
        if remaining == 0 {
            value = !value;
            remaining = source.read_count(r, if value { STATE_ONE_RUN } else { STATE_ZERO_RUN });
        }
        remaining = remaining.saturating_sub(1);
        u8::from(value)
    })
}

//// Tile sizes
//

/// Entropy codes the sizes of enabled tiles, either as absolute values or
/// as deltas from the previous size.
pub fn encode_sizes(
    sizes: &Surface<u16>,
    entropy_enabled: &[bool],
    tile_idx: usize,
    compression_type: CompressionType,
) -> EncodedChunk {
    let mut model = RleModel::<2>::new();

    match compression_type {
        CompressionType::Prefix => {
            for y in 0..sizes.height() {
                for x in 0..sizes.width() {
                    if entropy_enabled[tile_idx + x as usize] {
                        let v = sizes.get(x, y);
                        debug_assert!(v != 0 && v <= 32767);
                        encode_size(&mut model, v);
                    }
                }
            }
        }
        CompressionType::PrefixOnDiff => {
            let mut prev = 0i32;
            for y in 0..sizes.height() {
                for x in 0..sizes.width() {
                    if entropy_enabled[tile_idx + x as usize] {
                        let v = i32::from(sizes.get(x, y));
                        encode_size_delta(&mut model, v - prev);
                        prev = v;
                    }
                }
            }
        }
        CompressionType::None => unreachable!("uncompressed sizes are written directly"),
    }

    model.finish(None)
}

fn encode_size(model: &mut RleModel<2>, value: u16) {
    if value < 0x80 {
        model.push(STATE_LSB, (value * 2) as u8);
    } else {
        model.push(STATE_LSB, (((value & 0x7f) * 2) | 0x01) as u8);
        model.push(STATE_MSB, (value >> 7) as u8);
    }
}

fn encode_size_delta(model: &mut RleModel<2>, value: i32) {
    debug_assert!((-16384..=16383).contains(&value));

    // The decoder sign extends.
    if (-64..=63).contains(&value) {
        model.push(STATE_LSB, ((value * 2) & 0xff) as u8);
    } else {
        model.push(STATE_LSB, (((value & 0x7f) * 2) | 0x01) as u8);
        model.push(STATE_MSB, ((value >> 7) & 0xff) as u8);
    }
}

/// Decodes the sizes of enabled tiles; disabled tiles read back zero.
pub fn decode_sizes(
    width: u32,
    height: u32,
    r: &mut BitReader,
    rle_only: bool,
    entropy_enabled: &[bool],
    tile_idx: usize,
    compression_type: CompressionType,
) -> Surface<u16> {
    let source = SymbolReader::<2>::new(r, rle_only);
    let mut prev = 0i32;

    Surface::generate(width, height, |x, _| {
        if !entropy_enabled[tile_idx + x as usize] {
            return 0;
        }
        match compression_type {
            CompressionType::Prefix => decode_size(&source, r),
            CompressionType::PrefixOnDiff => {
                let delta = decode_size_delta(&source, r);
                prev += i32::from(delta);
                prev as u16
            }
            CompressionType::None => unreachable!("uncompressed sizes are read directly"),
        }
    })
}

fn decode_size(source: &SymbolReader<2>, r: &mut BitReader) -> u16 {
    let lsb = source.next(r, STATE_LSB);
    if lsb & 0x01 == 0 {
        u16::from(lsb >> 1)
    } else {
        (u16::from(source.next(r, STATE_MSB)) << 7) | u16::from(lsb >> 1)
    }
}

fn decode_size_delta(source: &SymbolReader<2>, r: &mut BitReader) -> i16 {
    let lsb = source.next(r, STATE_LSB);
    if lsb & 0x01 == 0 {
        i16::from(lsb as i8 >> 1)
    } else {
        let msb = source.next(r, STATE_MSB);
        (i16::from(msb as i8) << 7) | i16::from(lsb >> 1)
    }
}

#[cfg(test)]
mod tests {
    use lcevc_bitio::BitReader;

    use super::*;
    use crate::surface::Surface;
    use crate::temporal::{TEMPORAL_INTR, TEMPORAL_PRED};

    fn residual_surface(width: u32, height: u32) -> Surface<i16> {
        Surface::generate(width, height, |x, y| match (x + y * 7) % 11 {
            0 => 0,
            1 => 3,
            2 => -3,
            3 => 40,
            4 => -40,
            5 => 700,
            6 => -700,
            _ => 0,
        })
    }

    #[test]
    fn residual_raster_round_trip() {
        let src = residual_surface(24, 16);
        let chunk = encode_residuals(&src).unwrap();

        for (data, rle_only) in [(&chunk.prefix, false), (&chunk.raw, true)] {
            let mut r = BitReader::new(data);
            let out = decode_residuals(24, 16, true, rle_only, &mut r);
            assert_eq!(out.checksum(), src.checksum());
        }
    }

    #[test]
    fn residual_tiled_round_trip() {
        // 40x40 with d = 8: part tiles on both edges.
        let src = residual_surface(40, 40);
        let chunk = encode_residuals_tiled(&src, 4).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_residuals_tiled(40, 40, true, rle_only, &mut r, 4);
        assert_eq!(out.checksum(), src.checksum());
    }

    #[test]
    fn all_zero_layer_has_no_entropy() {
        assert!(encode_residuals(&Surface::blank(16, 16)).is_none());
    }

    #[test]
    fn first_pel_zero_is_still_coded() {
        let src = Surface::generate(8, 2, |x, y| if x == 7 && y == 1 { -5 } else { 0 });
        let chunk = encode_residuals(&src).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_residuals(8, 2, true, rle_only, &mut r);
        assert_eq!(out.checksum(), src.checksum());
    }

    #[test]
    fn large_magnitudes_clamp_into_msb_range() {
        let src = Surface::generate(4, 1, |x, _| match x {
            0 => i16::MIN,
            1 => i16::MAX,
            2 => 8191,
            _ => -8192,
        });
        let chunk = encode_residuals(&src).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_residuals(4, 1, true, rle_only, &mut r);
        // Values beyond the 14-bit coded range fold onto its limits.
        assert_eq!(out.get(0, 0), -8192);
        assert_eq!(out.get(1, 0), 8191);
        assert_eq!(out.get(2, 0), 8191);
        assert_eq!(out.get(3, 0), -8192);
    }

    #[test]
    fn long_zero_runs_round_trip() {
        let src = Surface::generate(300, 2, |x, y| if (x, y) == (0, 0) || (x, y) == (299, 1) { 9 } else { 0 });
        let chunk = encode_residuals(&src).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_residuals(300, 2, true, rle_only, &mut r);
        assert_eq!(out.checksum(), src.checksum());
    }

    fn mask_surface(width: u32, height: u32) -> Surface<u8> {
        Surface::generate(width, height, |x, y| {
            if (x / 8 + y / 8) % 3 == 0 {
                TEMPORAL_INTR
            } else {
                TEMPORAL_PRED
            }
        })
    }

    #[test]
    fn temporal_round_trip_plain() {
        let src = mask_surface(40, 24);
        let chunk = encode_temporal(&src, 4, false).unwrap();
        for (data, rle_only) in [(&chunk.prefix, false), (&chunk.raw, true)] {
            let mut r = BitReader::new(data);
            let out = decode_temporal(40, 24, true, rle_only, &mut r, 4, false);
            assert_eq!(out.checksum(), src.checksum());
        }
    }

    #[test]
    fn temporal_round_trip_reduced_signalling() {
        // Make whole tiles intra so reduced signalling actually skips.
        let src = Surface::generate(40, 24, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                TEMPORAL_INTR
            } else {
                TEMPORAL_PRED
            }
        });
        let chunk = encode_temporal(&src, 4, true).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_temporal(40, 24, true, rle_only, &mut r, 4, true);
        assert_eq!(out.checksum(), src.checksum());
    }

    #[test]
    fn temporal_reduced_signalling_rewrites_partial_tiles() {
        // A tile whose first transform is INTRA decodes fully INTRA even
        // if the encoder saw mixed flags inside it.
        let mut src = crate::surface::SurfaceBuilder::new(16, 8);
        for y in 0..8 {
            for x in 0..16 {
                src.write(x, y, TEMPORAL_PRED);
            }
        }
        src.write(0, 0, TEMPORAL_INTR);
        src.write(3, 3, TEMPORAL_PRED);
        let src = src.finish();

        let chunk = encode_temporal(&src, 4, true).unwrap();
        let (data, rle_only) = chunk.select();
        let mut r = BitReader::new(data);
        let out = decode_temporal(16, 8, true, rle_only, &mut r, 4, true);

        // First tile (8x8 transforms) is all INTRA on the decode side.
        for y in 0..8 {
            for x in 0..8 {
                assert_eq!(out.get(x, y), TEMPORAL_INTR);
            }
        }
        assert_eq!(out.get(8, 0), TEMPORAL_PRED);
    }

    #[test]
    fn all_pred_mask_is_empty() {
        let src = Surface::filled(TEMPORAL_PRED, 16, 16);
        assert!(encode_temporal(&src, 4, true).is_none());
    }

    #[test]
    fn flags_round_trip() {
        let src = Surface::generate(37, 1, |x, _| u8::from(x % 5 == 0));
        let chunk = encode_flags(&src);
        let mut r = BitReader::new(&chunk.raw);
        let out = decode_flags(37, 1, &mut r, true);
        assert_eq!(out.checksum(), src.checksum());
    }

    #[test]
    fn sizes_round_trip_both_modes() {
        let values: [u16; 6] = [1, 127, 128, 300, 16000, 64];
        let enabled = [true, true, false, true, true, true, true];
        let sizes = Surface::generate(6, 1, |x, _| if enabled[x as usize] { values[x as usize] } else { 0 });

        for mode in [CompressionType::Prefix, CompressionType::PrefixOnDiff] {
            let chunk = encode_sizes(&sizes, &enabled, 0, mode);
            for (data, rle_only) in [(&chunk.prefix, false), (&chunk.raw, true)] {
                let mut r = BitReader::new(data);
                let out = decode_sizes(6, 1, &mut r, rle_only, &enabled, 0, mode);
                for x in 0..6 {
                    if enabled[x as usize] {
                        assert_eq!(out.get(x, 0), values[x as usize], "mode {mode:?} x {x}");
                    } else {
                        assert_eq!(out.get(x, 0), 0);
                    }
                }
            }
        }
    }

    #[test]
    fn prefix_not_larger_for_skewed_symbols() {
        // Heavily repetitive content compresses; the prefix stream must
        // not exceed the raw one by more than the codebook overhead.
        let src = Surface::generate(64, 64, |x, _| if x % 2 == 0 { 1 } else { 0 });
        let chunk = encode_residuals(&src).unwrap();
        assert!(chunk.prefix.len() <= chunk.raw.len());
    }
}
