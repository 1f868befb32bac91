//! Temporal prediction engine.
//!
//! Per transform block the encoder compares an intra trial (residual
//! coded outright) against an inter trial (residual coded as a delta from
//! the accumulated temporal buffer) and signals the cheaper choice. With
//! reduced signalling the decision is summarised per 32x32-pel tile.

use crate::config::{UserDataMethod, UserDataMode};
use crate::surface::Surface;

/// Per-transform flag: residual adds to the accumulated buffer.
pub const TEMPORAL_PRED: u8 = 128;
/// Per-transform flag: residual replaces the accumulated buffer.
pub const TEMPORAL_INTR: u8 = 192;

const COST_CEIL: i32 = (1 << 15) - 1;

/// Index of the layer charged unconditionally on the inter pass, as a
/// proxy for the signalling cost of the temporal decision.
fn signalling_proxy_layer(transform_block_size: u32) -> usize {
    if transform_block_size == 4 {
        5
    } else {
        1
    }
}

/// Cost surface for one trial: per-block SAD between source and
/// reconstruction plus `lambda` per non-zero coded layer.
pub fn cost(
    source: &Surface<i16>,
    recon: &Surface<i16>,
    symbols: &[Surface<i16>],
    transform_block_size: u32,
    lambda: i32,
    intra: bool,
) -> Surface<i16> {
    assert_eq!(source.width(), recon.width());
    assert_eq!(source.height(), recon.height());

    let bs = transform_block_size;
    let proxy = signalling_proxy_layer(bs);
    let dst_width = source.width() / bs;
    let dst_height = source.height() / bs;

    Surface::generate(dst_width, dst_height, |block_x, block_y| {
        let mut sad = 0i32;
        for y in block_y * bs..(block_y + 1) * bs {
            for x in block_x * bs..(block_x + 1) * bs {
                sad += (i32::from(source.get(x, y)) - i32::from(recon.get(x, y))).abs();
            }
        }

        let mut nonzero = 0i32;
        for (layer, syms) in symbols.iter().enumerate() {
            if !intra && layer == proxy {
                // Inter always pays for the signalling layer.
                nonzero += 1;
            } else if syms.get(block_x, block_y) != 0 {
                nonzero += 1;
            }
        }

        let weighted = if bs == 2 {
            // The 2x2 decision underweights the rate term.
            i64::from(lambda) * 6 * i64::from(nonzero) / 10
        } else {
            i64::from(lambda) * i64::from(nonzero)
        };
        (i64::from(sad) + weighted).min(i64::from(COST_CEIL)) as i16
    })
}

/// Pure SAD cost, used when no residual layers are coded. Without a
/// reconstruction this degrades to the sum of absolute source values.
pub fn cost_sad(source: &Surface<i16>, recon: Option<&Surface<i16>>, transform_block_size: u32) -> Surface<i16> {
    let bs = transform_block_size;
    let dst_width = source.width() / bs;
    let dst_height = source.height() / bs;

    Surface::generate(dst_width, dst_height, |block_x, block_y| {
        let mut t = 0i32;
        for y in block_y * bs..(block_y + 1) * bs {
            for x in block_x * bs..(block_x + 1) * bs {
                let s = i32::from(source.get(x, y));
                t += match recon {
                    Some(r) => (s - i32::from(r.get(x, y))).abs(),
                    None => s.abs(),
                };
            }
        }
        t.min(COST_CEIL) as i16
    })
}

/// Per-block decision: PRED where the inter cost does not exceed the
/// intra cost.
pub fn compare_le(intra_cost: &Surface<i16>, inter_cost: &Surface<i16>) -> Surface<u8> {
    Surface::generate(intra_cost.width(), intra_cost.height(), |x, y| {
        if inter_cost.get(x, y) <= intra_cost.get(x, y) {
            TEMPORAL_PRED
        } else {
            TEMPORAL_INTR
        }
    })
}

/// Summarises per-block trial symbols into a per-32x32-tile INTRA/PRED
/// map using the reference percentage and energy rule.
pub fn tile_map(
    intra_symbols: &[Surface<i16>],
    inter_symbols: &[Surface<i16>],
    transform_block_size: u32,
) -> Surface<u8> {
    const TILE_SIZE: u32 = 32;
    let transforms_per_tile = TILE_SIZE / transform_block_size;
    let num_layers = (transform_block_size * transform_block_size) as usize;

    let level_width = intra_symbols[0].width() * transform_block_size;
    let level_height = intra_symbols[0].height() * transform_block_size;
    let tiles_wide = (level_width + TILE_SIZE - 1) / TILE_SIZE;
    let tiles_high = (level_height + TILE_SIZE - 1) / TILE_SIZE;

    Surface::generate(tiles_wide, tiles_high, |x, y| {
        let mut inter_nz = 0u32;
        let mut inter_z = 0u32;
        let mut intra_nz = 0u32;
        let mut intra_z = 0u32;
        let mut inter_accum = 0u32;
        let mut intra_accum = 0u32;
        let mut sav_mixed = 0u32;

        for tile_y in y * transforms_per_tile..(y + 1) * transforms_per_tile {
            if tile_y >= intra_symbols[0].height() {
                continue;
            }
            for tile_x in x * transforms_per_tile..(x + 1) * transforms_per_tile {
                if tile_x >= intra_symbols[0].width() {
                    continue;
                }

                let mut intra_sav = 0u32;
                let mut inter_sav = 0u32;
                for l in 0..num_layers {
                    intra_sav += i32::from(intra_symbols[l].get(tile_x, tile_y)).unsigned_abs();
                    inter_sav += i32::from(inter_symbols[l].get(tile_x, tile_y)).unsigned_abs();
                }

                if inter_sav == 0 && intra_sav == 0 {
                    // Nothing coded either way.
                } else if inter_sav == 0 {
                    inter_z += 1;
                } else if intra_sav == 0 {
                    intra_z += 1;
                } else if intra_sav < inter_sav {
                    intra_nz += 1;
                } else {
                    inter_nz += 1;
                }

                intra_accum += intra_sav;
                inter_accum += inter_sav;
                sav_mixed += intra_sav.min(inter_sav);
            }
        }

        let num_temporals = intra_z + intra_nz + inter_z + inter_nz;
        let intra_pct = (100 * (intra_z + intra_nz)) / (num_temporals + 1);
        let inter_pct = (100 * inter_z) / (num_temporals + 1);
        let intra_accum_75 = intra_accum.wrapping_sub(inter_accum >> 2);
        let inter_accum_25 = inter_accum >> 2;

        if intra_pct > 38 && inter_pct < 20 && (intra_accum_75 <= sav_mixed || inter_accum_25 > sav_mixed) {
            TEMPORAL_INTR
        } else {
            TEMPORAL_PRED
        }
    })
}

/// Applies the tile map onto the per-block mask: intra tiles force every
/// contained transform to INTRA except that only the first flag is
/// meaningful on the wire; pred tiles keep the per-block decisions with
/// the tile-leading flag pinned to PRED.
pub fn tile_intra_signal(
    temporal_tile_map: &Surface<u8>,
    mask: &Surface<u8>,
    transform_block_size: u32,
) -> Surface<u8> {
    let transforms_per_tile = 32 / transform_block_size;

    Surface::generate(mask.width(), mask.height(), |x, y| {
        let tile_intra = temporal_tile_map.get(x / transforms_per_tile, y / transforms_per_tile) == TEMPORAL_INTR;
        let tile_start = x % transforms_per_tile == 0 && y % transforms_per_tile == 0;
        if tile_intra {
            TEMPORAL_INTR
        } else if tile_start {
            TEMPORAL_PRED
        } else {
            mask.get(x, y)
        }
    })
}

/// Embeds the per-transform mask into the LSB of a coefficient layer:
/// `symbol * 2 | intra`. Symbols saturate to the half range first so the
/// embedded value still fits the 14-bit entropy coder; the encoder
/// reconstructs from the stripped form, keeping both sides identical. On
/// refresh pictures there is no mask and the symbols are only doubled.
pub fn insert_mask(symbols: &Surface<i16>, mask: Option<&Surface<u8>>, refresh: bool) -> Surface<i16> {
    let embed = |v: i16| v.clamp(-4096, 4095) * 2;
    match mask {
        Some(mask) if !refresh => {
            assert_eq!(symbols.width(), mask.width());
            assert_eq!(symbols.height(), mask.height());
            Surface::generate(symbols.width(), symbols.height(), |x, y| {
                embed(symbols.get(x, y)) | i16::from(mask.get(x, y) == TEMPORAL_INTR)
            })
        }
        _ => Surface::generate(symbols.width(), symbols.height(), |x, y| embed(symbols.get(x, y))),
    }
}

/// Recovers the embedded mask from the LSBs of a coefficient layer.
pub fn extract_mask(symbols: &Surface<i16>) -> Surface<u8> {
    Surface::generate(symbols.width(), symbols.height(), |x, y| {
        if symbols.get(x, y) & 1 != 0 {
            TEMPORAL_INTR
        } else {
            TEMPORAL_PRED
        }
    })
}

/// Strips the embedded mask bit, restoring the coefficient symbols.
pub fn strip_mask(symbols: &Surface<i16>) -> Surface<i16> {
    Surface::generate(symbols.width(), symbols.height(), |x, y| symbols.get(x, y) >> 1)
}

/// Folds new residuals into the temporal buffer: INTRA blocks replace,
/// PRED blocks accumulate. A missing mask means everything is INTRA.
pub fn update(
    temporal: &Surface<i16>,
    residuals: &Surface<i16>,
    mask: Option<&Surface<u8>>,
    transform_block_size: u32,
    per_picture_intra: bool,
    use_reduced_signalling: bool,
) -> Surface<i16> {
    let Some(mask) = mask else {
        return residuals.clone();
    };

    let tb_shift = transform_block_size.trailing_zeros();
    let d = 32 / transform_block_size;

    Surface::generate(temporal.width(), temporal.height(), |x, y| {
        let per_tile_intra =
            use_reduced_signalling && mask.get_clamped(i64::from((x >> 5) * d), i64::from((y >> 5) * d)) == TEMPORAL_INTR;
        let per_block_intra = mask.get(x >> tb_shift, y >> tb_shift) == TEMPORAL_INTR;
        if per_picture_intra || per_tile_intra || per_block_intra {
            residuals.get(x, y)
        } else {
            residuals.get(x, y).wrapping_add(temporal.get(x, y))
        }
    })
}

/// Zeroes the buffer inside INTRA blocks so stale residuals never leak
/// through a refreshed region.
pub fn apply_map(src: &Surface<i16>, map: &Surface<u8>, transform_block_size: u32) -> Surface<i16> {
    let tb_shift = transform_block_size.trailing_zeros();
    assert_eq!(src.width(), map.width() * transform_block_size);
    assert_eq!(src.height(), map.height() * transform_block_size);

    Surface::generate(src.width(), src.height(), |x, y| {
        if map.get(x >> tb_shift, y >> tb_shift) == TEMPORAL_INTR {
            0
        } else {
            src.get(x, y)
        }
    })
}

fn user_data_bits(mode: UserDataMode) -> u32 {
    match mode {
        UserDataMode::TwoBits => 2,
        UserDataMode::SixBits => 6,
        UserDataMode::None => panic!("no user data embedded"),
    }
}

/// Minimal xorshift32 generator for the random user data methods.
pub struct UserDataSource {
    state: u32,
    method: UserDataMethod,
}

impl UserDataSource {
    /// Fixed seed of the reproducible random method.
    pub const FIXED_SEED: u32 = 45721;

    /// Creates a source for `method` with the given seed (ignored for the
    /// constant methods).
    pub fn new(method: UserDataMethod, seed: u32) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
            method,
        }
    }

    fn next(&mut self) -> u8 {
        match self.method {
            UserDataMethod::Zeros => 0x00,
            UserDataMethod::Ones => 0xff,
            UserDataMethod::Random | UserDataMethod::FixedRandom => {
                let mut x = self.state;
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                self.state = x;
                x as u8
            }
        }
    }
}

/// Embeds user data into the low bits of a symbol layer:
/// `|value| << (size + 1) | sign << size | data`.
pub fn user_data_insert(symbols: &Surface<i16>, mode: UserDataMode, source: &mut UserDataSource) -> Surface<i16> {
    let size = user_data_bits(mode);
    let data_mask: u8 = if size == 6 { 0x3f } else { 0x03 };

    Surface::generate(symbols.width(), symbols.height(), |x, y| {
        let value = symbols.get(x, y);
        let sign = value < 0;
        let value_abs = (value.unsigned_abs()).min(0x1fffu16 >> (size + 1));
        let data = source.next() & data_mask;
        ((value_abs << (size + 1)) | (u16::from(sign) << size) | u16::from(data)) as i16
    })
}

/// Removes embedded user data, restoring the signed symbols.
pub fn user_data_clear(symbols: &Surface<i16>, mode: UserDataMode) -> Surface<i16> {
    let size = user_data_bits(mode);

    Surface::generate(symbols.width(), symbols.height(), |x, y| {
        let mut value = symbols.get(x, y) as u16;
        value >>= size;
        let sign = value & 0x01 != 0;
        value >>= 1;
        if sign {
            -(value as i16)
        } else {
            value as i16
        }
    })
}
