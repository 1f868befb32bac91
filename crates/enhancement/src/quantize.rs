//! Quantization and dequantization.
//!
//! Step widths are reshaped per layer by the quantization matrix, widened
//! through 64-bit intermediates, and clamped to the signalable range. The
//! dead-zone and dequantization offset derivations reproduce the reference
//! constants bit for bit; the `ln` results are truncated to `i32` before
//! any further integer arithmetic.

use crate::config::{DequantOffset, PictureConfiguration, QuantMatrixMode};
use crate::surface::Surface;
use crate::temporal::TEMPORAL_PRED;
use crate::{LOQ_LEVEL_1, LOQ_LEVEL_2, MAX_STEP_WIDTH, MIN_STEP_WIDTH};

const A_CONST: i64 = 39;
const B_CONST: i64 = 126484;
const C_CONST: f64 = 5242.0;
const D_CONST: f64 = 99614.0;

#[rustfmt::skip]
const DEFAULT_QM_4X4: [[u8; 16]; 3] = [
    // LoQ-2, 1-D
    [ 13,  26,  19,  32,  52,   1,  78,   9,  13,  26,  19,  32, 150,  91,  91,  19],
    // LoQ-2, 2-D
    [ 13,  26,  19,  32,  52,   1,  78,   9,  26,  72,   0,   3, 150,  91,  91,  19],
    // LoQ-1
    [  0,   0,   0,   2,  52,   1,  78,   9,  26,  72,   0,   3, 150,  91,  91,  19],
];

const DEFAULT_QM_2X2: [[u8; 4]; 3] = [
    // LoQ-2, 1-D
    [0, 2, 0, 0],
    // LoQ-2, 2-D
    [32, 3, 0, 32],
    // LoQ-1
    [0, 3, 0, 32],
];

fn default_qm(num_layers: usize, horizontal_only: bool, loq: usize, layer: usize) -> i32 {
    let set = if loq == LOQ_LEVEL_1 {
        2
    } else if horizontal_only {
        0
    } else {
        1
    };
    if num_layers == 4 {
        i32::from(DEFAULT_QM_2X2[set][layer])
    } else {
        i32::from(DEFAULT_QM_4X4[set][layer])
    }
}

/// Resolves the quantization matrix coefficient for one layer, honouring
/// the signalled mode and the previous-frame memory (`-1` when unset).
pub fn resolve_quant_matrix(
    picture: &PictureConfiguration,
    num_layers: usize,
    horizontal_only: bool,
    loq: usize,
    layer: usize,
    is_idr: bool,
    previous: i32,
) -> i32 {
    let d = default_qm(num_layers, horizontal_only, loq, layer);

    match picture.quant_matrix_mode {
        QuantMatrixMode::BothPrevious => {
            if is_idr || previous == -1 {
                d
            } else {
                previous
            }
        }
        QuantMatrixMode::BothDefault => d,
        QuantMatrixMode::SameAndCustom => i32::from(picture.qm_coefficient_2[layer]),
        QuantMatrixMode::Level2CustomLevel1Default => {
            if loq == LOQ_LEVEL_2 {
                i32::from(picture.qm_coefficient_2[layer])
            } else {
                d
            }
        }
        QuantMatrixMode::Level2DefaultLevel1Custom => {
            if loq == LOQ_LEVEL_1 {
                i32::from(picture.qm_coefficient_1[layer])
            } else {
                d
            }
        }
        QuantMatrixMode::DifferentAndCustom => {
            if loq == LOQ_LEVEL_2 {
                i32::from(picture.qm_coefficient_2[layer])
            } else {
                i32::from(picture.qm_coefficient_1[layer])
            }
        }
    }
}

/// Derives the per-layer quantization step width from the signalled one.
pub fn dirq_step_width(orig_step_width: i32, quant_matrix_coeff: i32) -> i32 {
    let mut v = i64::from(quant_matrix_coeff);
    v = v * i64::from(orig_step_width) + (1 << 16);
    v = v.clamp(0, 3 << 16);
    v = (v * i64::from(orig_step_width)) >> 16;
    v.clamp(i64::from(MIN_STEP_WIDTH), i64::from(MAX_STEP_WIDTH)) as i32
}

/// Derives the dequantization offset for one layer.
pub fn invq_offset(picture: &PictureConfiguration, orig_step_width: i32, dirq_step_width: i32) -> i32 {
    if !picture.dequant_offset_signalled {
        return 0;
    }
    if picture.dequant_offset == 0 {
        return 0;
    }

    let log_dirq = (-C_CONST * f64::from(dirq_step_width).ln()) as i32;
    let log_orig = (C_CONST * f64::from(orig_step_width).ln()) as i32;

    let shifted = match picture.dequant_offset_mode {
        DequantOffset::ConstOffset => i64::from(picture.dequant_offset) << 9,
        DequantOffset::Default => i64::from(picture.dequant_offset) << 11,
    };

    let offset = (i64::from(log_dirq) + i64::from(log_orig) + shifted) * i64::from(dirq_step_width);
    (offset >> 16) as i32
}

/// Derives the dequantization step width for one layer.
pub fn invq_step_width(picture: &PictureConfiguration, dirq_step_width: i32, invq_offset: i32) -> i32 {
    if !picture.dequant_offset_signalled {
        let mut modifier = (D_CONST - C_CONST * f64::from(dirq_step_width).ln()) as i64;
        modifier = modifier * i64::from(dirq_step_width) * i64::from(dirq_step_width);
        modifier >>= 31;
        return (i64::from(dirq_step_width) + modifier)
            .clamp(i64::from(MIN_STEP_WIDTH), i64::from(MAX_STEP_WIDTH)) as i32;
    }

    match picture.dequant_offset_mode {
        DequantOffset::ConstOffset => dirq_step_width,
        DequantOffset::Default => {
            let modifier = (i64::from(invq_offset) * i64::from(dirq_step_width)) >> 15;
            (i64::from(dirq_step_width) + modifier).clamp(i64::from(MIN_STEP_WIDTH), i64::from(MAX_STEP_WIDTH))
                as i32
        }
    }
}

/// Derives the dead-zone for one layer.
pub fn layer_deadzone(orig_step_width: i32, step_width: i32) -> i32 {
    if orig_step_width > 16 {
        let mut dz = (A_CONST * i64::from(step_width) + B_CONST) >> 1;
        dz = (1 << 16) - dz;
        ((dz * i64::from(step_width)) >> 16) as i32
    } else {
        orig_step_width >> 1
    }
}

/// Combines offset and dead-zone into the value actually applied during
/// dequantization.
pub fn invq_applied_offset(picture: &PictureConfiguration, invq_offset: i32, layer_deadzone: i32) -> i32 {
    if picture.dequant_offset_signalled && picture.dequant_offset_mode == DequantOffset::ConstOffset {
        invq_offset - layer_deadzone
    } else {
        -layer_deadzone
    }
}

fn quantize_one(value: i16, step_width: i32, deadzone: i32) -> i32 {
    let value = i32::from(value);
    let sign = value.signum();
    sign * 0.max((sign * value + deadzone) / step_width)
}

/// Reduced-dead-zone promotion for static content: a coefficient the
/// plain dead-zone would kill survives when the reduced dead-zone lets
/// it through.
fn quantize_static(value: i16, step_width: i32, deadzone: i32, threshold: u32) -> i32 {
    let out = quantize_one(value, step_width, deadzone);

    let value = i32::from(value);
    let sign = value.signum();
    let reduced_deadzone = (threshold as i32 * deadzone) / 5;
    let reduction = sign * 1.min(0.max((sign * value + reduced_deadzone) / step_width));
    let correction = sign * 1.min(0.max((sign * value + deadzone) / step_width));

    out + reduction - correction
}

fn sad_cutoff(transform_block_size: u32) -> i16 {
    if transform_block_size == 4 {
        200
    } else {
        100
    }
}

/// Quantizes one coefficient layer with a sign-symmetric dead-zone,
/// clamping to the 14-bit symbol range. When a per-pel SAD surface is
/// given with an active `threshold` (1..=4), static pels quantize with a
/// reduced dead-zone.
pub fn quantize(
    src: &Surface<i16>,
    dirq_step_width: i32,
    deadzone: i32,
    pixel_sad: Option<&Surface<i16>>,
    transform_block_size: u32,
    threshold: u32,
) -> Surface<i16> {
    match pixel_sad {
        None => Surface::generate(src.width(), src.height(), |x, y| {
            quantize_one(src.get(x, y), dirq_step_width, deadzone).clamp(-8192, 8191) as i16
        }),
        Some(_) if threshold == 5 => Surface::generate(src.width(), src.height(), |x, y| {
            quantize_one(src.get(x, y), dirq_step_width, deadzone).clamp(-8192, 8191) as i16
        }),
        Some(sad) => {
            assert!(threshold > 0 && threshold < 5);
            let cutoff = sad_cutoff(transform_block_size);
            Surface::generate(src.width(), src.height(), |x, y| {
                let v = src.get(x, y);
                if sad.get(x, y) > cutoff {
                    quantize_one(v, dirq_step_width, deadzone).clamp(-8192, 8191) as i16
                } else {
                    quantize_static(v, dirq_step_width, deadzone, threshold).clamp(-8192, 8191) as i16
                }
            })
        }
    }
}

/// Two-pass quantization under the temporal step width modifier: PRED
/// tiles use pass 0 (modified), INTRA tiles pass 1 (unmodified). The mask
/// is sampled at tile granularity.
#[allow(clippy::too_many_arguments)]
pub fn quantize_swm(
    src: &Surface<i16>,
    transform_block_size: u32,
    dirq_step_width: [i32; 2],
    deadzone: [i32; 2],
    temporal_mask: &Surface<u8>,
    pixel_sad: Option<&Surface<i16>>,
    threshold: u32,
) -> Surface<i16> {
    let d = 32 / transform_block_size;
    let pass_of = |x: u32, y: u32| -> usize {
        if temporal_mask.get((x / d) * d, (y / d) * d) == TEMPORAL_PRED {
            0
        } else {
            1
        }
    };

    match pixel_sad {
        Some(sad) if threshold != 5 => {
            assert!(threshold > 0 && threshold < 5);
            let cutoff = sad_cutoff(transform_block_size);
            Surface::generate(src.width(), src.height(), |x, y| {
                let pass = pass_of(x, y);
                let v = src.get(x, y);
                if sad.get(x, y) > cutoff {
                    quantize_one(v, dirq_step_width[pass], deadzone[pass]).clamp(-8192, 8191) as i16
                } else {
                    quantize_static(v, dirq_step_width[pass], deadzone[pass], threshold).clamp(-8192, 8191) as i16
                }
            })
        }
        _ => Surface::generate(src.width(), src.height(), |x, y| {
            let pass = pass_of(x, y);
            quantize_one(src.get(x, y), dirq_step_width[pass], deadzone[pass]).clamp(-8192, 8191) as i16
        }),
    }
}

fn dequantize_one(value: i16, step_width: i32, applied_offset: i32) -> i16 {
    let value = i32::from(value);
    let out = if value > 0 {
        value * step_width + applied_offset
    } else if value < 0 {
        value * step_width - applied_offset
    } else {
        0
    };
    out.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Dequantizes one coefficient layer.
pub fn dequantize(src: &Surface<i16>, invq_step_width: i32, applied_offset: i32) -> Surface<i16> {
    Surface::generate(src.width(), src.height(), |x, y| {
        dequantize_one(src.get(x, y), invq_step_width, applied_offset)
    })
}

/// Two-pass dequantization under the temporal step width modifier; the
/// mask is sampled per symbol.
pub fn dequantize_swm(
    src: &Surface<i16>,
    invq_step_width: [i32; 2],
    applied_offset: [i32; 2],
    temporal_mask: &Surface<u8>,
) -> Surface<i16> {
    Surface::generate(src.width(), src.height(), |x, y| {
        let pass = if temporal_mask.get(x, y) == TEMPORAL_PRED { 0 } else { 1 };
        dequantize_one(src.get(x, y), invq_step_width[pass], applied_offset[pass])
    })
}

/// Per-layer quantization parameters for one pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerQuant {
    /// Forward step width.
    pub dirq: i32,
    /// Inverse step width.
    pub invq: i32,
    /// Dequantization offset before dead-zone merge.
    pub offset: i32,
    /// Dead-zone magnitude.
    pub deadzone: i32,
    /// Offset applied during dequantization.
    pub applied_offset: i32,
}

/// Derives the full parameter set for one layer and step width.
pub fn layer_quant(picture: &PictureConfiguration, step_width: i32, qm_coeff: i32) -> LayerQuant {
    let dirq = dirq_step_width(step_width, qm_coeff);
    let offset = invq_offset(picture, step_width, dirq);
    let invq = invq_step_width(picture, dirq, offset);
    let deadzone = layer_deadzone(step_width, invq);
    let applied_offset = invq_applied_offset(picture, offset, deadzone);
    LayerQuant {
        dirq,
        invq,
        offset,
        deadzone,
        applied_offset,
    }
}

/// Dead-zone used on the encode side, derived from the forward step
/// width.
pub fn encode_deadzone(step_width: i32, dirq: i32) -> i32 {
    layer_deadzone(step_width, dirq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PictureConfiguration, QuantMatrixMode};
    use crate::surface::Surface;
    use crate::temporal::{TEMPORAL_INTR, TEMPORAL_PRED};
    use crate::{MAX_STEP_WIDTH, MIN_STEP_WIDTH};

    #[test]
    fn dirq_stays_in_signalable_range() {
        for sw in [MIN_STEP_WIDTH, 16, 17, 500, 2250, 32767] {
            for qm in [0, 1, 13, 150, 255] {
                let dirq = dirq_step_width(sw, qm);
                assert!((MIN_STEP_WIDTH..=MAX_STEP_WIDTH).contains(&dirq), "sw {sw} qm {qm}");
            }
        }
    }

    #[test]
    fn dirq_grows_with_matrix_coefficient() {
        let base = dirq_step_width(1000, 0);
        let scaled = dirq_step_width(1000, 64);
        assert!(scaled > base);
    }

    #[test]
    fn dequant_modifier_floors_toward_negative_infinity() {
        let mut picture = PictureConfiguration::default();
        picture.dequant_offset_signalled = true;
        picture.dequant_offset_mode = DequantOffset::Default;
        // (-1 * 100) >> 15 is -1, not the 0 a truncating division gives.
        assert_eq!(invq_step_width(&picture, 100, -1), 99);
        assert_eq!(invq_step_width(&picture, 100, 0), 100);
    }

    #[test]
    fn deadzone_small_step_widths_are_half() {
        assert_eq!(layer_deadzone(10, 10), 5);
        assert_eq!(layer_deadzone(16, 16), 8);
    }

    #[test]
    fn deadzone_wide_step_widths_use_the_derived_curve() {
        // dz = (((1 << 16) - ((39 * sw + 126484) >> 1)) * sw) >> 16
        // Negative at wide step widths: it suppresses, not rounds.
        let dz = layer_deadzone(2250, 2250);
        assert_eq!(dz, ((65536i64 - ((39 * 2250 + 126484) >> 1)) * 2250 >> 16) as i32);
        assert!(dz < 0);
    }

    #[test]
    fn quantize_kills_the_deadzone_and_keeps_sign_symmetry() {
        let src = Surface::generate(4, 1, |x, _| [-900i16, -200, 200, 900][x as usize]);
        let q = quantize(&src, 300, -100, None, 4, 5);
        assert_eq!(q.get(0, 0), -(900 - 100) / 300);
        assert_eq!(q.get(1, 0), 0);
        assert_eq!(q.get(2, 0), 0);
        assert_eq!(q.get(3, 0), (900 - 100) / 300);
    }

    #[test]
    fn quantize_clamps_to_int14() {
        let src = Surface::generate(2, 1, |x, _| if x == 0 { i16::MAX } else { i16::MIN });
        let q = quantize(&src, 1, 0, None, 4, 5);
        assert_eq!(q.get(0, 0), 8191);
        assert_eq!(q.get(1, 0), -8192);
    }

    #[test]
    fn dequantize_round_trips_centre_values() {
        let picture = PictureConfiguration::default();
        let lq = layer_quant(&picture, 700, 13);
        let src = Surface::generate(5, 1, |x, _| [-3i16, -1, 0, 1, 3][x as usize]);
        let deq = dequantize(&src, lq.invq, lq.applied_offset);
        assert_eq!(deq.get(2, 0), 0);
        assert!(deq.get(3, 0) > 0);
        assert_eq!(deq.get(1, 0), -deq.get(3, 0));
        // Requantizing the dequantized value recovers the symbol.
        let dz = layer_deadzone(700, lq.invq);
        let q = quantize(&deq, lq.invq, dz, None, 4, 5);
        assert_eq!(q.get(0, 0), -3);
        assert_eq!(q.get(4, 0), 3);
    }

    #[test]
    fn sad_guided_promotion_never_kills_survivors() {
        // Anything non-zero in the unguided path stays non-zero when
        // guided: the reduced dead-zone only promotes.
        let src = Surface::generate(64, 1, |x, _| (i32::from(x as u8) * 37 % 1200 - 600) as i16);
        let sad = Surface::filled(50i16, 64, 1);
        for threshold in 1..5 {
            let plain = quantize(&src, 300, -90, None, 4, 5);
            let guided = quantize(&src, 300, -90, Some(&sad), 4, threshold);
            for x in 0..64 {
                if plain.get(x, 0) != 0 {
                    assert!(guided.get(x, 0) != 0, "threshold {threshold} x {x}");
                }
            }
        }
    }

    #[test]
    fn swm_passes_follow_the_tile_mask() {
        // One intra tile, one pred tile (block size 4 so tiles are 8x8
        // symbols).
        let mask = Surface::generate(16, 8, |x, _| if x < 8 { TEMPORAL_PRED } else { TEMPORAL_INTR });
        let src = Surface::filled(1000i16, 16, 8);
        let q = quantize_swm(&src, 4, [100, 400], [0, 0], &mask, None, 5);
        assert_eq!(q.get(0, 0), 10);
        assert_eq!(q.get(15, 0), 2);

        let deq = dequantize_swm(&q, [100, 400], [0, 0], &mask);
        assert_eq!(deq.get(0, 0), 1000);
        assert_eq!(deq.get(15, 0), 800);
    }

    #[test]
    fn quant_matrix_modes_resolve() {
        let mut picture = PictureConfiguration::default();
        picture.qm_coefficient_1[0] = 11;
        picture.qm_coefficient_2[0] = 22;

        picture.quant_matrix_mode = QuantMatrixMode::BothDefault;
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_2, 0, false, -1), 13);
        assert_eq!(resolve_quant_matrix(&picture, 16, true, crate::LOQ_LEVEL_2, 4, false, -1), 52);
        assert_eq!(resolve_quant_matrix(&picture, 4, false, crate::LOQ_LEVEL_1, 1, false, -1), 3);

        picture.quant_matrix_mode = QuantMatrixMode::BothPrevious;
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_2, 0, true, 99), 13);
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_2, 0, false, 99), 99);
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_2, 0, false, -1), 13);

        picture.quant_matrix_mode = QuantMatrixMode::DifferentAndCustom;
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_2, 0, false, -1), 22);
        assert_eq!(resolve_quant_matrix(&picture, 16, false, crate::LOQ_LEVEL_1, 0, false, -1), 11);
    }
}
