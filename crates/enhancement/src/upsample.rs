//! Upsampling and predicted-residual adjustment.
//!
//! All kernels are 4-tap pairs in 1.14 fixed point summing to 16384, one
//! phase per output pel of the doubled grid, mirrored about the source
//! pel. Edges replicate. The adaptive kernel is built from four signalled
//! magnitudes applied as `{-c0, c1, c2, -c3}`.

use crate::config::Upsample;
use crate::surface::Surface;

const KERNEL_PRECISION: i32 = 14;
const KERNEL_HALF: i32 = 1 << (KERNEL_PRECISION - 1);

const KERNEL_NEAREST: [i32; 4] = [0, 16384, 0, 0];
const KERNEL_LINEAR: [i32; 4] = [0, 12288, 4096, 0];
const KERNEL_CUBIC: [i32; 4] = [-1382, 14285, 3942, -461];
const KERNEL_MODIFIED_CUBIC: [i32; 4] = [-2360, 15855, 4165, -1276];

/// Resolves the signalled kernel into its tap values.
pub fn kernel_taps(upsample: Upsample, coefficients: &[u32; 4]) -> [i32; 4] {
    match upsample {
        Upsample::Nearest => KERNEL_NEAREST,
        Upsample::Linear => KERNEL_LINEAR,
        Upsample::Cubic => KERNEL_CUBIC,
        Upsample::ModifiedCubic => KERNEL_MODIFIED_CUBIC,
        Upsample::AdaptiveCubic => [
            -(coefficients[0] as i32),
            coefficients[1] as i32,
            coefficients[2] as i32,
            -(coefficients[3] as i32),
        ],
    }
}

/// Doubles one dimension: for source pel `i`, the output pair is
/// `out[2i]` weighted toward `i-1` and `out[2i+1]` toward `i+1`.
fn upsample_axis(src: &Surface<i16>, taps: [i32; 4], horizontal: bool) -> Surface<i16> {
    let (width, height) = if horizontal {
        (src.width() * 2, src.height())
    } else {
        (src.width(), src.height() * 2)
    };

    Surface::generate(width, height, |x, y| {
        let (i, phase_odd) = if horizontal {
            (i64::from(x / 2), x & 1 == 1)
        } else {
            (i64::from(y / 2), y & 1 == 1)
        };
        let fetch = |k: i64| -> i32 {
            if horizontal {
                i32::from(src.get_clamped(k, i64::from(y)))
            } else {
                i32::from(src.get_clamped(i64::from(x), k))
            }
        };

        let acc = if phase_odd {
            taps[0] * fetch(i - 1) + taps[1] * fetch(i) + taps[2] * fetch(i + 1) + taps[3] * fetch(i + 2)
        } else {
            taps[0] * fetch(i + 1) + taps[1] * fetch(i) + taps[2] * fetch(i - 1) + taps[3] * fetch(i - 2)
        };
        ((acc + KERNEL_HALF) >> KERNEL_PRECISION).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    })
}

/// 2-D upsampling: horizontal then vertical with the same kernel.
pub fn upsample_2d(src: &Surface<i16>, upsample: Upsample, coefficients: &[u32; 4]) -> Surface<i16> {
    let taps = kernel_taps(upsample, coefficients);
    let wide = upsample_axis(src, taps, true);
    upsample_axis(&wide, taps, false)
}

/// 1-D upsampling: horizontal only.
pub fn upsample_1d(src: &Surface<i16>, upsample: Upsample, coefficients: &[u32; 4]) -> Surface<i16> {
    let taps = kernel_taps(upsample, coefficients);
    upsample_axis(src, taps, true)
}

/// Rounded average of each 2x2 group of the upsampled plane, for the 2-D
/// predicted-residual adjustment.
pub fn predicted_average_2d(upsampled: &Surface<i16>) -> Surface<i16> {
    Surface::generate(upsampled.width() / 2, upsampled.height() / 2, |x, y| {
        let s = i32::from(upsampled.get(x * 2, y * 2))
            + i32::from(upsampled.get(x * 2 + 1, y * 2))
            + i32::from(upsampled.get(x * 2, y * 2 + 1))
            + i32::from(upsampled.get(x * 2 + 1, y * 2 + 1));
        ((s + 2) >> 2) as i16
    })
}

/// Rounded average of each horizontal pel pair, for the 1-D adjustment.
pub fn predicted_average_1d(upsampled: &Surface<i16>) -> Surface<i16> {
    Surface::generate(upsampled.width() / 2, upsampled.height(), |x, y| {
        let s = i32::from(upsampled.get(x * 2, y)) + i32::from(upsampled.get(x * 2 + 1, y));
        ((s + 1) >> 1) as i16
    })
}

/// Biases each 2x2 upsampled group so its rounded average equals the
/// source base pel, cancelling per-block drift from kernel rounding.
pub fn predicted_residual_adjust_2d(
    base: &Surface<i16>,
    upsampled: &Surface<i16>,
    averages: &Surface<i16>,
) -> Surface<i16> {
    Surface::generate(upsampled.width(), upsampled.height(), |x, y| {
        let bx = x / 2;
        let by = y / 2;
        let delta = i32::from(base.get(bx, by)) - i32::from(averages.get(bx, by));
        (i32::from(upsampled.get(x, y)) + delta).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    })
}

/// 1-D form of the adjustment over horizontal pairs.
pub fn predicted_residual_adjust_1d(
    base: &Surface<i16>,
    upsampled: &Surface<i16>,
    averages: &Surface<i16>,
) -> Surface<i16> {
    Surface::generate(upsampled.width(), upsampled.height(), |x, y| {
        let bx = x / 2;
        let delta = i32::from(base.get(bx, y)) - i32::from(averages.get(bx, y));
        (i32::from(upsampled.get(x, y)) + delta).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
    })
}
