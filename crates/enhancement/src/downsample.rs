//! Downsampling kernels (encoder side only, never signalled).
//!
//! Area is a box average; the Lanczos kernels are windowed-sinc taps at
//! half-pel phases, normalised to 16384 per output pel. Edges replicate.

use crate::config::Downsample;
use crate::surface::Surface;

// Per-side taps at offsets 0.5, 1.5, 2.5 from the output centre,
// normalised so each 6-tap kernel sums to 16384.
const LANCZOS2_TAPS: [i32; 3] = [10984, -3217, 425];
const LANCZOS3_TAPS: [i32; 3] = [10017, -2226, 401];

fn lanczos_axis(src: &Surface<i16>, taps: [i32; 3], horizontal: bool) -> Surface<i16> {
    let (width, height) = if horizontal {
        (src.width() / 2, src.height())
    } else {
        (src.width(), src.height() / 2)
    };

    Surface::generate(width, height, |x, y| {
        let c = i64::from(if horizontal { x } else { y }) * 2;
        let fetch = |k: i64| -> i64 {
            if horizontal {
                i64::from(src.get_clamped(k, i64::from(y)))
            } else {
                i64::from(src.get_clamped(i64::from(x), k))
            }
        };

        let mut acc = 0i64;
        for (tap, offset) in taps.iter().zip(0i64..) {
            let tap = i64::from(*tap);
            acc += tap * (fetch(c - offset) + fetch(c + 1 + offset));
        }
        ((acc + 8192) >> 14).clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
    })
}

fn area_axis(src: &Surface<i16>, horizontal: bool) -> Surface<i16> {
    let (width, height) = if horizontal {
        (src.width() / 2, src.height())
    } else {
        (src.width(), src.height() / 2)
    };

    Surface::generate(width, height, |x, y| {
        let (a, b) = if horizontal {
            (src.get(x * 2, y), src.get(x * 2 + 1, y))
        } else {
            (src.get(x, y * 2), src.get(x, y * 2 + 1))
        };
        ((i32::from(a) + i32::from(b) + 1) >> 1) as i16
    })
}

fn downsample_axis(src: &Surface<i16>, kernel: Downsample, horizontal: bool) -> Surface<i16> {
    match kernel {
        Downsample::Area => area_axis(src, horizontal),
        Downsample::Lanczos => lanczos_axis(src, LANCZOS2_TAPS, horizontal),
        Downsample::Lanczos3 => lanczos_axis(src, LANCZOS3_TAPS, horizontal),
    }
}

/// Halves both dimensions.
pub fn downsample_2d(src: &Surface<i16>, kernel: Downsample) -> Surface<i16> {
    let narrow = downsample_axis(src, kernel, true);
    downsample_axis(&narrow, kernel, false)
}

/// Halves the width only.
pub fn downsample_1d(src: &Surface<i16>, kernel: Downsample) -> Surface<i16> {
    downsample_axis(src, kernel, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Downsample;
    use crate::surface::Surface;

    #[test]
    fn lanczos_taps_are_normalised() {
        for taps in [LANCZOS2_TAPS, LANCZOS3_TAPS] {
            assert_eq!(taps.iter().sum::<i32>() * 2, 16384);
        }
    }

    #[test]
    fn area_halves_both_dimensions() {
        let src = Surface::generate(8, 4, |x, y| (y * 8 + x) as i16 * 10);
        let down = downsample_2d(&src, Downsample::Area);
        assert_eq!(down.width(), 4);
        assert_eq!(down.height(), 2);
        // Top-left block {0, 10, 80, 90}: rounds to 45.
        assert_eq!(down.get(0, 0), 45);
    }

    #[test]
    fn constant_planes_survive_every_kernel() {
        let src = Surface::filled(640i16, 16, 16);
        for kernel in [Downsample::Area, Downsample::Lanczos, Downsample::Lanczos3] {
            let down = downsample_2d(&src, kernel);
            for y in 0..8 {
                for x in 0..8 {
                    assert_eq!(down.get(x, y), 640, "{kernel:?}");
                }
            }
        }
    }

    #[test]
    fn one_d_downsample_keeps_height() {
        let src = Surface::generate(8, 4, |x, _| (x as i16) * 4);
        let down = downsample_1d(&src, Downsample::Area);
        assert_eq!(down.width(), 4);
        assert_eq!(down.height(), 4);
        assert_eq!(down.get(0, 0), 2);
    }

    #[test]
    fn downsample_then_upsample_is_close_on_smooth_content() {
        let src = Surface::generate(16, 16, |x, y| ((x + y) * 8) as i16);
        let down = downsample_2d(&src, Downsample::Lanczos);
        let up = crate::upsample::upsample_2d(&down, crate::config::Upsample::Linear, &[0; 4]);
        for y in 2..14 {
            for x in 2..14 {
                let err = (i32::from(up.get(x, y)) - i32::from(src.get(x, y))).abs();
                assert!(err <= 16, "({x},{y}): {err}");
            }
        }
    }
}
