//! PSNR and MD5 reporters.
//!
//! PSNR is measured on the signed 15-bit internal representation, matching
//! the reconstruction the codec works in; the sequence report weights the
//! planes 6Y + U + V over 8. The MD5 digest covers every plane row in
//! 16-bit little-endian samples.

use lcevc_enhancement::convert;
use lcevc_enhancement::{Image, Plane};
use md5::{Digest, Md5};

const PEAK: f64 = 32767.0;

/// Accumulated PSNR over a sequence.
#[derive(Default)]
pub struct PsnrAccumulator {
    sse: [f64; 3],
    samples: [u64; 3],
    frames: u64,
    num_planes: usize,
}

impl PsnrAccumulator {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates one frame pair; both images must share a format.
    pub fn add(&mut self, reference: &Image, reconstruction: &Image) {
        assert_eq!(reference.description(), reconstruction.description());
        self.num_planes = reference.description().num_planes();
        self.frames += 1;

        for plane in 0..self.num_planes {
            let depth = reference.description().bit_depth;
            let a = convert::to_internal(reference.plane(plane), depth);
            let b = convert::to_internal(reconstruction.plane(plane), depth);
            for y in 0..a.height() {
                for x in 0..a.width() {
                    let d = f64::from(a.get(x, y)) - f64::from(b.get(x, y));
                    self.sse[plane] += d * d;
                }
            }
            self.samples[plane] += u64::from(a.width()) * u64::from(a.height());
        }
    }

    /// Per-plane PSNR in dB.
    pub fn plane_psnr(&self, plane: usize) -> f64 {
        if self.samples[plane] == 0 {
            return f64::INFINITY;
        }
        let mse = self.sse[plane] / self.samples[plane] as f64;
        if mse == 0.0 {
            f64::INFINITY
        } else {
            10.0 * ((PEAK * PEAK) / mse).log10()
        }
    }

    /// 6Y + U + V over 8 combined PSNR; luma PSNR for monochrome.
    pub fn weighted_psnr(&self) -> f64 {
        if self.num_planes > 1 {
            (6.0 * self.plane_psnr(0) + self.plane_psnr(1) + self.plane_psnr(2)) / 8.0
        } else {
            self.plane_psnr(0)
        }
    }

    /// Logs the sequence report.
    pub fn report(&self) {
        if self.num_planes > 1 {
            tracing::info!(
                yuv = format!("{:.4}", self.weighted_psnr()),
                y = format!("{:.4}", self.plane_psnr(0)),
                u = format!("{:.4}", self.plane_psnr(1)),
                v = format!("{:.4}", self.plane_psnr(2)),
                frames = self.frames,
                "PSNR"
            );
        } else {
            tracing::info!(y = format!("{:.4}", self.plane_psnr(0)), frames = self.frames, "PSNR");
        }
    }
}

/// Running MD5 over every reconstructed sample.
#[derive(Default)]
pub struct Md5Accumulator {
    hasher: Md5,
}

impl Md5Accumulator {
    /// A fresh digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes one frame, planes in order, rows top to bottom, 16-bit
    /// little-endian samples.
    pub fn add(&mut self, image: &Image) {
        for plane in image.planes() {
            match plane {
                Plane::U8(s) => {
                    for y in 0..s.height() {
                        for &v in s.row(y) {
                            self.hasher.update(u16::from(v).to_le_bytes());
                        }
                    }
                }
                Plane::U16(s) => {
                    for y in 0..s.height() {
                        for &v in s.row(y) {
                            self.hasher.update(v.to_le_bytes());
                        }
                    }
                }
            }
        }
    }

    /// The digest as a lowercase hex string.
    pub fn finish(self) -> String {
        let digest = self.hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Md5Accumulator, PsnrAccumulator};
    use lcevc_enhancement::surface::Surface;
    use lcevc_enhancement::{Colourspace, Image, ImageDescription, Plane};

    fn grey_image(value: u8) -> Image {
        Image::new(
            vec![Plane::U8(Surface::filled(value, 16, 16))],
            ImageDescription::new(Colourspace::Y, 16, 16, 8),
            0,
        )
    }

    #[test]
    fn identical_frames_have_infinite_psnr() {
        let mut acc = PsnrAccumulator::new();
        acc.add(&grey_image(128), &grey_image(128));
        assert!(acc.plane_psnr(0).is_infinite());
    }

    #[test]
    fn psnr_drops_with_error() {
        let mut small = PsnrAccumulator::new();
        small.add(&grey_image(128), &grey_image(129));
        let mut large = PsnrAccumulator::new();
        large.add(&grey_image(128), &grey_image(160));
        assert!(small.plane_psnr(0) > large.plane_psnr(0));
        assert!(large.plane_psnr(0) > 0.0);
    }

    #[test]
    fn md5_is_content_sensitive_and_stable() {
        let mut a = Md5Accumulator::new();
        a.add(&grey_image(1));
        let mut b = Md5Accumulator::new();
        b.add(&grey_image(1));
        let mut c = Md5Accumulator::new();
        c.add(&grey_image(2));

        let (a, b, c) = (a.finish(), b.finish(), c.finish());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
