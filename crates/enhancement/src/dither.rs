//! Output dithering.
//!
//! Adds bounded uniform noise to the reconstructed luma plane in the
//! internal representation. The fixed variant seeds its generator with a
//! constant so reconstructions are identical across runs.

use crate::config::DitheringType;
use crate::surface::Surface;

const FIXED_SEED: u32 = 0xbf329e21;

/// Uniform dither source over the reconstructed output.
pub struct Dither {
    strength: i32,
    state: u32,
    enabled: bool,
}

impl Dither {
    /// Creates a dither source; `strength` is the half-range in output
    /// sample steps, scaled here to the internal representation.
    pub fn new(dithering_type: DitheringType, strength: u32, bit_depth: u32, seed: u32) -> Self {
        let state = match dithering_type {
            DitheringType::UniformFixed => FIXED_SEED,
            _ => {
                if seed == 0 {
                    1
                } else {
                    seed
                }
            }
        };
        Self {
            strength: (strength << (15 - bit_depth)) as i32,
            state,
            enabled: dithering_type != DitheringType::None && strength > 0,
        }
    }

    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Applies noise in `[-strength, strength]` to every pel.
    pub fn process(&mut self, plane: &Surface<i16>) -> Surface<i16> {
        if !self.enabled {
            return plane.clone();
        }

        let span = (2 * self.strength + 1) as u32;
        Surface::generate(plane.width(), plane.height(), |x, y| {
            let noise = (self.next() % span) as i32 - self.strength;
            (i32::from(plane.get(x, y)) + noise).clamp(0, (1 << 15) - 1) as i16
        })
    }
}
