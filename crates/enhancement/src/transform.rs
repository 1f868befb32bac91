//! The DD (2x2) and DDS (4x4) integer transforms and their
//! horizontal-only variants.
//!
//! The forward transform of a block is the inner product against each
//! basis row divided by the block pel count; the inverse is the inner
//! product of the layer values against the transposed basis, with the
//! `+/-2` rows of the 1-D bases halved (their exact algebraic inverse).

use crate::surface::{Surface, SurfaceBuilder};

/// Hadamard {A, H, V, D} rows.
const DD_BASIS: [[i32; 4]; 4] = [
    [1, 1, 1, 1],
    [1, -1, 1, -1],
    [1, 1, -1, -1],
    [1, -1, -1, 1],
];

/// Horizontal-only 2x2 rows.
const DD_1D_BASIS: [[i32; 4]; 4] = [
    [2, 2, 0, 0],
    [1, -1, 1, -1],
    [1, -1, -1, 1],
    [0, 0, 2, 2],
];

#[rustfmt::skip]
const DDS_BASIS: [[i32; 16]; 16] = [
    [ 1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1], // 0,0
    [ 1,  1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1], // 1,0
    [ 1,  1,  1,  1,  1,  1,  1,  1, -1, -1, -1, -1, -1, -1, -1, -1], // 2,0
    [ 1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1,  1, -1, -1,  1,  1], // 3,0

    [ 1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1], // 0,1
    [ 1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1,  1], // 1,1
    [ 1, -1,  1, -1,  1, -1,  1, -1, -1,  1, -1,  1, -1,  1, -1,  1], // 2,1
    [ 1, -1, -1,  1,  1, -1, -1,  1, -1,  1,  1, -1, -1,  1,  1, -1], // 3,1

    [ 1,  1,  1,  1, -1, -1, -1, -1,  1,  1,  1,  1, -1, -1, -1, -1], // 0,2
    [ 1,  1, -1, -1, -1, -1,  1,  1,  1,  1, -1, -1, -1, -1,  1,  1], // 1,2
    [ 1,  1,  1,  1, -1, -1, -1, -1, -1, -1, -1, -1,  1,  1,  1,  1], // 2,2
    [ 1,  1, -1, -1, -1, -1,  1,  1, -1, -1,  1,  1,  1,  1, -1, -1], // 3,2

    [ 1, -1,  1, -1, -1,  1, -1,  1,  1, -1,  1, -1, -1,  1, -1,  1], // 0,3
    [ 1, -1, -1,  1, -1,  1,  1, -1,  1, -1, -1,  1, -1,  1,  1, -1], // 1,3
    [ 1, -1,  1, -1, -1,  1, -1,  1, -1,  1, -1,  1,  1, -1,  1, -1], // 2,3
    [ 1, -1, -1,  1, -1,  1,  1, -1, -1,  1,  1, -1,  1, -1, -1,  1], // 3,3
];

#[rustfmt::skip]
const DDS_1D_BASIS: [[i32; 16]; 16] = [
    [ 2,  2,  2,  2,  0,  0,  0,  0,  2,  2,  2,  2,  0,  0,  0,  0], // 0,0
    [ 2,  2, -2, -2,  0,  0,  0,  0,  2,  2, -2, -2,  0,  0,  0,  0], // 1,0
    [ 2,  2,  2,  2,  0,  0,  0,  0, -2, -2, -2, -2,  0,  0,  0,  0], // 2,0
    [ 2,  2, -2, -2,  0,  0,  0,  0, -2, -2,  2,  2,  0,  0,  0,  0], // 3,0

    [ 1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1,  1, -1], // 0,1
    [ 1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1,  1,  1, -1, -1,  1], // 1,1
    [ 1, -1,  1, -1,  1, -1,  1, -1, -1,  1, -1,  1, -1,  1, -1,  1], // 2,1
    [ 1, -1, -1,  1,  1, -1, -1,  1, -1,  1,  1, -1, -1,  1,  1, -1], // 3,1

    [ 0,  0,  0,  0,  2,  2,  2,  2,  0,  0,  0,  0,  2,  2,  2,  2], // 0,2
    [ 0,  0,  0,  0,  2,  2, -2, -2,  0,  0,  0,  0,  2,  2, -2, -2], // 1,2
    [ 0,  0,  0,  0,  2,  2,  2,  2,  0,  0,  0,  0, -2, -2, -2, -2], // 2,2
    [ 0,  0,  0,  0,  2,  2, -2, -2,  0,  0,  0,  0, -2, -2,  2,  2], // 3,2

    [ 1, -1,  1, -1, -1,  1, -1,  1,  1, -1,  1, -1, -1,  1, -1,  1], // 0,3
    [ 1, -1, -1,  1, -1,  1,  1, -1,  1, -1, -1,  1, -1,  1,  1, -1], // 1,3
    [ 1, -1,  1, -1, -1,  1, -1,  1, -1,  1, -1,  1,  1, -1,  1, -1], // 2,3
    [ 1, -1, -1,  1, -1,  1,  1, -1, -1,  1,  1, -1,  1, -1, -1,  1], // 3,3
];

/// Which transform kernel a call applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// 2x2, horizontal and vertical.
    Dd,
    /// 2x2, horizontal only.
    Dd1d,
    /// 4x4, horizontal and vertical.
    Dds,
    /// 4x4, horizontal only.
    Dds1d,
}

impl TransformKind {
    /// Selects the kernel for a block size and scaling orientation.
    pub fn select(transform_block_size: u32, horizontal_only: bool) -> Self {
        match (transform_block_size, horizontal_only) {
            (2, false) => TransformKind::Dd,
            (2, true) => TransformKind::Dd1d,
            (4, false) => TransformKind::Dds,
            (4, true) => TransformKind::Dds1d,
            _ => panic!("transform block size must be 2 or 4"),
        }
    }

    /// Block edge in pels.
    pub fn block_size(self) -> u32 {
        match self {
            TransformKind::Dd | TransformKind::Dd1d => 2,
            TransformKind::Dds | TransformKind::Dds1d => 4,
        }
    }

    /// Number of output layers.
    pub fn num_layers(self) -> usize {
        (self.block_size() * self.block_size()) as usize
    }

    fn basis(self, layer: usize, index: usize) -> i32 {
        match self {
            TransformKind::Dd => DD_BASIS[layer][index],
            TransformKind::Dd1d => DD_1D_BASIS[layer][index],
            TransformKind::Dds => DDS_BASIS[layer][index],
            TransformKind::Dds1d => DDS_1D_BASIS[layer][index],
        }
    }

    /// Inverse basis: the transpose, with the `+/-2` rows halved.
    fn inverse_basis(self, layer: usize, index: usize) -> i32 {
        let v = self.basis(layer, index);
        match self {
            TransformKind::Dd | TransformKind::Dds => v,
            TransformKind::Dd1d | TransformKind::Dds1d => v / 2 + v % 2,
        }
    }
}

/// Forward transforms `residuals` into `num_layers` coefficient surfaces
/// of size `(W/bs) x (H/bs)`. Layers excluded by `encode_layer` come back
/// as zero surfaces.
pub fn forward(
    kind: TransformKind,
    residuals: &Surface<i16>,
    encode_layer: impl Fn(usize) -> bool,
) -> Vec<Surface<i16>> {
    let bs = kind.block_size();
    assert!(residuals.width() % bs == 0 && residuals.height() % bs == 0);

    let width = residuals.width() / bs;
    let height = residuals.height() / bs;
    let divisor = (bs * bs) as i32;

    (0..kind.num_layers())
        .map(|layer| {
            if !encode_layer(layer) {
                return Surface::blank(width, height);
            }
            Surface::generate(width, height, |x, y| {
                let mut acc = 0i32;
                for by in 0..bs {
                    for bx in 0..bs {
                        let basis = kind.basis(layer, (by * bs + bx) as usize);
                        acc += i32::from(residuals.get(x * bs + bx, y * bs + by)) * basis;
                    }
                }
                (acc / divisor) as i16
            })
        })
        .collect()
}

/// Inverse transforms coefficient layers back to a `width` x `height`
/// residual surface.
pub fn inverse(kind: TransformKind, width: u32, height: u32, layers: &[Surface<i16>]) -> Surface<i16> {
    let bs = kind.block_size();
    assert!(width % bs == 0 && height % bs == 0);
    assert_eq!(layers.len(), kind.num_layers());

    let mut b = SurfaceBuilder::new(width, height);
    for by in 0..height / bs {
        for bx in 0..width / bs {
            for py in 0..bs {
                for px in 0..bs {
                    let index = (py * bs + px) as usize;
                    let mut acc = 0i32;
                    for (layer, coeffs) in layers.iter().enumerate() {
                        acc += i32::from(coeffs.get(bx, by)) * kind.inverse_basis(layer, index);
                    }
                    b.write(bx * bs + px, by * bs + py, acc as i16);
                }
            }
        }
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::{forward, inverse, TransformKind};
    use crate::surface::Surface;

    const KINDS: [TransformKind; 4] = [
        TransformKind::Dd,
        TransformKind::Dd1d,
        TransformKind::Dds,
        TransformKind::Dds1d,
    ];

    fn test_pattern(width: u32, height: u32) -> Surface<i16> {
        Surface::generate(width, height, |x, y| ((x * 13 + y * 29) % 257) as i16 - 128)
    }

    #[test]
    fn layer_geometry() {
        let src = test_pattern(32, 16);
        for kind in KINDS {
            let layers = forward(kind, &src, |_| true);
            assert_eq!(layers.len(), kind.num_layers());
            for layer in &layers {
                assert_eq!(layer.width(), 32 / kind.block_size());
                assert_eq!(layer.height(), 16 / kind.block_size());
            }
        }
    }

    #[test]
    fn inverse_of_forward_is_near_identity() {
        // The forward division truncates, so reconstruction can be off by
        // at most one transform step (the block pel count), never more.
        let src = test_pattern(32, 32);
        for kind in KINDS {
            let bound = (kind.block_size() * kind.block_size()) as i32;
            let layers = forward(kind, &src, |_| true);
            let back = inverse(kind, 32, 32, &layers);
            for y in 0..32 {
                for x in 0..32 {
                    let err = (i32::from(back.get(x, y)) - i32::from(src.get(x, y))).abs();
                    assert!(err < bound, "{kind:?} at ({x},{y}): {err}");
                }
            }
        }
    }

    #[test]
    fn exact_identity_on_block_multiples() {
        // Inputs whose block sums divide exactly reconstruct exactly.
        for kind in KINDS {
            let divisor = (kind.block_size() * kind.block_size()) as i16;
            let src = Surface::generate(16, 16, |x, y| (((x / 4 + y / 4) % 5) as i16 - 2) * divisor);
            let layers = forward(kind, &src, |_| true);
            let back = inverse(kind, 16, 16, &layers);
            assert_eq!(back.checksum(), src.checksum(), "{kind:?}");
        }
    }

    #[test]
    fn dc_layer_is_block_mean() {
        let src = Surface::filled(64i16, 8, 8);
        let layers = forward(TransformKind::Dds, &src, |_| true);
        assert_eq!(layers[0].get(0, 0), 64);
        for layer in &layers[1..] {
            assert!(layer.is_blank());
        }
    }

    #[test]
    fn skipped_layers_are_zero() {
        let src = test_pattern(8, 8);
        let layers = forward(TransformKind::Dd, &src, |l| l == 0);
        assert!(!layers[0].is_blank());
        for layer in &layers[1..] {
            assert!(layer.is_blank());
        }
    }

    #[test]
    fn one_d_kernels_mix_columns_within_row_pairs_only() {
        // A horizontal-only transform of a vertically constant pattern
        // still reconstructs exactly: no vertical mixing error.
        let src = Surface::generate(16, 8, |x, _| (x as i16 % 7) * 16);
        let layers = forward(TransformKind::Dds1d, &src, |_| true);
        let back = inverse(TransformKind::Dds1d, 16, 8, &layers);
        assert_eq!(back.checksum(), src.checksum());
    }
}
