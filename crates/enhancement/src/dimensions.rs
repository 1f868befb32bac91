use crate::config::{ScalingMode, SignaledConfiguration, TileDimensions};
use crate::image::Colourspace;
use crate::{LOQ_LEVEL_1, LOQ_LEVEL_2, MAX_NUM_LOQS, MAX_NUM_PLANES};

fn round_up(v: u32, m: u32) -> u32 {
    (v + m - 1) / m * m
}

fn scale_x(mode: ScalingMode) -> u32 {
    match mode {
        ScalingMode::None => 1,
        ScalingMode::OneD | ScalingMode::TwoD => 2,
    }
}

fn scale_y(mode: ScalingMode) -> u32 {
    match mode {
        ScalingMode::None | ScalingMode::OneD => 1,
        ScalingMode::TwoD => 2,
    }
}

/// Per-plane, per-LoQ geometry derived from the signalled configuration.
///
/// The conformant size is the source size rounded up so that every level
/// divides evenly into transform blocks; the surplus is carried as the
/// conformance window.
#[derive(Debug, Clone, Default)]
pub struct Dimensions {
    plane_width: [[u32; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    plane_height: [[u32; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    base_width: [u32; MAX_NUM_PLANES],
    base_height: [u32; MAX_NUM_PLANES],
    tile_width: [[u32; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    tile_height: [[u32; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    conformant_width: u32,
    conformant_height: u32,
    colourspace: Colourspace,
}

impl Dimensions {
    /// Derives all level geometry for `source_width` x `source_height`.
    pub fn new(configuration: &SignaledConfiguration, source_width: u32, source_height: u32) -> Self {
        let global = &configuration.global;
        let block = global.transform_block_size;
        let colourspace = global.colourspace;

        let sx2 = scale_x(global.scaling_mode[LOQ_LEVEL_2]);
        let sy2 = scale_y(global.scaling_mode[LOQ_LEVEL_2]);
        let sx1 = scale_x(global.scaling_mode[LOQ_LEVEL_1]);
        let sy1 = scale_y(global.scaling_mode[LOQ_LEVEL_1]);

        // Chroma planes may be half size, so alignment includes the
        // subsampling factor.
        let cx = 1 << colourspace.shift_x(1.min(colourspace.num_planes() - 1));
        let cy = 1 << colourspace.shift_y(1.min(colourspace.num_planes() - 1));

        let conformant_width = round_up(source_width, block * sx2 * sx1 * cx);
        let conformant_height = round_up(source_height, block * sy2 * sy1 * cy);

        let mut dims = Dimensions {
            conformant_width,
            conformant_height,
            colourspace,
            ..Default::default()
        };

        for plane in 0..colourspace.num_planes().min(MAX_NUM_PLANES) {
            let full_w = conformant_width >> colourspace.shift_x(plane);
            let full_h = conformant_height >> colourspace.shift_y(plane);

            dims.plane_width[plane][LOQ_LEVEL_2] = full_w;
            dims.plane_height[plane][LOQ_LEVEL_2] = full_h;
            dims.plane_width[plane][LOQ_LEVEL_1] = full_w / sx2;
            dims.plane_height[plane][LOQ_LEVEL_1] = full_h / sy2;
            dims.base_width[plane] = full_w / sx2 / sx1;
            dims.base_height[plane] = full_h / sy2 / sy1;

            if global.tile_dimensions_type != TileDimensions::None {
                for loq in 0..MAX_NUM_LOQS {
                    let (tsx, tsy) = if loq == LOQ_LEVEL_2 { (1, 1) } else { (sx2, sy2) };
                    let tw = (global.tile_width >> colourspace.shift_x(plane)) / tsx;
                    let th = (global.tile_height >> colourspace.shift_y(plane)) / tsy;
                    // Tile dimensions are in transform units.
                    dims.tile_width[plane][loq] = (tw / block).max(1);
                    dims.tile_height[plane][loq] = (th / block).max(1);
                }
            }
        }

        dims
    }

    /// Width of `plane` at `loq` in pels.
    pub fn plane_width(&self, plane: usize, loq: usize) -> u32 {
        self.plane_width[plane][loq]
    }

    /// Height of `plane` at `loq` in pels.
    pub fn plane_height(&self, plane: usize, loq: usize) -> u32 {
        self.plane_height[plane][loq]
    }

    /// Width of the base picture plane in pels.
    pub fn base_width(&self, plane: usize) -> u32 {
        self.base_width[plane]
    }

    /// Height of the base picture plane in pels.
    pub fn base_height(&self, plane: usize) -> u32 {
        self.base_height[plane]
    }

    /// Tile width for `plane` at `loq`, in transform units.
    pub fn tile_width(&self, plane: usize, loq: usize) -> u32 {
        self.tile_width[plane][loq]
    }

    /// Tile height for `plane` at `loq`, in transform units.
    pub fn tile_height(&self, plane: usize, loq: usize) -> u32 {
        self.tile_height[plane][loq]
    }

    /// Aligned full resolution width.
    pub fn conformant_width(&self) -> u32 {
        self.conformant_width
    }

    /// Aligned full resolution height.
    pub fn conformant_height(&self) -> u32 {
        self.conformant_height
    }

    /// Horizontal conformance crop unit for `plane`.
    pub fn crop_unit_width(&self, plane: usize) -> u32 {
        if plane == 0 {
            1 << self.colourspace.shift_x(1)
        } else {
            1
        }
    }

    /// Vertical conformance crop unit for `plane`.
    pub fn crop_unit_height(&self, plane: usize) -> u32 {
        if plane == 0 {
            1 << self.colourspace.shift_y(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Dimensions;
    use crate::config::{ScalingMode, SignaledConfiguration};
    use crate::image::Colourspace;
    use crate::{LOQ_LEVEL_1, LOQ_LEVEL_2};

    fn config_1080p() -> SignaledConfiguration {
        let mut c = SignaledConfiguration::default();
        c.global.colourspace = Colourspace::Yuv420;
        c.global.scaling_mode[LOQ_LEVEL_2] = ScalingMode::TwoD;
        c.global.scaling_mode[LOQ_LEVEL_1] = ScalingMode::None;
        c
    }

    #[test]
    fn aligned_1080p_two_d() {
        let d = Dimensions::new(&config_1080p(), 1920, 1080, );
        assert_eq!(d.conformant_width(), 1920);
        assert_eq!(d.conformant_height(), 1088);
        assert_eq!(d.plane_width(0, LOQ_LEVEL_2), 1920);
        assert_eq!(d.plane_width(0, LOQ_LEVEL_1), 960);
        assert_eq!(d.base_width(0), 960);
        assert_eq!(d.plane_width(1, LOQ_LEVEL_2), 960);
        assert_eq!(d.plane_height(1, LOQ_LEVEL_1), 272);
    }

    #[test]
    fn one_d_scales_horizontally_only() {
        let mut c = config_1080p();
        c.global.scaling_mode[LOQ_LEVEL_2] = ScalingMode::OneD;
        let d = Dimensions::new(&c, 960, 540, );
        assert_eq!(d.plane_width(0, LOQ_LEVEL_1), 480);
        assert_eq!(d.plane_height(0, LOQ_LEVEL_1), 544);
    }

    #[test]
    fn tile_geometry_in_transform_units() {
        let mut c = config_1080p();
        c.global.tile_width = 512;
        c.global.tile_height = 256;
        c.global.resolve_tile_dimensions();
        let d = Dimensions::new(&c, 1920, 1080, );
        assert_eq!(d.tile_width(0, LOQ_LEVEL_2), 128);
        assert_eq!(d.tile_height(0, LOQ_LEVEL_2), 64);
        // LoQ-1 tiles cover the same picture area at half scale.
        assert_eq!(d.tile_width(0, LOQ_LEVEL_1), 64);
        assert_eq!(d.tile_height(0, LOQ_LEVEL_1), 32);
        // Chroma tiles are half width under 4:2:0.
        assert_eq!(d.tile_width(1, LOQ_LEVEL_2), 64);
    }

    #[test]
    fn crop_units_follow_chroma() {
        let d = Dimensions::new(&config_1080p(), 1920, 1080, );
        assert_eq!(d.crop_unit_width(0), 2);
        assert_eq!(d.crop_unit_height(0), 2);
        assert_eq!(d.crop_unit_width(1), 1);
    }
}
