use crate::{LOQ_LEVEL_1, LOQ_LEVEL_2, MAX_NUM_LAYERS, MAX_STEP_WIDTH};

/// Upsampling kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Upsample {
    /// Pel replication.
    Nearest,
    /// Two tap linear kernel.
    Linear,
    /// Fixed four tap cubic kernel.
    Cubic,
    /// Fixed four tap kernel tuned for enhancement content.
    #[default]
    ModifiedCubic,
    /// Four signalled kernel magnitudes.
    AdaptiveCubic,
}

/// Downsampling kernel selection (encoder side only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Downsample {
    /// Box average.
    #[default]
    Area,
    /// Six tap Lanczos-2 kernel.
    Lanczos,
    /// Six tap Lanczos-3 kernel.
    Lanczos3,
}

/// Scaling between two levels of quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    /// Identity.
    None,
    /// Horizontal only.
    OneD,
    /// Horizontal and vertical.
    #[default]
    TwoD,
}

/// Embedded user data width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserDataMode {
    /// No embedded user data.
    #[default]
    None,
    /// Two bits per transform.
    TwoBits,
    /// Six bits per transform.
    SixBits,
}

/// How embedded user data payloads are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserDataMethod {
    /// All zero payloads.
    #[default]
    Zeros,
    /// All one payloads.
    Ones,
    /// Time seeded pseudo random payloads.
    Random,
    /// Fixed seed pseudo random payloads.
    FixedRandom,
}

/// Tile layout of the encoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileDimensions {
    /// Untiled.
    #[default]
    None,
    /// 512x256 pel tiles.
    Tile512x256,
    /// 1024x512 pel tiles.
    Tile1024x512,
    /// Signalled tile dimensions.
    Custom,
}

/// Quantization matrix signalling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantMatrixMode {
    /// Use the previous frame's coefficients on both LoQs.
    #[default]
    BothPrevious,
    /// Use the default tables on both LoQs.
    BothDefault,
    /// One custom set used for both LoQs.
    SameAndCustom,
    /// Custom for LoQ-2, defaults for LoQ-1.
    Level2CustomLevel1Default,
    /// Defaults for LoQ-2, custom for LoQ-1.
    Level2DefaultLevel1Custom,
    /// Independent custom sets.
    DifferentAndCustom,
}

/// Compression applied to per-tile side data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Uncompressed.
    #[default]
    None,
    /// Prefix coded absolute values.
    Prefix,
    /// Prefix coded deltas.
    PrefixOnDiff,
}

/// Output dithering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DitheringType {
    /// No dithering.
    #[default]
    None,
    /// Uniform noise, free running seed.
    Uniform,
    /// Uniform noise, fixed seed.
    UniformFixed,
}

/// Dequantization offset mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DequantOffset {
    /// Step width dependent derivation.
    #[default]
    Default,
    /// Constant signalled offset.
    ConstOffset,
}

/// Transform kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformType {
    /// 2x2 directional decomposition.
    Dd,
    /// 4x4 directional decomposition squared.
    #[default]
    Dds,
}

/// Frame or field picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PictureType {
    /// Progressive frame.
    #[default]
    Frame,
    /// Interlaced field.
    Field,
}

/// Top or bottom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    /// Top field.
    #[default]
    Top,
    /// Bottom field.
    Bottom,
}

/// Bitstream profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    /// Main profile.
    #[default]
    Main,
    /// Main 4:4:4 profile.
    Main444,
}

/// Base frame coding classes as reported by the base codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseFrameType {
    /// Instantaneous decoder refresh.
    Idr,
    /// Intra, non-IDR.
    Intra,
    /// Inter predicted.
    Inter,
    /// Forward predicted.
    Pred,
    /// Bidirectionally predicted.
    Bidi,
}

impl BaseFrameType {
    /// True for frames that reset all enhancement temporal state.
    pub fn is_intra(self) -> bool {
        matches!(self, BaseFrameType::Idr | BaseFrameType::Intra)
    }
}

/// Temporal step width modifier application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalSwm {
    /// Modifier not applied.
    #[default]
    Disabled,
    /// Modifier applied everywhere.
    Active,
    /// Modifier applied per tile according to the temporal mask.
    Dependent,
}

/// Sequence scope configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConfiguration {
    /// Bitstream profile.
    pub profile_idc: Profile,
    /// Level identifier; 15 escapes to the extended fields.
    pub level_idc: u32,
    /// Sublevel identifier.
    pub sublevel_idc: u32,
    /// Extended profile, carried when profile or level is 15.
    pub extended_profile_idc: u32,
    /// Extended level, carried when profile or level is 15.
    pub extended_level_idc: u32,
    /// True when conformance window offsets follow.
    pub conformance_window: bool,
    /// Left crop in crop units.
    pub conf_win_left_offset: u32,
    /// Right crop in crop units.
    pub conf_win_right_offset: u32,
    /// Top crop in crop units.
    pub conf_win_top_offset: u32,
    /// Bottom crop in crop units.
    pub conf_win_bottom_offset: u32,
}

impl Default for SequenceConfiguration {
    fn default() -> Self {
        Self {
            profile_idc: Profile::Main,
            level_idc: 4,
            sublevel_idc: 1,
            extended_profile_idc: 0,
            extended_level_idc: 0,
            conformance_window: false,
            conf_win_left_offset: 0,
            conf_win_right_offset: 0,
            conf_win_top_offset: 0,
            conf_win_bottom_offset: 0,
        }
    }
}

/// Stream scope configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfiguration {
    /// Planes carrying enhancement, 1 or 3.
    pub num_processed_planes: usize,
    /// Full resolution luma width.
    pub resolution_width: u32,
    /// Full resolution luma height.
    pub resolution_height: u32,
    /// Chroma structure.
    pub colourspace: crate::image::Colourspace,
    /// Base codec bit depth.
    pub base_depth: u32,
    /// Enhancement bit depth.
    pub enhancement_depth: u32,
    /// Transform block size, 2 or 4.
    pub transform_block_size: u32,
    /// Residual layers per transform: 4 or 16.
    pub num_residual_layers: usize,
    /// Per LoQ scaling (index by [`LOQ_LEVEL_1`]/[`LOQ_LEVEL_2`]).
    pub scaling_mode: [ScalingMode; 2],
    /// Upsampling kernel.
    pub upsample: Upsample,
    /// Adaptive kernel magnitudes.
    pub upsampling_coefficients: [u32; 4],
    /// Predicted residual adjustment enabled.
    pub predicted_residual_enabled: bool,
    /// Temporal prediction enabled for the stream.
    pub temporal_enabled: bool,
    /// Reduced per-tile temporal signalling enabled.
    pub temporal_tile_intra_signalling_enabled: bool,
    /// Temporal step width modifier, 48 when not signalled.
    pub temporal_step_width_modifier: u32,
    /// Level-1 filter corner coefficient.
    pub level_1_filtering_first_coefficient: u32,
    /// Level-1 filter edge coefficient.
    pub level_1_filtering_second_coefficient: u32,
    /// Promote the base plane to enhancement depth before LoQ-1.
    pub level1_depth_flag: bool,
    /// Embedded user data width.
    pub user_data_enabled: UserDataMode,
    /// Tile layout.
    pub tile_dimensions_type: TileDimensions,
    /// Tile width in pels, 0 when untiled.
    pub tile_width: u32,
    /// Tile height in pels, 0 when untiled.
    pub tile_height: u32,
    /// Prefix code the per-tile entropy enabled flags.
    pub compression_type_entropy_enabled_per_tile: bool,
    /// Compression applied to per-tile sizes.
    pub compression_type_size_per_tile: CompressionType,
    /// Chroma step width scale in 1/64 units, 64 when not signalled.
    pub chroma_step_width_multiplier: u32,
    /// Emit an additional info block on IDR frames.
    pub additional_info_present: bool,
}

impl Default for GlobalConfiguration {
    fn default() -> Self {
        Self {
            num_processed_planes: 1,
            resolution_width: 0,
            resolution_height: 0,
            colourspace: crate::image::Colourspace::Yuv420,
            base_depth: 8,
            enhancement_depth: 8,
            transform_block_size: 4,
            num_residual_layers: 16,
            scaling_mode: {
                let mut m = [ScalingMode::None; 2];
                m[LOQ_LEVEL_1] = ScalingMode::None;
                m[LOQ_LEVEL_2] = ScalingMode::TwoD;
                m
            },
            upsample: Upsample::ModifiedCubic,
            upsampling_coefficients: [0; 4],
            predicted_residual_enabled: true,
            temporal_enabled: true,
            temporal_tile_intra_signalling_enabled: true,
            temporal_step_width_modifier: 48,
            level_1_filtering_first_coefficient: 0,
            level_1_filtering_second_coefficient: 0,
            level1_depth_flag: false,
            user_data_enabled: UserDataMode::None,
            tile_dimensions_type: TileDimensions::None,
            tile_width: 0,
            tile_height: 0,
            compression_type_entropy_enabled_per_tile: false,
            compression_type_size_per_tile: CompressionType::None,
            chroma_step_width_multiplier: 64,
            additional_info_present: false,
        }
    }
}

impl GlobalConfiguration {
    /// Sets the transform type, keeping the layer count consistent.
    pub fn set_transform(&mut self, transform: TransformType) {
        match transform {
            TransformType::Dd => {
                self.transform_block_size = 2;
                self.num_residual_layers = 4;
            }
            TransformType::Dds => {
                self.transform_block_size = 4;
                self.num_residual_layers = 16;
            }
        }
    }

    /// Derives the tile dimension type from the tile size.
    pub fn resolve_tile_dimensions(&mut self) {
        self.tile_dimensions_type = match (self.tile_width, self.tile_height) {
            (0, 0) => TileDimensions::None,
            (512, 256) => TileDimensions::Tile512x256,
            (1024, 512) => TileDimensions::Tile1024x512,
            _ => TileDimensions::Custom,
        };
    }
}

/// Picture scope configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureConfiguration {
    /// Residual layers present for this picture.
    pub enhancement_enabled: bool,
    /// Quantization matrix mode.
    pub quant_matrix_mode: QuantMatrixMode,
    /// Custom LoQ-1 coefficients.
    pub qm_coefficient_1: [u8; MAX_NUM_LAYERS],
    /// Custom LoQ-2 coefficients.
    pub qm_coefficient_2: [u8; MAX_NUM_LAYERS],
    /// Signalled step widths per LoQ, after in-loop adjustment.
    pub step_width_loq: [i32; 2],
    /// Step widths as configured, before in-loop adjustment.
    pub step_width_loq_orig: [i32; 2],
    /// Dequantization offset signalled.
    pub dequant_offset_signalled: bool,
    /// Dequantization offset mode.
    pub dequant_offset_mode: DequantOffset,
    /// Signalled dequantization offset.
    pub dequant_offset: i32,
    /// Picture structure.
    pub picture_type: PictureType,
    /// Field parity for field pictures.
    pub field_type: FieldType,
    /// Temporal buffer cleared before this picture.
    pub temporal_refresh: bool,
    /// Temporal mask layer present.
    pub temporal_signalling_present: bool,
    /// Level-1 filter applied to this picture.
    pub level_1_filtering_enabled: bool,
    /// Dithering block present.
    pub dithering_control: bool,
    /// Dithering mode.
    pub dithering_type: DitheringType,
    /// Dithering strength, 0..=31.
    pub dithering_strength: u32,
}

impl Default for PictureConfiguration {
    fn default() -> Self {
        Self {
            enhancement_enabled: true,
            quant_matrix_mode: QuantMatrixMode::BothPrevious,
            qm_coefficient_1: [0; MAX_NUM_LAYERS],
            qm_coefficient_2: [0; MAX_NUM_LAYERS],
            step_width_loq: [MAX_STEP_WIDTH; 2],
            step_width_loq_orig: [MAX_STEP_WIDTH; 2],
            dequant_offset_signalled: false,
            dequant_offset_mode: DequantOffset::Default,
            dequant_offset: 0,
            picture_type: PictureType::Frame,
            field_type: FieldType::Top,
            temporal_refresh: false,
            temporal_signalling_present: false,
            level_1_filtering_enabled: false,
            dithering_control: false,
            dithering_type: DitheringType::None,
            dithering_strength: 0,
        }
    }
}

/// Additional info block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdditionalInfo {
    /// 0 = SEI payload, 1 = VUI parameters.
    pub additional_info_type: u8,
    /// SEI payload type when `additional_info_type` is 0.
    pub payload_type: u8,
}

/// The full configuration tree carried in the bitstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignaledConfiguration {
    /// Sequence scope.
    pub sequence: SequenceConfiguration,
    /// Stream scope.
    pub global: GlobalConfiguration,
    /// Picture scope.
    pub picture: PictureConfiguration,
    /// Optional additional info.
    pub additional_info: AdditionalInfo,
}
