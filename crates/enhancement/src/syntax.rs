//! Syntax block serializer and deserializer.
//!
//! A payload is an ordered concatenation of self-delimited blocks: a
//! 3-bit size type and 5-bit payload type, an optional multibyte length,
//! then the block body. Sequence, global and picture configuration bodies
//! are enumerated bit for bit; encoded data bodies carry the entropy coded
//! layers, untiled or tiled.

use bytes::Bytes;
use lcevc_bitio::multibyte::{put_multibyte, read_multibyte};
use lcevc_bitio::{BitReader, BitWriter};

use crate::config::{
    CompressionType, DequantOffset, DitheringType, FieldType, PictureType, Profile, QuantMatrixMode, ScalingMode,
    SignaledConfiguration, TileDimensions, UserDataMode, Upsample,
};
use crate::dimensions::Dimensions;
use crate::image::Colourspace;
use crate::surface::{Surface, SurfaceBuilder};
use crate::{entropy, Error, Result, LOQ_LEVEL_1, LOQ_LEVEL_2, MAX_NUM_LOQS};

/// Block selection bits, combined into a serialization mask.
pub mod blocks {
    /// Sequence configuration.
    pub const SEQUENCE: u32 = 1;
    /// Global configuration.
    pub const GLOBAL: u32 = 2;
    /// Picture configuration.
    pub const PICTURE: u32 = 4;
    /// Untiled encoded data.
    pub const ENCODED_DATA: u32 = 8;
    /// Tiled encoded data.
    pub const ENCODED_DATA_TILED: u32 = 16;
    /// Additional info.
    pub const ADDITIONAL_INFO: u32 = 32;
    /// Filler.
    pub const FILLER: u32 = 64;
}

/// Wire payload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Sequence configuration.
    Sequence,
    /// Global configuration.
    Global,
    /// Picture configuration.
    Picture,
    /// Untiled encoded data.
    EncodedData,
    /// Tiled encoded data.
    EncodedDataTiled,
    /// Additional info.
    AdditionalInfo,
    /// Filler.
    Filler,
}

impl PayloadType {
    fn to_wire(self) -> u32 {
        match self {
            PayloadType::Sequence => 0,
            PayloadType::Global => 1,
            PayloadType::Picture => 2,
            PayloadType::EncodedData => 3,
            PayloadType::EncodedDataTiled => 4,
            PayloadType::AdditionalInfo => 5,
            PayloadType::Filler => 6,
        }
    }

    fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => PayloadType::Sequence,
            1 => PayloadType::Global,
            2 => PayloadType::Picture,
            3 => PayloadType::EncodedData,
            4 => PayloadType::EncodedDataTiled,
            5 => PayloadType::AdditionalInfo,
            6 => PayloadType::Filler,
            _ => return None,
        })
    }
}

/// Preset coded resolutions; index 63 on the wire means custom.
pub const RESOLUTION_TABLE: [(u16, u16); 51] = [
    (0, 0),
    (360, 200),
    (400, 240),
    (480, 320),
    (640, 360),
    (640, 480),
    (768, 480),
    (800, 600),
    (852, 480),
    (854, 480),
    (856, 480),
    (960, 540),
    (960, 640),
    (1024, 576),
    (1024, 600),
    (1024, 768),
    (1152, 864),
    (1280, 720),
    (1280, 800),
    (1280, 1024),
    (1360, 768),
    (1366, 768),
    (1440, 1050),
    (1440, 900),
    (1600, 1200),
    (1680, 1050),
    (1920, 1080),
    (1920, 1200),
    (2048, 1080),
    (2048, 1152),
    (2048, 1536),
    (2160, 1440),
    (2560, 1440),
    (2560, 1600),
    (2560, 2048),
    (3200, 1800),
    (3200, 2048),
    (3200, 2400),
    (3440, 1440),
    (3840, 1600),
    (3840, 2160),
    (3840, 3072),
    (4096, 2160),
    (4096, 3072),
    (5120, 2880),
    (5120, 3200),
    (5120, 4096),
    (6400, 4096),
    (6400, 4800),
    (7680, 4320),
    (7680, 4800),
];

/// Symbol surfaces for one plane of one picture.
#[derive(Debug, Clone, Default)]
pub struct PlaneSymbols {
    /// Residual layers per LoQ (index by [`LOQ_LEVEL_1`]/[`LOQ_LEVEL_2`]).
    pub residuals: [Vec<Surface<i16>>; MAX_NUM_LOQS],
    /// Temporal signalling mask for LoQ-2.
    pub temporal: Option<Surface<u8>>,
}

/// Symbol surfaces for a whole picture.
#[derive(Debug, Clone, Default)]
pub struct FrameSymbols {
    /// One entry per processed plane.
    pub planes: Vec<PlaneSymbols>,
}

fn err(msg: impl Into<String>) -> Error {
    Error::Bitstream(msg.into())
}

//// Serialization
//

/// Serializes the blocks selected by `block_mask` into one enhancement
/// payload.
pub fn serialize(
    configuration: &SignaledConfiguration,
    dimensions: &Dimensions,
    block_mask: u32,
    symbols: &FrameSymbols,
) -> Result<Bytes> {
    let mut out = BitWriter::new();
    let mut bit = blocks::SEQUENCE;
    while bit <= blocks::FILLER {
        if block_mask & bit != 0 {
            let block = serialize_block(configuration, dimensions, bit, symbols)?;
            out.put_bytes(&block);
        }
        bit <<= 1;
    }
    Ok(out.finish())
}

fn serialize_block(
    configuration: &SignaledConfiguration,
    dimensions: &Dimensions,
    block: u32,
    symbols: &FrameSymbols,
) -> Result<Bytes> {
    let mut contents = BitWriter::new();
    let payload_type = match block {
        blocks::SEQUENCE => {
            contents.push_label("sequence_config");
            write_sequence(&configuration.sequence, &mut contents)?;
            PayloadType::Sequence
        }
        blocks::GLOBAL => {
            contents.push_label("global_config");
            write_global(&configuration.global, &mut contents)?;
            PayloadType::Global
        }
        blocks::PICTURE => {
            contents.push_label("picture_config");
            write_picture(configuration, &mut contents)?;
            PayloadType::Picture
        }
        blocks::ENCODED_DATA => {
            contents.push_label("encoded_data");
            write_encoded_data(configuration, &mut contents, symbols)?;
            PayloadType::EncodedData
        }
        blocks::ENCODED_DATA_TILED => {
            contents.push_label("encoded_data_tiled");
            write_encoded_data_tiled(configuration, dimensions, &mut contents, symbols)?;
            PayloadType::EncodedDataTiled
        }
        blocks::ADDITIONAL_INFO => {
            contents.push_label("additional_info");
            write_additional_info(configuration, &mut contents)?;
            PayloadType::AdditionalInfo
        }
        blocks::FILLER => {
            contents.push_label("filler");
            write_filler(&mut contents, 0);
            PayloadType::Filler
        }
        _ => return Err(Error::Configuration(format!("unknown syntax block {block}"))),
    };
    let contents = contents.finish();

    let mut out = BitWriter::new();
    let payload_size_type = if contents.len() <= 5 { contents.len() as u32 } else { 7 };
    out.put_bits(3, payload_size_type);
    out.put_bits(5, payload_type.to_wire());
    if payload_size_type == 7 {
        put_multibyte(&mut out, contents.len() as u64);
    }
    out.put_bytes(&contents);
    Ok(out.finish())
}

fn write_sequence(sequence: &crate::config::SequenceConfiguration, w: &mut BitWriter) -> Result<()> {
    let profile = match sequence.profile_idc {
        Profile::Main => 0,
        Profile::Main444 => 1,
    };
    w.put_bits(4, profile);
    w.put_bits(4, sequence.level_idc);
    w.put_bits(2, sequence.sublevel_idc);
    w.put_bit(sequence.conformance_window);
    w.put_bits(5, 0); // reserved
    if profile == 15 || sequence.level_idc == 15 {
        w.put_bits(3, sequence.extended_profile_idc);
        w.put_bits(4, sequence.extended_level_idc);
        w.put_bit(false); // reserved
    }
    if sequence.conformance_window {
        put_multibyte(w, u64::from(sequence.conf_win_left_offset));
        put_multibyte(w, u64::from(sequence.conf_win_right_offset));
        put_multibyte(w, u64::from(sequence.conf_win_top_offset));
        put_multibyte(w, u64::from(sequence.conf_win_bottom_offset));
    }
    Ok(())
}

fn write_global(global: &crate::config::GlobalConfiguration, w: &mut BitWriter) -> Result<()> {
    match global.num_processed_planes {
        1 => w.put_bit(false),
        3 => w.put_bit(true),
        n => return Err(Error::Configuration(format!("{n} processed planes"))),
    }

    let resolution_type = RESOLUTION_TABLE
        .iter()
        .position(|&(rw, rh)| u32::from(rw) == global.resolution_width && u32::from(rh) == global.resolution_height)
        .map(|i| i as u32)
        .unwrap_or(63);
    w.put_bits(6, resolution_type);

    match global.transform_block_size {
        2 => w.put_bit(false),
        4 => w.put_bit(true),
        n => return Err(Error::Configuration(format!("transform block size {n}"))),
    }

    let chroma = match global.colourspace {
        Colourspace::Y => 0,
        Colourspace::Yuv420 => 1,
        Colourspace::Yuv422 => 2,
        Colourspace::Yuv444 => 3,
    };
    w.put_bits(2, chroma);

    let depth_code = |depth: u32| -> Result<u32> {
        match depth {
            8 => Ok(0),
            10 => Ok(1),
            12 => Ok(2),
            14 => Ok(3),
            _ => Err(Error::Configuration(format!("bit depth {depth}"))),
        }
    };
    w.put_bits(2, depth_code(global.base_depth)?);
    w.put_bits(2, depth_code(global.enhancement_depth)?);

    w.put_bit(global.temporal_step_width_modifier != 48);
    w.put_bit(global.predicted_residual_enabled);
    w.put_bit(global.temporal_tile_intra_signalling_enabled);
    w.put_bit(global.temporal_enabled);

    let upsample = match global.upsample {
        Upsample::Nearest => 0,
        Upsample::Linear => 1,
        Upsample::Cubic => 2,
        Upsample::ModifiedCubic => 3,
        Upsample::AdaptiveCubic => 4,
    };
    w.put_bits(3, upsample);

    let level1_filter_signalled =
        global.level_1_filtering_first_coefficient != 0 || global.level_1_filtering_second_coefficient != 0;
    w.put_bit(level1_filter_signalled);

    let scaling = |mode: ScalingMode| -> u32 {
        match mode {
            ScalingMode::None => 0,
            ScalingMode::OneD => 1,
            ScalingMode::TwoD => 2,
        }
    };
    w.put_bits(2, scaling(global.scaling_mode[LOQ_LEVEL_1]));
    w.put_bits(2, scaling(global.scaling_mode[LOQ_LEVEL_2]));

    let tile_dimensions = match global.tile_dimensions_type {
        TileDimensions::None => 0,
        TileDimensions::Tile512x256 => 1,
        TileDimensions::Tile1024x512 => 2,
        TileDimensions::Custom => 3,
    };
    w.put_bits(2, tile_dimensions);

    let user_data = match global.user_data_enabled {
        UserDataMode::None => 0,
        UserDataMode::TwoBits => 1,
        UserDataMode::SixBits => 2,
    };
    w.put_bits(2, user_data);

    w.put_bit(global.level1_depth_flag);
    w.put_bit(global.chroma_step_width_multiplier != 64);

    if global.num_processed_planes != 1 {
        w.put_bits(4, 1); // planes_type
        w.put_bits(4, 0); // reserved
    }

    if global.temporal_step_width_modifier != 48 {
        w.put_bits(8, global.temporal_step_width_modifier);
    }

    if global.upsample == Upsample::AdaptiveCubic {
        for c in global.upsampling_coefficients {
            w.put_bits(16, c);
        }
    }

    if level1_filter_signalled {
        w.put_bits(4, global.level_1_filtering_first_coefficient);
        w.put_bits(4, global.level_1_filtering_second_coefficient);
    }

    if global.tile_dimensions_type != TileDimensions::None {
        if global.tile_dimensions_type == TileDimensions::Custom {
            w.put_bits(16, global.tile_width);
            w.put_bits(16, global.tile_height);
        }
        w.put_bits(5, 0); // reserved
        w.put_bit(global.compression_type_entropy_enabled_per_tile);
        let compression = match global.compression_type_size_per_tile {
            CompressionType::None => 0,
            CompressionType::Prefix => 1,
            CompressionType::PrefixOnDiff => 2,
        };
        w.put_bits(2, compression);
    }

    if resolution_type == 63 {
        w.put_bits(16, global.resolution_width);
        w.put_bits(16, global.resolution_height);
    }

    if global.chroma_step_width_multiplier != 64 {
        w.put_bits(8, global.chroma_step_width_multiplier);
    }

    Ok(())
}

fn write_picture(configuration: &SignaledConfiguration, w: &mut BitWriter) -> Result<()> {
    let picture = &configuration.picture;
    let num_layers = configuration.global.num_residual_layers;

    w.put_bit(!picture.enhancement_enabled);

    if picture.enhancement_enabled {
        let qm_mode = match picture.quant_matrix_mode {
            QuantMatrixMode::BothPrevious => 0,
            QuantMatrixMode::BothDefault => 1,
            QuantMatrixMode::SameAndCustom => 2,
            QuantMatrixMode::Level2CustomLevel1Default => 3,
            QuantMatrixMode::Level2DefaultLevel1Custom => 4,
            QuantMatrixMode::DifferentAndCustom => 5,
        };
        w.put_bits(3, qm_mode);
        w.put_bit(picture.dequant_offset_signalled);
        w.put_bit(picture.picture_type == PictureType::Field);
        w.put_bit(picture.temporal_refresh);
        w.put_bit(picture.step_width_loq[LOQ_LEVEL_1] != crate::MAX_STEP_WIDTH);
        w.put_bits(15, picture.step_width_loq[LOQ_LEVEL_2] as u32);
        w.put_bit(picture.dithering_control);
    } else {
        w.put_bits(4, 0); // reserved
        w.put_bit(picture.picture_type == PictureType::Field);
        w.put_bit(picture.temporal_refresh);
        w.put_bit(picture.temporal_signalling_present);
    }

    if picture.picture_type == PictureType::Field {
        w.put_bit(picture.field_type == FieldType::Bottom);
        w.put_bits(7, 0); // reserved
    }

    if picture.enhancement_enabled && picture.step_width_loq[LOQ_LEVEL_1] != crate::MAX_STEP_WIDTH {
        w.put_bits(15, picture.step_width_loq[LOQ_LEVEL_1] as u32);
        w.put_bit(picture.level_1_filtering_enabled);
    }

    if matches!(
        picture.quant_matrix_mode,
        QuantMatrixMode::SameAndCustom | QuantMatrixMode::Level2CustomLevel1Default | QuantMatrixMode::DifferentAndCustom
    ) {
        for layer in 0..num_layers {
            w.put_bits(8, u32::from(picture.qm_coefficient_2[layer]));
        }
    }
    if matches!(
        picture.quant_matrix_mode,
        QuantMatrixMode::Level2DefaultLevel1Custom | QuantMatrixMode::DifferentAndCustom
    ) {
        for layer in 0..num_layers {
            w.put_bits(8, u32::from(picture.qm_coefficient_1[layer]));
        }
    }

    if picture.dequant_offset_signalled {
        w.put_bit(picture.dequant_offset_mode == DequantOffset::ConstOffset);
        w.put_bits(7, picture.dequant_offset as u32);
    }

    if picture.dithering_control {
        let dithering = match picture.dithering_type {
            DitheringType::None => 0,
            DitheringType::Uniform | DitheringType::UniformFixed => 1,
        };
        w.put_bits(2, dithering);
        w.put_bit(false); // reserved
        if picture.dithering_type != DitheringType::None {
            w.put_bits(5, picture.dithering_strength);
        } else {
            w.put_bits(5, 0); // reserved
        }
    }

    Ok(())
}

fn write_additional_info(configuration: &SignaledConfiguration, w: &mut BitWriter) -> Result<()> {
    let info = &configuration.additional_info;
    w.put_bits(8, u32::from(info.additional_info_type));
    match info.additional_info_type {
        0 => w.put_bits(8, u32::from(info.payload_type)),
        1 => {}
        t => return Err(Error::Configuration(format!("additional info type {t}"))),
    }
    Ok(())
}

fn write_filler(w: &mut BitWriter, size: usize) {
    for _ in 0..size {
        w.put_bits(8, 0xaa);
    }
}

fn temporal_layer_present(configuration: &SignaledConfiguration, loq: usize) -> bool {
    loq == LOQ_LEVEL_2 && configuration.picture.temporal_signalling_present
}

fn first_layer(configuration: &SignaledConfiguration) -> usize {
    if configuration.picture.enhancement_enabled {
        0
    } else {
        configuration.global.num_residual_layers
    }
}

fn total_layers(configuration: &SignaledConfiguration, loq: usize) -> usize {
    configuration.global.num_residual_layers + usize::from(temporal_layer_present(configuration, loq))
}

/// Entropy codes one layer; `None` when the layer is empty.
fn encode_layer(
    configuration: &SignaledConfiguration,
    plane_symbols: &PlaneSymbols,
    loq: usize,
    layer: usize,
) -> Option<entropy::EncodedChunk> {
    let global = &configuration.global;
    if layer < global.num_residual_layers {
        let surface = &plane_symbols.residuals[loq][layer];
        let use_tiled_order = global.temporal_enabled || global.tile_dimensions_type != TileDimensions::None;
        if use_tiled_order {
            entropy::encode_residuals_tiled(surface, global.transform_block_size)
        } else {
            entropy::encode_residuals(surface)
        }
    } else {
        let mask = plane_symbols.temporal.as_ref()?;
        entropy::encode_temporal(
            mask,
            global.transform_block_size,
            global.temporal_tile_intra_signalling_enabled,
        )
    }
}

fn write_encoded_data(
    configuration: &SignaledConfiguration,
    w: &mut BitWriter,
    symbols: &FrameSymbols,
) -> Result<()> {
    let global = &configuration.global;
    let num_layers = global.num_residual_layers;
    let num_planes = global.num_processed_planes;

    // Entropy code every carried layer first.
    let mut chunks: Vec<Vec<Vec<Option<(Bytes, bool)>>>> = Vec::new();
    for plane in 0..num_planes {
        let mut per_loq = Vec::new();
        for loq in 0..MAX_NUM_LOQS {
            let mut layers: Vec<Option<(Bytes, bool)>> = vec![None; num_layers + 1];
            for layer in first_layer(configuration)..total_layers(configuration, loq) {
                if let Some(chunk) = encode_layer(configuration, &symbols.planes[plane], loq, layer) {
                    let (data, rle_only) = chunk.select();
                    layers[layer] = Some((data.clone(), rle_only));
                }
            }
            per_loq.push(layers);
        }
        chunks.push(per_loq);
    }

    // Flags.
    for plane in 0..num_planes {
        if configuration.picture.enhancement_enabled {
            for loq in 0..MAX_NUM_LOQS {
                for layer in 0..num_layers {
                    let state = &chunks[plane][loq][layer];
                    w.put_bit(state.is_some());
                    w.put_bit(state.as_ref().map(|s| s.1).unwrap_or(false));
                }
            }
        }
        if temporal_layer_present(configuration, LOQ_LEVEL_2) {
            let state = &chunks[plane][LOQ_LEVEL_2][num_layers];
            w.put_bit(state.is_some());
            w.put_bit(state.as_ref().map(|s| s.1).unwrap_or(false));
        }
    }

    w.byte_align();

    // Layer payloads.
    for per_loq in chunks.iter().take(num_planes) {
        for (loq, layers) in per_loq.iter().enumerate() {
            let n = num_layers + usize::from(temporal_layer_present(configuration, loq));
            for state in layers.iter().take(n) {
                if let Some((data, _)) = state {
                    put_multibyte(w, data.len() as u64);
                    w.put_bytes(data);
                }
            }
        }
    }

    Ok(())
}

struct TileGrid {
    tiles_x: u32,
    tiles_y: u32,
    tile_width: u32,
    tile_height: u32,
    layer_width: u32,
    layer_height: u32,
}

impl TileGrid {
    fn new(configuration: &SignaledConfiguration, dimensions: &Dimensions, plane: usize, loq: usize) -> Self {
        let block = configuration.global.transform_block_size;
        let layer_width = dimensions.plane_width(plane, loq) / block;
        let layer_height = dimensions.plane_height(plane, loq) / block;
        let tile_width = dimensions.tile_width(plane, loq);
        let tile_height = dimensions.tile_height(plane, loq);
        Self {
            tiles_x: (layer_width + tile_width - 1) / tile_width,
            tiles_y: (layer_height + tile_height - 1) / tile_height,
            tile_width,
            tile_height,
            layer_width,
            layer_height,
        }
    }

    fn num_tiles(&self) -> usize {
        (self.tiles_x * self.tiles_y) as usize
    }

    fn rect(&self, t: usize) -> (u32, u32, u32, u32) {
        let tx = t as u32 % self.tiles_x;
        let ty = t as u32 / self.tiles_x;
        let x0 = tx * self.tile_width;
        let y0 = ty * self.tile_height;
        let x1 = ((tx + 1) * self.tile_width).min(self.layer_width);
        let y1 = ((ty + 1) * self.tile_height).min(self.layer_height);
        (x0, y0, x1, y1)
    }
}

fn write_encoded_data_tiled(
    configuration: &SignaledConfiguration,
    dimensions: &Dimensions,
    w: &mut BitWriter,
    symbols: &FrameSymbols,
) -> Result<()> {
    let global = &configuration.global;
    let num_planes = global.num_processed_planes;

    // Per layer rle_only, per tile enabled flag and chosen packet.
    let mut rle_only = Vec::new();
    let mut entropy_enabled = Vec::new();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut grids = Vec::new();

    for plane in 0..num_planes {
        for loq in 0..MAX_NUM_LOQS {
            let grid = TileGrid::new(configuration, dimensions, plane, loq);

            for layer in first_layer(configuration)..total_layers(configuration, loq) {
                let mut encoded: Vec<entropy::EncodedChunk> = Vec::new();
                let mut raw_total = 0usize;
                let mut prefix_total = 0usize;

                for t in 0..grid.num_tiles() {
                    let (x0, y0, x1, y1) = grid.rect(t);
                    let chunk = if layer < global.num_residual_layers {
                        let tile = symbols.planes[plane].residuals[loq][layer].crop(x0, y0, x1, y1);
                        entropy::encode_residuals_tiled(&tile, global.transform_block_size)
                    } else {
                        let mask = symbols.planes[plane]
                            .temporal
                            .as_ref()
                            .ok_or_else(|| err("temporal layer without mask"))?;
                        entropy::encode_temporal(
                            &mask.crop(x0, y0, x1, y1),
                            global.transform_block_size,
                            global.temporal_tile_intra_signalling_enabled,
                        )
                    }
                    .unwrap_or_default();

                    raw_total += chunk.raw.len();
                    prefix_total += chunk.prefix.len();
                    entropy_enabled.push(!chunk.raw.is_empty());
                    encoded.push(chunk);
                }

                let layer_rle_only = raw_total < prefix_total;
                rle_only.push(layer_rle_only);
                for chunk in encoded {
                    chunks.push(if layer_rle_only { chunk.raw } else { chunk.prefix });
                }
            }
            grids.push(grid);
        }
    }

    for &r in &rle_only {
        w.put_bit(r);
    }
    w.byte_align();

    if !global.compression_type_entropy_enabled_per_tile {
        for &e in &entropy_enabled {
            w.put_bit(e);
        }
    } else {
        let flags = Surface::generate(entropy_enabled.len() as u32, 1, |x, _| u8::from(entropy_enabled[x as usize]));
        w.put_bytes(&entropy::encode_flags(&flags).raw);
    }
    w.byte_align();

    if global.compression_type_size_per_tile == CompressionType::None {
        for (c, chunk) in chunks.iter().enumerate() {
            if entropy_enabled[c] {
                put_multibyte(w, chunk.len() as u64);
                w.put_bytes(chunk);
            }
        }
    } else {
        let mut idx = 0usize;
        let mut grid_iter = grids.iter();
        for _plane in 0..num_planes {
            for loq in 0..MAX_NUM_LOQS {
                let grid = grid_iter.next().expect("grid per plane and loq");
                for _layer in first_layer(configuration)..total_layers(configuration, loq) {
                    let num_tiles = grid.num_tiles();
                    let any_enabled = (0..num_tiles).any(|t| entropy_enabled[idx + t]);
                    if any_enabled {
                        let sizes =
                            Surface::generate(num_tiles as u32, 1, |x, _| chunks[idx + x as usize].len() as u16);
                        let coded = entropy::encode_sizes(
                            &sizes,
                            &entropy_enabled,
                            idx,
                            global.compression_type_size_per_tile,
                        );
                        w.put_bytes(&coded.prefix);
                        for t in 0..num_tiles {
                            if !chunks[idx + t].is_empty() {
                                w.put_bytes(&chunks[idx + t]);
                            }
                        }
                    }
                    idx += num_tiles;
                }
            }
        }
    }

    Ok(())
}

//// Deserialization
//

/// One parsed picture: block order plus any decoded symbol surfaces.
#[derive(Debug, Default)]
pub struct DeserializedPicture {
    /// Payload types in stream order.
    pub blocks: Vec<PayloadType>,
    /// Decoded symbol surfaces when an encoded data block was present.
    pub symbols: Option<FrameSymbols>,
}

impl DeserializedPicture {
    /// True when the payload carried the given block type.
    pub fn has_block(&self, t: PayloadType) -> bool {
        self.blocks.contains(&t)
    }
}

/// Parses one enhancement payload, updating `configuration` in place.
///
/// A malformed block is skipped with a warning; the surviving blocks
/// still apply, so a damaged payload degrades rather than aborts.
pub fn deserialize(data: &[u8], configuration: &mut SignaledConfiguration) -> Result<DeserializedPicture> {
    let mut out = DeserializedPicture::default();
    let mut r = BitReader::new(data);

    while r.remaining_bytes() > 0 {
        let payload_size_type = r.read_bits(3);
        let payload_type = r.read_bits(5);

        let size = match payload_size_type {
            n @ 0..=5 => n as usize,
            7 => read_multibyte(&mut r) as usize,
            _ => return Err(err(format!("payload size type {payload_size_type}"))),
        };
        if size > r.remaining_bytes() {
            return Err(err(format!("block of {size} bytes overruns the payload")));
        }
        let body = r.read_bytes(size);

        let Some(payload_type) = PayloadType::from_wire(payload_type) else {
            tracing::warn!(payload_type, "skipping unknown syntax block");
            continue;
        };

        let mut b = BitReader::new(body);
        let parsed = match payload_type {
            PayloadType::Sequence => parse_sequence(&mut b, configuration),
            PayloadType::Global => parse_global(&mut b, configuration),
            PayloadType::Picture => parse_picture(&mut b, configuration),
            PayloadType::EncodedData => parse_encoded_data(&mut b, configuration).map(|s| {
                out.symbols = Some(s);
            }),
            PayloadType::EncodedDataTiled => parse_encoded_data_tiled(&mut b, configuration).map(|s| {
                out.symbols = Some(s);
            }),
            PayloadType::AdditionalInfo => parse_additional_info(&mut b, configuration),
            PayloadType::Filler => Ok(()),
        };
        // A bad block is isolated: downstream stages see empty input.
        match parsed {
            Ok(()) => out.blocks.push(payload_type),
            Err(e) => tracing::warn!(?payload_type, "skipping malformed syntax block: {e}"),
        }
    }

    Ok(out)
}

fn parse_sequence(r: &mut BitReader, configuration: &mut SignaledConfiguration) -> Result<()> {
    let sequence = &mut configuration.sequence;
    let profile_raw = r.read_bits(4);
    sequence.level_idc = r.read_bits(4);
    sequence.sublevel_idc = r.read_bits(2);
    sequence.conformance_window = r.read_bit();
    r.read_bits(5); // reserved
    if profile_raw == 15 || sequence.level_idc == 15 {
        sequence.extended_profile_idc = r.read_bits(3);
        sequence.extended_level_idc = r.read_bits(4);
        r.read_bit(); // reserved
    } else {
        sequence.extended_profile_idc = 0;
        sequence.extended_level_idc = 0;
    }
    sequence.profile_idc = match profile_raw {
        0 => Profile::Main,
        1 => Profile::Main444,
        p => return Err(err(format!("profile_idc {p}"))),
    };
    if sequence.conformance_window {
        sequence.conf_win_left_offset = read_multibyte(r) as u32;
        sequence.conf_win_right_offset = read_multibyte(r) as u32;
        sequence.conf_win_top_offset = read_multibyte(r) as u32;
        sequence.conf_win_bottom_offset = read_multibyte(r) as u32;
    }
    Ok(())
}

fn parse_global(r: &mut BitReader, configuration: &mut SignaledConfiguration) -> Result<()> {
    let global = &mut configuration.global;

    global.num_processed_planes = if r.read_bit() { 3 } else { 1 };
    let resolution_type = r.read_bits(6);

    if r.read_bit() {
        global.transform_block_size = 4;
        global.num_residual_layers = 16;
    } else {
        global.transform_block_size = 2;
        global.num_residual_layers = 4;
    }

    global.colourspace = match r.read_bits(2) {
        0 => Colourspace::Y,
        1 => Colourspace::Yuv420,
        2 => Colourspace::Yuv422,
        _ => Colourspace::Yuv444,
    };

    let depth = |code: u32| 8 + 2 * code;
    global.base_depth = depth(r.read_bits(2));
    global.enhancement_depth = depth(r.read_bits(2));

    let swm_signalled = r.read_bit();
    global.predicted_residual_enabled = r.read_bit();
    global.temporal_tile_intra_signalling_enabled = r.read_bit();
    global.temporal_enabled = r.read_bit();

    global.upsample = match r.read_bits(3) {
        0 => Upsample::Nearest,
        1 => Upsample::Linear,
        2 => Upsample::Cubic,
        3 => Upsample::ModifiedCubic,
        4 => Upsample::AdaptiveCubic,
        u => return Err(err(format!("upsample type {u}"))),
    };

    let level1_filter_signalled = r.read_bit();

    let scaling = |code: u32| -> Result<ScalingMode> {
        Ok(match code {
            0 => ScalingMode::None,
            1 => ScalingMode::OneD,
            2 => ScalingMode::TwoD,
            s => return Err(err(format!("scaling mode {s}"))),
        })
    };
    global.scaling_mode[LOQ_LEVEL_1] = scaling(r.read_bits(2))?;
    global.scaling_mode[LOQ_LEVEL_2] = scaling(r.read_bits(2))?;

    global.tile_dimensions_type = match r.read_bits(2) {
        0 => TileDimensions::None,
        1 => TileDimensions::Tile512x256,
        2 => TileDimensions::Tile1024x512,
        _ => TileDimensions::Custom,
    };

    global.user_data_enabled = match r.read_bits(2) {
        0 => UserDataMode::None,
        1 => UserDataMode::TwoBits,
        2 => UserDataMode::SixBits,
        u => return Err(err(format!("user data mode {u}"))),
    };

    global.level1_depth_flag = r.read_bit();
    let chroma_swm_signalled = r.read_bit();

    if global.num_processed_planes != 1 {
        let planes_type = r.read_bits(4);
        if planes_type != 1 {
            return Err(err(format!("planes_type {planes_type}")));
        }
        r.read_bits(4); // reserved
    }

    global.temporal_step_width_modifier = if swm_signalled { r.read_bits(8) } else { 48 };

    if global.upsample == Upsample::AdaptiveCubic {
        for c in &mut global.upsampling_coefficients {
            *c = r.read_bits(16);
        }
    }

    if level1_filter_signalled {
        global.level_1_filtering_first_coefficient = r.read_bits(4);
        global.level_1_filtering_second_coefficient = r.read_bits(4);
    } else {
        global.level_1_filtering_first_coefficient = 0;
        global.level_1_filtering_second_coefficient = 0;
    }

    if global.tile_dimensions_type != TileDimensions::None {
        match global.tile_dimensions_type {
            TileDimensions::Tile512x256 => {
                global.tile_width = 512;
                global.tile_height = 256;
            }
            TileDimensions::Tile1024x512 => {
                global.tile_width = 1024;
                global.tile_height = 512;
            }
            TileDimensions::Custom => {
                global.tile_width = r.read_bits(16);
                global.tile_height = r.read_bits(16);
            }
            TileDimensions::None => unreachable!(),
        }
        r.read_bits(5); // reserved
        global.compression_type_entropy_enabled_per_tile = r.read_bit();
        global.compression_type_size_per_tile = match r.read_bits(2) {
            0 => CompressionType::None,
            1 => CompressionType::Prefix,
            2 => CompressionType::PrefixOnDiff,
            c => return Err(err(format!("size compression type {c}"))),
        };
    } else {
        global.tile_width = 0;
        global.tile_height = 0;
    }

    if resolution_type == 63 {
        global.resolution_width = r.read_bits(16);
        global.resolution_height = r.read_bits(16);
    } else if let Some(&(rw, rh)) = RESOLUTION_TABLE.get(resolution_type as usize) {
        global.resolution_width = u32::from(rw);
        global.resolution_height = u32::from(rh);
    } else {
        return Err(err(format!("resolution type {resolution_type}")));
    }

    global.chroma_step_width_multiplier = if chroma_swm_signalled { r.read_bits(8) } else { 64 };

    Ok(())
}

fn parse_picture(r: &mut BitReader, configuration: &mut SignaledConfiguration) -> Result<()> {
    let num_layers = configuration.global.num_residual_layers;
    let temporal_enabled = configuration.global.temporal_enabled;
    let picture = &mut configuration.picture;

    picture.enhancement_enabled = !r.read_bit();

    if picture.enhancement_enabled {
        picture.quant_matrix_mode = match r.read_bits(3) {
            0 => QuantMatrixMode::BothPrevious,
            1 => QuantMatrixMode::BothDefault,
            2 => QuantMatrixMode::SameAndCustom,
            3 => QuantMatrixMode::Level2CustomLevel1Default,
            4 => QuantMatrixMode::Level2DefaultLevel1Custom,
            5 => QuantMatrixMode::DifferentAndCustom,
            m => return Err(err(format!("quant matrix mode {m}"))),
        };
        picture.dequant_offset_signalled = r.read_bit();
        picture.picture_type = if r.read_bit() { PictureType::Field } else { PictureType::Frame };
        picture.temporal_refresh = r.read_bit();
        let step_width_level1_enabled = r.read_bit();
        picture.step_width_loq[LOQ_LEVEL_2] = r.read_bits(15) as i32;
        picture.dithering_control = r.read_bit();

        // The temporal layer rides along whenever the stream uses
        // temporal prediction and this picture does not refresh.
        picture.temporal_signalling_present = temporal_enabled && !picture.temporal_refresh;

        if picture.picture_type == PictureType::Field {
            picture.field_type = if r.read_bit() { FieldType::Bottom } else { FieldType::Top };
            r.read_bits(7); // reserved
        }

        if step_width_level1_enabled {
            picture.step_width_loq[LOQ_LEVEL_1] = r.read_bits(15) as i32;
            picture.level_1_filtering_enabled = r.read_bit();
        } else {
            picture.step_width_loq[LOQ_LEVEL_1] = crate::MAX_STEP_WIDTH;
            picture.level_1_filtering_enabled = false;
        }
    } else {
        r.read_bits(4); // reserved
        picture.picture_type = if r.read_bit() { PictureType::Field } else { PictureType::Frame };
        picture.temporal_refresh = r.read_bit();
        picture.temporal_signalling_present = r.read_bit();

        if picture.picture_type == PictureType::Field {
            picture.field_type = if r.read_bit() { FieldType::Bottom } else { FieldType::Top };
            r.read_bits(7); // reserved
        }
    }

    // The trailing fields key off picture state that survives from the
    // previous picture when this one carries no enhancement, exactly as
    // on the emit side.
    if matches!(
        picture.quant_matrix_mode,
        QuantMatrixMode::SameAndCustom | QuantMatrixMode::Level2CustomLevel1Default | QuantMatrixMode::DifferentAndCustom
    ) {
        for layer in 0..num_layers {
            picture.qm_coefficient_2[layer] = r.read_bits(8) as u8;
        }
    }
    if matches!(
        picture.quant_matrix_mode,
        QuantMatrixMode::Level2DefaultLevel1Custom | QuantMatrixMode::DifferentAndCustom
    ) {
        for layer in 0..num_layers {
            picture.qm_coefficient_1[layer] = r.read_bits(8) as u8;
        }
    }

    if picture.dequant_offset_signalled {
        picture.dequant_offset_mode = if r.read_bit() {
            DequantOffset::ConstOffset
        } else {
            DequantOffset::Default
        };
        picture.dequant_offset = r.read_bits(7) as i32;
    }

    if picture.dithering_control {
        let dithering = r.read_bits(2);
        r.read_bit(); // reserved
        let strength = r.read_bits(5);
        picture.dithering_type = match dithering {
            0 => DitheringType::None,
            _ => DitheringType::Uniform,
        };
        picture.dithering_strength = strength;
    }

    Ok(())
}

fn parse_additional_info(r: &mut BitReader, configuration: &mut SignaledConfiguration) -> Result<()> {
    let info = &mut configuration.additional_info;
    info.additional_info_type = r.read_bits(8) as u8;
    match info.additional_info_type {
        0 => info.payload_type = r.read_bits(8) as u8,
        1 => {}
        t => return Err(err(format!("additional info type {t}"))),
    }
    Ok(())
}

fn layer_dimensions(configuration: &SignaledConfiguration, plane: usize, loq: usize) -> (u32, u32) {
    let dims = Dimensions::new(configuration, configuration.global.resolution_width, configuration.global.resolution_height);
    let block = configuration.global.transform_block_size;
    (dims.plane_width(plane, loq) / block, dims.plane_height(plane, loq) / block)
}

fn decode_layer_chunk(
    configuration: &SignaledConfiguration,
    width: u32,
    height: u32,
    layer: usize,
    entropy_enabled: bool,
    rle_only: bool,
    data: &[u8],
) -> LayerSurface {
    let global = &configuration.global;
    let mut r = BitReader::new(data);
    if layer < global.num_residual_layers {
        let use_tiled_order = global.temporal_enabled || global.tile_dimensions_type != TileDimensions::None;
        let surface = if use_tiled_order {
            entropy::decode_residuals_tiled(width, height, entropy_enabled, rle_only, &mut r, global.transform_block_size)
        } else {
            entropy::decode_residuals(width, height, entropy_enabled, rle_only, &mut r)
        };
        LayerSurface::Residuals(surface)
    } else {
        LayerSurface::Temporal(entropy::decode_temporal(
            width,
            height,
            entropy_enabled,
            rle_only,
            &mut r,
            global.transform_block_size,
            global.temporal_tile_intra_signalling_enabled,
        ))
    }
}

enum LayerSurface {
    Residuals(Surface<i16>),
    Temporal(Surface<u8>),
}

fn parse_encoded_data(r: &mut BitReader, configuration: &SignaledConfiguration) -> Result<FrameSymbols> {
    let global = &configuration.global;
    let num_layers = global.num_residual_layers;
    let num_planes = global.num_processed_planes;

    // Flags, mirroring the emit order.
    let mut entropy_enabled = vec![[[false; 17]; MAX_NUM_LOQS]; num_planes];
    let mut rle_only = vec![[[false; 17]; MAX_NUM_LOQS]; num_planes];
    for plane in 0..num_planes {
        if configuration.picture.enhancement_enabled {
            for loq in 0..MAX_NUM_LOQS {
                for layer in 0..num_layers {
                    entropy_enabled[plane][loq][layer] = r.read_bit();
                    rle_only[plane][loq][layer] = r.read_bit();
                }
            }
        }
        if temporal_layer_present(configuration, LOQ_LEVEL_2) {
            entropy_enabled[plane][LOQ_LEVEL_2][num_layers] = r.read_bit();
            rle_only[plane][LOQ_LEVEL_2][num_layers] = r.read_bit();
        }
    }
    r.byte_align();

    let mut symbols = FrameSymbols::default();
    for plane in 0..num_planes {
        let mut plane_symbols = PlaneSymbols::default();
        for loq in 0..MAX_NUM_LOQS {
            let (width, height) = layer_dimensions(configuration, plane, loq);
            let n = num_layers + usize::from(temporal_layer_present(configuration, loq));
            for layer in 0..n {
                let data: &[u8] = if entropy_enabled[plane][loq][layer] {
                    let size = read_multibyte(r) as usize;
                    if size > r.remaining_bytes() {
                        return Err(err(format!("layer of {size} bytes overruns the block")));
                    }
                    r.read_bytes(size)
                } else {
                    &[]
                };
                match decode_layer_chunk(
                    configuration,
                    width,
                    height,
                    layer,
                    entropy_enabled[plane][loq][layer],
                    rle_only[plane][loq][layer],
                    data,
                ) {
                    LayerSurface::Residuals(s) => plane_symbols.residuals[loq].push(s),
                    LayerSurface::Temporal(s) => plane_symbols.temporal = Some(s),
                }
            }
        }
        symbols.planes.push(plane_symbols);
    }

    Ok(symbols)
}

fn parse_encoded_data_tiled(r: &mut BitReader, configuration: &SignaledConfiguration) -> Result<FrameSymbols> {
    let global = &configuration.global;
    let num_planes = global.num_processed_planes;
    let dims = Dimensions::new(configuration, global.resolution_width, global.resolution_height);

    // Layer walk shared by every pass below.
    let mut grids = Vec::new();
    let mut layer_tiles = Vec::new();
    for plane in 0..num_planes {
        for loq in 0..MAX_NUM_LOQS {
            let grid = TileGrid::new(configuration, &dims, plane, loq);
            for layer in first_layer(configuration)..total_layers(configuration, loq) {
                layer_tiles.push((plane, loq, layer, grids.len()));
            }
            grids.push(grid);
        }
    }

    let mut rle_only = Vec::new();
    for _ in 0..layer_tiles.len() {
        rle_only.push(r.read_bit());
    }
    r.byte_align();

    let total_tiles: usize = layer_tiles.iter().map(|&(_, _, _, g)| grids[g].num_tiles()).sum();
    let entropy_enabled: Vec<bool> = if !global.compression_type_entropy_enabled_per_tile {
        (0..total_tiles).map(|_| r.read_bit()).collect()
    } else {
        let flags = entropy::decode_flags(total_tiles as u32, 1, r, true);
        let v = (0..total_tiles as u32).map(|x| flags.get(x, 0) != 0).collect();
        r.byte_align();
        v
    };
    r.byte_align();

    // Tile payloads.
    let mut tile_data: Vec<Option<(Bytes, bool)>> = vec![None; total_tiles];
    if global.compression_type_size_per_tile == CompressionType::None {
        let mut idx = 0usize;
        for (i, &(_, _, _, g)) in layer_tiles.iter().enumerate() {
            for _ in 0..grids[g].num_tiles() {
                if entropy_enabled[idx] {
                    let size = read_multibyte(r) as usize;
                    if size > r.remaining_bytes() {
                        return Err(err("tile overruns the block"));
                    }
                    tile_data[idx] = Some((Bytes::copy_from_slice(r.read_bytes(size)), rle_only[i]));
                }
                idx += 1;
            }
        }
    } else {
        let mut idx = 0usize;
        for (i, &(_, _, _, g)) in layer_tiles.iter().enumerate() {
            let num_tiles = grids[g].num_tiles();
            let any_enabled = (0..num_tiles).any(|t| entropy_enabled[idx + t]);
            if any_enabled {
                let sizes = entropy::decode_sizes(
                    num_tiles as u32,
                    1,
                    r,
                    false,
                    &entropy_enabled,
                    idx,
                    global.compression_type_size_per_tile,
                );
                r.byte_align();
                for t in 0..num_tiles {
                    if entropy_enabled[idx + t] {
                        let size = sizes.get(t as u32, 0) as usize;
                        if size > r.remaining_bytes() {
                            return Err(err("tile overruns the block"));
                        }
                        tile_data[idx + t] = Some((Bytes::copy_from_slice(r.read_bytes(size)), rle_only[i]));
                    }
                }
            }
            idx += num_tiles;
        }
    }

    // Stitch tiles into full layer surfaces.
    let mut symbols = FrameSymbols {
        planes: vec![PlaneSymbols::default(); num_planes],
    };
    for plane in 0..num_planes {
        for loq in 0..MAX_NUM_LOQS {
            let (width, height) = layer_dimensions(configuration, plane, loq);
            for _ in 0..global.num_residual_layers {
                symbols.planes[plane].residuals[loq].push(Surface::blank(width, height));
            }
        }
    }

    let mut idx = 0usize;
    for &(plane, loq, layer, g) in &layer_tiles {
        let grid = &grids[g];
        let (width, height) = layer_dimensions(configuration, plane, loq);

        let mut residual_builder = SurfaceBuilder::<i16>::new(width, height);
        let mut temporal_builder = SurfaceBuilder::<u8>::new(width, height);
        if layer >= global.num_residual_layers {
            for y in 0..height {
                for x in 0..width {
                    temporal_builder.write(x, y, crate::temporal::TEMPORAL_PRED);
                }
            }
        }

        for t in 0..grid.num_tiles() {
            let (x0, y0, x1, y1) = grid.rect(t);
            let (data, tile_rle) = match &tile_data[idx + t] {
                Some((data, rle)) => (data.as_ref(), *rle),
                None => (&[][..], false),
            };
            match decode_layer_chunk(
                configuration,
                x1 - x0,
                y1 - y0,
                layer,
                tile_data[idx + t].is_some(),
                tile_rle,
                data,
            ) {
                LayerSurface::Residuals(s) => residual_builder.blit(x0, y0, &s),
                LayerSurface::Temporal(s) => temporal_builder.blit(x0, y0, &s),
            }
        }

        if layer < global.num_residual_layers {
            symbols.planes[plane].residuals[loq][layer] = residual_builder.finish();
        } else {
            symbols.planes[plane].temporal = Some(temporal_builder.finish());
        }
        idx += grid.num_tiles();
    }

    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignaledConfiguration;
    use crate::temporal::{TEMPORAL_INTR, TEMPORAL_PRED};

    fn test_configuration() -> SignaledConfiguration {
        let mut c = SignaledConfiguration::default();
        c.global.resolution_width = 96;
        c.global.resolution_height = 64;
        c.global.colourspace = Colourspace::Y;
        c.global.num_processed_planes = 1;
        c.picture.step_width_loq[LOQ_LEVEL_2] = 2250;
        c.picture.step_width_loq[LOQ_LEVEL_1] = 3600;
        c
    }

    fn frame_symbols(configuration: &SignaledConfiguration, with_temporal: bool) -> FrameSymbols {
        let dims = Dimensions::new(configuration, configuration.global.resolution_width, configuration.global.resolution_height);
        let block = configuration.global.transform_block_size;
        let mut plane = PlaneSymbols::default();
        for loq in 0..MAX_NUM_LOQS {
            let w = dims.plane_width(0, loq) / block;
            let h = dims.plane_height(0, loq) / block;
            for layer in 0..configuration.global.num_residual_layers {
                plane.residuals[loq].push(Surface::generate(w, h, |x, y| {
                    match (x + y + layer as u32) % 5 {
                        0 => 0,
                        1 => 2,
                        2 => -2,
                        3 => 45,
                        _ => -45,
                    }
                }));
            }
        }
        if with_temporal {
            let w = dims.plane_width(0, LOQ_LEVEL_2) / block;
            let h = dims.plane_height(0, LOQ_LEVEL_2) / block;
            plane.temporal = Some(Surface::generate(w, h, |x, y| {
                if (x / 8 + y / 8) % 2 == 0 {
                    TEMPORAL_INTR
                } else {
                    TEMPORAL_PRED
                }
            }));
        }
        FrameSymbols { planes: vec![plane] }
    }

    fn round_trip(
        configuration: &SignaledConfiguration,
        mask: u32,
        symbols: &FrameSymbols,
    ) -> (SignaledConfiguration, DeserializedPicture) {
        let dims = Dimensions::new(configuration, configuration.global.resolution_width, configuration.global.resolution_height);
        let payload = serialize(configuration, &dims, mask, symbols).unwrap();
        let mut parsed_config = SignaledConfiguration::default();
        let picture = deserialize(&payload, &mut parsed_config).unwrap();
        (parsed_config, picture)
    }

    #[test]
    fn idr_block_order_starts_with_sequence_global_picture() {
        let mut config = test_configuration();
        config.picture.temporal_refresh = true;
        let symbols = frame_symbols(&config, false);
        let (_, picture) = round_trip(
            &config,
            blocks::SEQUENCE | blocks::GLOBAL | blocks::PICTURE | blocks::ENCODED_DATA,
            &symbols,
        );
        assert_eq!(
            picture.blocks,
            vec![
                PayloadType::Sequence,
                PayloadType::Global,
                PayloadType::Picture,
                PayloadType::EncodedData
            ]
        );
    }

    #[test]
    fn non_idr_payload_starts_with_picture() {
        let mut config = test_configuration();
        config.picture.temporal_refresh = true;
        let symbols = frame_symbols(&config, false);
        // Global state must already be known on the parse side.
        let dims = Dimensions::new(&config, 96, 64);
        let payload = serialize(&config, &dims, blocks::PICTURE | blocks::ENCODED_DATA, &symbols).unwrap();
        let mut parse_config = config.clone();
        let picture = deserialize(&payload, &mut parse_config).unwrap();
        assert_eq!(picture.blocks[0], PayloadType::Picture);
    }

    #[test]
    fn sequence_and_global_round_trip() {
        let mut config = test_configuration();
        config.sequence.level_idc = 4;
        config.sequence.conformance_window = true;
        config.sequence.conf_win_right_offset = 3;
        config.sequence.conf_win_bottom_offset = 250;
        config.global.temporal_step_width_modifier = 100;
        config.global.chroma_step_width_multiplier = 80;
        config.global.upsample = Upsample::AdaptiveCubic;
        config.global.upsampling_coefficients = [1752, 14672, 4049, 585];
        config.global.level_1_filtering_first_coefficient = 3;
        config.global.level_1_filtering_second_coefficient = 9;

        let symbols = frame_symbols(&config, false);
        let (parsed, _) = round_trip(&config, blocks::SEQUENCE | blocks::GLOBAL, &symbols);
        assert_eq!(parsed.sequence, config.sequence);
        assert_eq!(parsed.global, config.global);
    }

    #[test]
    fn level_escape_carries_extended_fields() {
        let mut config = test_configuration();
        config.sequence.level_idc = 15;
        config.sequence.extended_profile_idc = 5;
        config.sequence.extended_level_idc = 9;
        config.sequence.conformance_window = true;
        config.sequence.conf_win_bottom_offset = 7;
        let (parsed, _) = round_trip(&config, blocks::SEQUENCE, &FrameSymbols::default());
        assert_eq!(parsed.sequence, config.sequence);
    }

    #[test]
    fn custom_resolution_uses_escape_code() {
        let mut config = test_configuration();
        config.global.resolution_width = 123;
        config.global.resolution_height = 77;
        let symbols = frame_symbols(&config, false);
        let (parsed, _) = round_trip(&config, blocks::GLOBAL, &symbols);
        assert_eq!(parsed.global.resolution_width, 123);
        assert_eq!(parsed.global.resolution_height, 77);
    }

    #[test]
    fn preset_resolution_uses_the_table() {
        let mut config = test_configuration();
        config.global.resolution_width = 1920;
        config.global.resolution_height = 1080;
        let symbols = frame_symbols(&config, false);

        let dims = Dimensions::new(&config, 1920, 1080);
        let payload = serialize(&config, &dims, blocks::GLOBAL, &FrameSymbols::default()).unwrap();
        // Resolution 1920x1080 is entry 26; no trailing custom fields, so
        // the global block is shorter than the custom-resolution form.
        let mut custom = config.clone();
        custom.global.resolution_width = 1921;
        let payload_custom = serialize(&custom, &dims, blocks::GLOBAL, &symbols).unwrap();
        assert!(payload.len() < payload_custom.len());

        let mut parsed = SignaledConfiguration::default();
        deserialize(&payload, &mut parsed).unwrap();
        assert_eq!(parsed.global.resolution_width, 1920);
        assert_eq!(parsed.global.resolution_height, 1080);
    }

    #[test]
    fn picture_configuration_round_trips() {
        let mut config = test_configuration();
        config.picture.quant_matrix_mode = QuantMatrixMode::DifferentAndCustom;
        for l in 0..16 {
            config.picture.qm_coefficient_1[l] = (l * 3) as u8;
            config.picture.qm_coefficient_2[l] = (l * 5 + 1) as u8;
        }
        config.picture.dequant_offset_signalled = true;
        config.picture.dequant_offset_mode = DequantOffset::ConstOffset;
        config.picture.dequant_offset = 100;
        config.picture.dithering_control = true;
        config.picture.dithering_type = DitheringType::Uniform;
        config.picture.dithering_strength = 12;

        let symbols = frame_symbols(&config, false);
        let (parsed, _) = round_trip(&config, blocks::GLOBAL | blocks::PICTURE, &symbols);
        assert_eq!(parsed.picture.quant_matrix_mode, config.picture.quant_matrix_mode);
        assert_eq!(parsed.picture.qm_coefficient_1, config.picture.qm_coefficient_1);
        assert_eq!(parsed.picture.qm_coefficient_2, config.picture.qm_coefficient_2);
        assert_eq!(parsed.picture.dequant_offset, 100);
        assert_eq!(parsed.picture.dequant_offset_mode, DequantOffset::ConstOffset);
        assert_eq!(parsed.picture.step_width_loq, config.picture.step_width_loq);
        assert_eq!(parsed.picture.dithering_strength, 12);
    }

    #[test]
    fn no_enhancement_picture_round_trips() {
        let mut config = test_configuration();
        config.picture.enhancement_enabled = false;
        config.picture.temporal_refresh = true;
        config.picture.temporal_signalling_present = false;
        let symbols = FrameSymbols {
            planes: vec![PlaneSymbols::default()],
        };
        let (parsed, _) = round_trip(&config, blocks::GLOBAL | blocks::PICTURE, &symbols);
        assert!(!parsed.picture.enhancement_enabled);
        assert!(parsed.picture.temporal_refresh);
        assert!(!parsed.picture.temporal_signalling_present);
    }

    #[test]
    fn encoded_data_round_trips_symbols() {
        let mut config = test_configuration();
        config.picture.temporal_refresh = false;
        config.picture.temporal_signalling_present = true;
        let symbols = frame_symbols(&config, true);
        let (parsed, picture) = round_trip(
            &config,
            blocks::SEQUENCE | blocks::GLOBAL | blocks::PICTURE | blocks::ENCODED_DATA,
            &symbols,
        );
        assert!(parsed.picture.temporal_signalling_present);

        let decoded = picture.symbols.expect("symbol surfaces");
        for loq in 0..MAX_NUM_LOQS {
            for layer in 0..16 {
                assert_eq!(
                    decoded.planes[0].residuals[loq][layer].checksum(),
                    symbols.planes[0].residuals[loq][layer].checksum(),
                    "loq {loq} layer {layer}"
                );
            }
        }
        let mask = decoded.planes[0].temporal.as_ref().expect("temporal mask");
        assert_eq!(mask.checksum(), symbols.planes[0].temporal.as_ref().unwrap().checksum());
    }

    #[test]
    fn tiled_encoded_data_round_trips() {
        for (per_tile_flags, size_compression) in [
            (false, CompressionType::None),
            (true, CompressionType::Prefix),
            (true, CompressionType::PrefixOnDiff),
        ] {
            let mut config = test_configuration();
            config.global.resolution_width = 256;
            config.global.resolution_height = 128;
            config.global.tile_width = 64;
            config.global.tile_height = 64;
            config.global.resolve_tile_dimensions();
            config.global.compression_type_entropy_enabled_per_tile = per_tile_flags;
            config.global.compression_type_size_per_tile = size_compression;
            config.picture.temporal_signalling_present = true;

            let symbols = frame_symbols(&config, true);
            let (_, picture) = round_trip(
                &config,
                blocks::SEQUENCE | blocks::GLOBAL | blocks::PICTURE | blocks::ENCODED_DATA_TILED,
                &symbols,
            );

            let decoded = picture.symbols.expect("symbol surfaces");
            for loq in 0..MAX_NUM_LOQS {
                for layer in 0..16 {
                    assert_eq!(
                        decoded.planes[0].residuals[loq][layer].checksum(),
                        symbols.planes[0].residuals[loq][layer].checksum(),
                        "flags {per_tile_flags} sizes {size_compression:?} loq {loq} layer {layer}"
                    );
                }
            }
            let mask = decoded.planes[0].temporal.as_ref().expect("temporal mask");
            assert_eq!(mask.checksum(), symbols.planes[0].temporal.as_ref().unwrap().checksum());
        }
    }

    #[test]
    fn additional_info_and_filler_blocks_parse() {
        let mut config = test_configuration();
        config.additional_info.additional_info_type = 0;
        config.additional_info.payload_type = 4;
        let symbols = FrameSymbols::default();
        let (parsed, picture) = round_trip(&config, blocks::ADDITIONAL_INFO | blocks::FILLER, &symbols);
        assert!(picture.has_block(PayloadType::AdditionalInfo));
        assert!(picture.has_block(PayloadType::Filler));
        assert_eq!(parsed.additional_info.payload_type, 4);
    }

    #[test]
    fn truncated_block_is_an_error() {
        let config = test_configuration();
        let dims = Dimensions::new(&config, 96, 64);
        let payload = serialize(&config, &dims, blocks::GLOBAL, &FrameSymbols::default()).unwrap();
        let mut parsed = SignaledConfiguration::default();
        assert!(deserialize(&payload[..payload.len() - 1], &mut parsed).is_err());
    }

    #[test]
    fn resolution_table_has_exactly_51_presets() {
        assert_eq!(RESOLUTION_TABLE.len(), 51);
        assert_eq!(RESOLUTION_TABLE[26], (1920, 1080));
        assert_eq!(RESOLUTION_TABLE[40], (3840, 2160));
        assert_eq!(RESOLUTION_TABLE[50], (7680, 4800));
    }
}
