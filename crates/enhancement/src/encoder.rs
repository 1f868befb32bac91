//! Per-frame encode driver.
//!
//! Downsampled sources and the base reconstruction come in; the
//! serialized enhancement payload and the full reconstruction (the
//! decoder's exact output, used for temporal feedback and reporting) come
//! out.

use bytes::Bytes;

use crate::config::{BaseFrameType, ScalingMode, SignaledConfiguration, TemporalSwm, TileDimensions, UserDataMode};
use crate::decoder::{pass_step_widths, plane_step_width};
use crate::dimensions::Dimensions;
use crate::dither::Dither;
use crate::image::{Image, ImageDescription, Plane};
use crate::surface::Surface;
use crate::syntax::{self, blocks, FrameSymbols, PlaneSymbols};
use crate::temporal::{self, UserDataSource};
use crate::transform::{self, TransformKind};
use crate::{
    compose, convert, deblock, downsample, quantize, upsample, Error, Result, LOQ_LEVEL_1, LOQ_LEVEL_2,
    MAX_NUM_LAYERS, MAX_NUM_LOQS, MAX_NUM_PLANES, MAX_STEP_WIDTH, MIN_STEP_WIDTH,
};

/// Encoder-only knobs, never signalled in the bitstream.
#[derive(Debug, Clone)]
pub struct EncoderConfiguration {
    /// LoQ-2 step width scale (in 1/1000 units) applied on intra frames
    /// of temporal streams; 1000 disables it.
    pub temporal_cq_sw_multiplier: u32,
    /// Payload generator for embedded user data.
    pub user_data_method: crate::config::UserDataMethod,
    /// Per-block SAD above which coefficients may be culled; 0 disables.
    pub sad_threshold: u32,
    /// Magnitude scale for the SAD-guided coefficient cull; 0 disables.
    pub sad_coeff_threshold: u32,
    /// Reduced dead-zone numerator (of 5) for static content; 5 disables.
    pub quant_reduced_deadzone: u32,
    /// Carry a temporal layer even on no-enhancement pictures.
    pub no_enhancement_temporal_layer: bool,
    /// Downsampling kernel for the source pyramid.
    pub downsample: crate::config::Downsample,
}

impl Default for EncoderConfiguration {
    fn default() -> Self {
        Self {
            temporal_cq_sw_multiplier: 1000,
            user_data_method: crate::config::UserDataMethod::Zeros,
            sad_threshold: 0,
            sad_coeff_threshold: 0,
            quant_reduced_deadzone: 5,
            no_enhancement_temporal_layer: false,
            downsample: crate::config::Downsample::Lanczos,
        }
    }
}

/// One encoded picture.
#[derive(Debug)]
pub struct EncodedFrame {
    /// The serialized enhancement payload.
    pub payload: Bytes,
    /// The reconstruction a conforming decoder will produce.
    pub reconstruction: Image,
    /// Whether the enhancement must travel in an IDR unit.
    pub is_idr: bool,
}

/// Enhancement layer encoder with persistent temporal state.
pub struct Encoder {
    configuration: SignaledConfiguration,
    encoder_configuration: EncoderConfiguration,
    dimensions: Dimensions,
    quant_matrix: [[[i32; MAX_NUM_LAYERS]; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    previous_residuals: Vec<Option<Surface<i16>>>,
    dither_seed: u32,
    user_data_seed: u32,
}

impl Encoder {
    /// Prepares an encoder for `source_width` x `source_height` content.
    /// The conformant (aligned) size and the conformance window are
    /// derived here and fixed for the stream.
    pub fn new(
        mut configuration: SignaledConfiguration,
        encoder_configuration: EncoderConfiguration,
        source_width: u32,
        source_height: u32,
    ) -> Result<Self> {
        if !(1..=MAX_STEP_WIDTH).contains(&configuration.picture.step_width_loq[LOQ_LEVEL_2])
            || !(1..=MAX_STEP_WIDTH).contains(&configuration.picture.step_width_loq[LOQ_LEVEL_1])
        {
            return Err(Error::Configuration("step width out of range".into()));
        }
        if configuration.global.num_processed_planes != 1
            && configuration.global.num_processed_planes != configuration.global.colourspace.num_planes()
        {
            return Err(Error::Configuration(format!(
                "{} processed planes of {}",
                configuration.global.num_processed_planes,
                configuration.global.colourspace.num_planes()
            )));
        }

        configuration.picture.step_width_loq_orig = configuration.picture.step_width_loq;

        let dimensions = Dimensions::new(&configuration, source_width, source_height);
        configuration.global.resolution_width = dimensions.conformant_width();
        configuration.global.resolution_height = dimensions.conformant_height();

        let pad_right = dimensions.conformant_width() - source_width;
        let pad_bottom = dimensions.conformant_height() - source_height;
        if pad_right != 0 || pad_bottom != 0 {
            configuration.sequence.conformance_window = true;
            configuration.sequence.conf_win_left_offset = 0;
            configuration.sequence.conf_win_top_offset = 0;
            configuration.sequence.conf_win_right_offset = pad_right / dimensions.crop_unit_width(0);
            configuration.sequence.conf_win_bottom_offset = pad_bottom / dimensions.crop_unit_height(0);
        }

        Ok(Self {
            configuration,
            encoder_configuration,
            dimensions,
            quant_matrix: [[[-1; MAX_NUM_LAYERS]; MAX_NUM_LOQS]; MAX_NUM_PLANES],
            previous_residuals: vec![None; MAX_NUM_PLANES],
            dither_seed: 1,
            user_data_seed: UserDataSource::FIXED_SEED,
        })
    }

    /// The signalled configuration.
    pub fn configuration(&self) -> &SignaledConfiguration {
        &self.configuration
    }

    /// Full resolution (conformant) image description.
    pub fn conformant_description(&self) -> ImageDescription {
        ImageDescription::new(
            self.configuration.global.colourspace,
            self.dimensions.conformant_width(),
            self.dimensions.conformant_height(),
            self.configuration.global.enhancement_depth,
        )
    }

    /// Intermediate picture description (after one downsampling step).
    pub fn intermediate_description(&self) -> ImageDescription {
        ImageDescription::new(
            self.configuration.global.colourspace,
            self.dimensions.plane_width(0, LOQ_LEVEL_1),
            self.dimensions.plane_height(0, LOQ_LEVEL_1),
            self.configuration.global.enhancement_depth,
        )
    }

    /// Base picture description handed to the external base codec.
    pub fn base_description(&self) -> ImageDescription {
        ImageDescription::new(
            self.configuration.global.colourspace,
            self.dimensions.base_width(0),
            self.dimensions.base_height(0),
            self.configuration.global.base_depth,
        )
    }

    /// Pads a source image to the conformant size by edge replication.
    pub fn expand_image(&self, image: &Image) -> Image {
        let description = self.conformant_description();
        let planes = image
            .planes()
            .iter()
            .enumerate()
            .map(|(p, plane)| {
                let w = description.plane_width(p);
                let h = description.plane_height(p);
                match plane {
                    Plane::U8(s) => {
                        Plane::U8(Surface::generate(w, h, |x, y| s.get_clamped(i64::from(x), i64::from(y))))
                    }
                    Plane::U16(s) => {
                        Plane::U16(Surface::generate(w, h, |x, y| s.get_clamped(i64::from(x), i64::from(y))))
                    }
                }
            })
            .collect();
        Image::new(planes, description, image.timestamp())
    }

    /// Applies one downsampling step (the scaling mode of `loq`).
    pub fn downsample_image(&self, image: &Image, loq: usize) -> Image {
        let mode = self.configuration.global.scaling_mode[loq];
        let src_description = *image.description();
        let description = ImageDescription::new(
            src_description.colourspace,
            match mode {
                ScalingMode::None => src_description.width,
                _ => src_description.width / 2,
            },
            match mode {
                ScalingMode::TwoD => src_description.height / 2,
                _ => src_description.height,
            },
            src_description.bit_depth,
        );

        let planes = image
            .planes()
            .iter()
            .map(|plane| {
                let internal = convert::to_internal(plane, src_description.bit_depth);
                let down = match mode {
                    ScalingMode::None => internal,
                    ScalingMode::OneD => downsample::downsample_1d(&internal, self.encoder_configuration.downsample),
                    ScalingMode::TwoD => downsample::downsample_2d(&internal, self.encoder_configuration.downsample),
                };
                convert::from_internal(&down, src_description.bit_depth)
            })
            .collect();
        Image::new(planes, description, image.timestamp())
    }

    fn upsample_plane(&self, src: &Surface<i16>, loq: usize) -> Surface<i16> {
        let global = &self.configuration.global;
        match global.scaling_mode[loq] {
            ScalingMode::None => src.clone(),
            ScalingMode::OneD => {
                let up = upsample::upsample_1d(src, global.upsample, &global.upsampling_coefficients);
                if global.predicted_residual_enabled {
                    upsample::predicted_residual_adjust_1d(src, &up, &upsample::predicted_average_1d(&up))
                } else {
                    up
                }
            }
            ScalingMode::TwoD => {
                let up = upsample::upsample_2d(src, global.upsample, &global.upsampling_coefficients);
                if global.predicted_residual_enabled {
                    upsample::predicted_residual_adjust_2d(src, &up, &upsample::predicted_average_2d(&up))
                } else {
                    up
                }
            }
        }
    }

    fn is_user_data_layer(&self, loq: usize, layer: usize) -> bool {
        let global = &self.configuration.global;
        loq == LOQ_LEVEL_1
            && global.user_data_enabled != UserDataMode::None
            && layer == if global.transform_block_size == 4 { 5 } else { 1 }
    }

    /// Culls small coefficients inside fast-moving blocks; their energy
    /// is masked and the bits are better spent elsewhere.
    fn static_cull(&self, coefficients: &mut [Surface<i16>], pixel_sad: &Surface<i16>) {
        let cfg = &self.encoder_configuration;
        if cfg.sad_threshold == 0 || cfg.sad_coeff_threshold == 0 {
            return;
        }
        let magnitude =
            (cfg.sad_coeff_threshold as i32 * (self.configuration.picture.step_width_loq[LOQ_LEVEL_2] >> 8)).max(1);
        let threshold = cfg.sad_threshold as i32;

        for layer in coefficients.iter_mut() {
            let src = layer.clone();
            *layer = Surface::generate(src.width(), src.height(), |x, y| {
                let c = src.get(x, y);
                if i32::from(pixel_sad.get(x, y)) > threshold && i32::from(c).abs() <= magnitude {
                    0
                } else {
                    c
                }
            });
        }
    }

    /// Transforms and quantizes one plane of residuals into symbols.
    fn encode_residuals(
        &mut self,
        plane: usize,
        loq: usize,
        residuals: &Surface<i16>,
        swm: TemporalSwm,
        temporal_mask: Option<&Surface<u8>>,
        pixel_sad: Option<&Surface<i16>>,
    ) -> Vec<Surface<i16>> {
        let block_size = self.configuration.global.transform_block_size;
        let user_data_mode = self.configuration.global.user_data_enabled;
        let horizontal_only = self.configuration.global.scaling_mode[loq] == ScalingMode::OneD;
        let kind = TransformKind::select(block_size, horizontal_only);

        let mut coefficients = transform::forward(kind, residuals, |_| true);
        if let Some(sad) = pixel_sad {
            self.static_cull(&mut coefficients, sad);
        }

        let (step_widths, passes) = pass_step_widths(&self.configuration, plane, loq, swm);
        let threshold = self.encoder_configuration.quant_reduced_deadzone;

        let mut symbols = Vec::with_capacity(coefficients.len());
        for (layer, coeffs) in coefficients.iter().enumerate() {
            let qm = self.quant_matrix[plane][loq][layer];
            let mut dirq = [0i32; 2];
            let mut deadzone = [0i32; 2];
            for pass in 0..passes {
                dirq[pass] = quantize::dirq_step_width(step_widths[pass], qm);
                deadzone[pass] = quantize::layer_deadzone(step_widths[pass], dirq[pass]);
            }

            let syms = if passes == 1 {
                quantize::quantize(coeffs, dirq[0], deadzone[0], pixel_sad, block_size, threshold)
            } else {
                quantize::quantize_swm(
                    coeffs,
                    block_size,
                    dirq,
                    deadzone,
                    temporal_mask.expect("dependent quantization needs a mask"),
                    pixel_sad,
                    threshold,
                )
            };

            if self.is_user_data_layer(loq, layer) {
                let mut source = UserDataSource::new(self.encoder_configuration.user_data_method, self.user_data_seed);
                self.user_data_seed = self.user_data_seed.wrapping_add(1);
                symbols.push(temporal::user_data_insert(&syms, user_data_mode, &mut source));
            } else {
                symbols.push(syms);
            }
        }
        symbols
    }

    /// Dequantizes and inverse transforms symbols, the decoder's view of
    /// this plane.
    fn decode_residuals(
        &self,
        plane: usize,
        loq: usize,
        symbols: &[Surface<i16>],
        swm: TemporalSwm,
        temporal_mask: Option<&Surface<u8>>,
    ) -> Surface<i16> {
        let picture = &self.configuration.picture;
        let global = &self.configuration.global;
        let (step_widths, passes) = pass_step_widths(&self.configuration, plane, loq, swm);

        let mut coefficients = Vec::with_capacity(global.num_residual_layers);
        for layer in 0..global.num_residual_layers {
            let qm = self.quant_matrix[plane][loq][layer];

            let syms = if self.is_user_data_layer(loq, layer) {
                temporal::user_data_clear(&symbols[layer], global.user_data_enabled)
            } else {
                symbols[layer].clone()
            };

            if passes == 1 {
                let lq = quantize::layer_quant(picture, step_widths[0], qm);
                coefficients.push(quantize::dequantize(&syms, lq.invq, lq.applied_offset));
            } else {
                let lq = [
                    quantize::layer_quant(picture, step_widths[0], qm),
                    quantize::layer_quant(picture, step_widths[1], qm),
                ];
                coefficients.push(quantize::dequantize_swm(
                    &syms,
                    [lq[0].invq, lq[1].invq],
                    [lq[0].applied_offset, lq[1].applied_offset],
                    temporal_mask.expect("dependent dequantization needs a mask"),
                ));
            }
        }

        let kind = TransformKind::select(global.transform_block_size, global.scaling_mode[loq] == ScalingMode::OneD);
        transform::inverse(
            kind,
            self.dimensions.plane_width(plane, loq),
            self.dimensions.plane_height(plane, loq),
            &coefficients,
        )
    }

    fn resolve_quant_matrices(&mut self, plane: usize, is_idr: bool) {
        let picture = &self.configuration.picture;
        let global = &self.configuration.global;
        for loq in 0..MAX_NUM_LOQS {
            let horizontal_only = global.scaling_mode[loq] == ScalingMode::OneD;
            for layer in 0..global.num_residual_layers {
                self.quant_matrix[plane][loq][layer] = quantize::resolve_quant_matrix(
                    picture,
                    global.num_residual_layers,
                    horizontal_only,
                    loq,
                    layer,
                    is_idr,
                    self.quant_matrix[plane][loq][layer],
                );
            }
        }
    }

    fn loq2_lambda(&self, plane: usize) -> i32 {
        let sw = plane_step_width(
            self.configuration.picture.step_width_loq[LOQ_LEVEL_2],
            plane,
            LOQ_LEVEL_2,
            self.configuration.global.chroma_step_width_multiplier,
        );
        let qm = self.quant_matrix[plane][LOQ_LEVEL_2][0];
        let dirq = quantize::dirq_step_width(sw, qm);
        let offset = quantize::invq_offset(&self.configuration.picture, sw, dirq);
        quantize::invq_step_width(&self.configuration.picture, dirq, offset)
    }

    /// Encodes one picture. `next_source` (the following frame, if known)
    /// feeds the SAD-guided quantization heuristics.
    pub fn encode_frame(
        &mut self,
        source: &Image,
        next_source: Option<&Image>,
        intermediate_source: &Image,
        base_reconstruction: &Image,
        frame_type: BaseFrameType,
    ) -> Result<EncodedFrame> {
        let is_idr = frame_type.is_intra();
        let global = self.configuration.global.clone();
        let cfg = self.encoder_configuration.clone();

        // Does this picture carry residual layers at all?
        let picture = &mut self.configuration.picture;
        let orig = picture.step_width_loq_orig;
        picture.enhancement_enabled = if orig[LOQ_LEVEL_1] >= MAX_STEP_WIDTH && orig[LOQ_LEVEL_2] >= MAX_STEP_WIDTH {
            global.temporal_enabled && is_idr && cfg.temporal_cq_sw_multiplier != 1000
        } else {
            true
        };

        // Whole-frame temporal decision; planes follow it together.
        let use_temporal = global.temporal_enabled && !is_idr && self.previous_residuals[0].is_some();
        picture.temporal_refresh = !use_temporal;
        picture.temporal_signalling_present = use_temporal;

        // Intra pictures of temporal streams quantize LoQ-2 coarser; the
        // buffer they seed is refined by the following inter pictures.
        picture.step_width_loq[LOQ_LEVEL_2] = if is_idr && global.temporal_enabled {
            (orig[LOQ_LEVEL_2] * cfg.temporal_cq_sw_multiplier as i32 / 1000).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
        } else {
            orig[LOQ_LEVEL_2]
        };
        picture.step_width_loq[LOQ_LEVEL_1] = orig[LOQ_LEVEL_1];

        if is_idr {
            self.previous_residuals = vec![None; MAX_NUM_PLANES];
        }

        let enhancement_enabled = self.configuration.picture.enhancement_enabled;
        let num_image_planes = source.description().num_planes();
        let mut frame_symbols = FrameSymbols::default();
        let mut out_planes: Vec<Plane> = Vec::with_capacity(num_image_planes);

        for plane in 0..num_image_planes {
            let processed = plane < global.num_processed_planes;
            let enhancement = enhancement_enabled && processed;
            let mut plane_symbols = PlaneSymbols::default();

            //// Base reconstruction in internal form
            let (base_plane, base_depth);
            if global.enhancement_depth > global.base_depth && global.level1_depth_flag {
                base_plane =
                    convert::bit_shift(base_reconstruction.plane(plane), global.base_depth, global.enhancement_depth);
                base_depth = global.enhancement_depth;
            } else {
                base_plane = base_reconstruction.plane(plane).clone();
                base_depth = global.base_depth;
            }
            let base_decoded = convert::to_internal(&base_plane, base_depth);

            let src = convert::to_internal(source.plane(plane), source.description().bit_depth);
            let intermediate_src =
                convert::to_internal(intermediate_source.plane(plane), intermediate_source.description().bit_depth);

            if enhancement {
                self.resolve_quant_matrices(plane, is_idr);
            }

            //// Sub-layer 1
            let base_prediction = self.upsample_plane(&base_decoded, LOQ_LEVEL_1);

            let base_reco = if enhancement {
                let base_residuals = compose::subtract(&intermediate_src, &base_prediction);
                let symbols =
                    self.encode_residuals(plane, LOQ_LEVEL_1, &base_residuals, TemporalSwm::Disabled, None, None);
                let mut recon = self.decode_residuals(plane, LOQ_LEVEL_1, &symbols, TemporalSwm::Disabled, None);
                if self.configuration.picture.level_1_filtering_enabled && global.transform_block_size == 4 {
                    recon = deblock::level1_filter(
                        &recon,
                        global.level_1_filtering_first_coefficient,
                        global.level_1_filtering_second_coefficient,
                    );
                }
                plane_symbols.residuals[LOQ_LEVEL_1] = symbols;
                compose::add(&base_prediction, &recon)
            } else {
                base_prediction
            };

            //// Sub-layer 2
            let enhanced_prediction = self.upsample_plane(&base_reco, LOQ_LEVEL_2);
            let block = global.transform_block_size;

            let full_reco;
            if enhancement {
                let enhanced_residuals = compose::subtract(&src, &enhanced_prediction);

                // Per-block SAD against the next frame drives the static
                // content heuristics on the luma plane.
                let pixel_sad = next_source
                    .filter(|_| {
                        plane == 0
                            && ((cfg.sad_threshold != 0 && cfg.sad_coeff_threshold != 0)
                                || cfg.quant_reduced_deadzone != 5)
                    })
                    .map(|next| {
                        let next_internal = convert::to_internal(next.plane(plane), next.description().bit_depth);
                        temporal::cost_sad(&src, Some(&next_internal), block)
                    });

                if !use_temporal {
                    //// Refresh: residuals stand alone.
                    let symbols = self.encode_residuals(
                        plane,
                        LOQ_LEVEL_2,
                        &enhanced_residuals,
                        TemporalSwm::Disabled,
                        None,
                        pixel_sad.as_ref(),
                    );
                    let recon = self.decode_residuals(plane, LOQ_LEVEL_2, &symbols, TemporalSwm::Disabled, None);
                    if global.temporal_enabled {
                        self.previous_residuals[plane] = Some(recon.clone());
                    }
                    plane_symbols.residuals[LOQ_LEVEL_2] = symbols;
                    full_reco = compose::add(&enhanced_prediction, &recon);
                } else {
                    //// Temporal: trial both codings, choose per block.
                    let lambda = self.loq2_lambda(plane);
                    let previous = self.previous_residuals[plane]
                        .clone()
                        .unwrap_or_else(|| Surface::blank(src.width(), src.height()));

                    let intra_symbols = self.encode_residuals(
                        plane,
                        LOQ_LEVEL_2,
                        &enhanced_residuals,
                        TemporalSwm::Active,
                        None,
                        None,
                    );
                    let intra_recon =
                        self.decode_residuals(plane, LOQ_LEVEL_2, &intra_symbols, TemporalSwm::Active, None);
                    let intra_cost = temporal::cost(
                        &src,
                        &compose::add(&enhanced_prediction, &intra_recon),
                        &intra_symbols,
                        block,
                        lambda,
                        true,
                    );

                    let inter_residuals = compose::subtract(&enhanced_residuals, &previous);
                    let inter_symbols = self.encode_residuals(
                        plane,
                        LOQ_LEVEL_2,
                        &inter_residuals,
                        TemporalSwm::Active,
                        None,
                        None,
                    );
                    let inter_recon =
                        self.decode_residuals(plane, LOQ_LEVEL_2, &inter_symbols, TemporalSwm::Active, None);
                    let inter_cost = temporal::cost(
                        &src,
                        &compose::add(&enhanced_prediction, &compose::add(&previous, &inter_recon)),
                        &inter_symbols,
                        block,
                        lambda,
                        false,
                    );

                    let mask_per_transform = temporal::compare_le(&intra_cost, &inter_cost);
                    let mask = if global.temporal_tile_intra_signalling_enabled {
                        let tile_map = temporal::tile_map(&intra_symbols, &inter_symbols, block);
                        temporal::tile_intra_signal(&tile_map, &mask_per_transform, block)
                    } else {
                        mask_per_transform
                    };

                    // Refreshed blocks forget their accumulated history.
                    let previous = temporal::apply_map(&previous, &mask, block);
                    let residuals_input = compose::subtract(&enhanced_residuals, &previous);

                    let mut symbols = self.encode_residuals(
                        plane,
                        LOQ_LEVEL_2,
                        &residuals_input,
                        TemporalSwm::Dependent,
                        Some(&mask),
                        pixel_sad.as_ref(),
                    );

                    // The mask rides in the LSBs of the first coefficient
                    // layer and as its own entropy coded layer. The
                    // reconstruction runs on the stripped symbols, the
                    // same view the decoder recovers.
                    symbols[0] = temporal::insert_mask(&symbols[0], Some(&mask), false);
                    let mut stripped = symbols.clone();
                    stripped[0] = temporal::strip_mask(&symbols[0]);
                    let recon =
                        self.decode_residuals(plane, LOQ_LEVEL_2, &stripped, TemporalSwm::Dependent, Some(&mask));

                    let updated = compose::add(&previous, &recon);
                    self.previous_residuals[plane] = Some(updated.clone());
                    full_reco = compose::add(&enhanced_prediction, &updated);

                    plane_symbols.residuals[LOQ_LEVEL_2] = symbols;
                    plane_symbols.temporal = Some(mask);
                }
            } else if processed {
                // No residual layers for this picture.
                if !use_temporal {
                    self.previous_residuals[plane] = None;
                    full_reco = enhanced_prediction;
                } else if cfg.no_enhancement_temporal_layer {
                    let previous = self.previous_residuals[plane]
                        .clone()
                        .unwrap_or_else(|| Surface::blank(src.width(), src.height()));
                    let intra_cost = temporal::cost_sad(&src, Some(&enhanced_prediction), block);
                    let inter_recon = compose::add(&enhanced_prediction, &previous);
                    let inter_cost = temporal::cost_sad(&src, Some(&inter_recon), block);
                    let mask_per_transform = temporal::compare_le(&intra_cost, &inter_cost);

                    let mask = if global.temporal_tile_intra_signalling_enabled {
                        let tiles = Surface::filled(
                            crate::temporal::TEMPORAL_PRED,
                            (mask_per_transform.width() * block + 31) / 32,
                            (mask_per_transform.height() * block + 31) / 32,
                        );
                        temporal::tile_intra_signal(&tiles, &mask_per_transform, block)
                    } else {
                        mask_per_transform
                    };

                    let kept = temporal::apply_map(&previous, &mask, block);
                    self.previous_residuals[plane] = Some(kept.clone());
                    full_reco = compose::add(&enhanced_prediction, &kept);
                    plane_symbols.temporal = Some(mask);
                } else {
                    let previous = self.previous_residuals[plane]
                        .clone()
                        .unwrap_or_else(|| Surface::blank(src.width(), src.height()));
                    full_reco = compose::add(&enhanced_prediction, &previous);
                }
            } else {
                full_reco = enhanced_prediction;
            }

            // Dithered output, luma only.
            let outp = if self.configuration.picture.dithering_control && plane == 0 {
                let mut dither = Dither::new(
                    self.configuration.picture.dithering_type,
                    self.configuration.picture.dithering_strength,
                    global.enhancement_depth,
                    self.dither_seed,
                );
                self.dither_seed = self.dither_seed.wrapping_mul(0x0001_9660).wrapping_add(0x3c6e_f35f);
                dither.process(&full_reco)
            } else {
                full_reco
            };

            // Conformance window.
            let sequence = &self.configuration.sequence;
            let cropped = if sequence.conformance_window {
                let cw = self.dimensions.crop_unit_width(plane);
                let ch = self.dimensions.crop_unit_height(plane);
                convert::conform(
                    &outp,
                    sequence.conf_win_left_offset * cw,
                    sequence.conf_win_top_offset * ch,
                    sequence.conf_win_right_offset * cw,
                    sequence.conf_win_bottom_offset * ch,
                )
            } else {
                outp
            };
            out_planes.push(convert::from_internal(&cropped, global.enhancement_depth));

            if processed {
                frame_symbols.planes.push(plane_symbols);
            }
        }

        // Fix up the no-enhancement signalling for what actually got coded.
        if !enhancement_enabled {
            let picture = &mut self.configuration.picture;
            picture.temporal_signalling_present = use_temporal && cfg.no_enhancement_temporal_layer;
            if !use_temporal {
                picture.temporal_refresh = true;
            }
        }

        //// Serialize
        let picture = &self.configuration.picture;
        let encoded_data_present = picture.enhancement_enabled || picture.temporal_signalling_present;
        let data_block = if global.tile_dimensions_type == TileDimensions::None {
            blocks::ENCODED_DATA
        } else {
            blocks::ENCODED_DATA_TILED
        };

        let mut block_mask = if is_idr {
            blocks::SEQUENCE | blocks::GLOBAL | blocks::PICTURE
        } else {
            blocks::PICTURE
        };
        if is_idr && global.additional_info_present {
            block_mask |= blocks::ADDITIONAL_INFO;
        }
        if encoded_data_present {
            block_mask |= data_block;
        }

        let payload = syntax::serialize(&self.configuration, &self.dimensions, block_mask, &frame_symbols)?;

        let description = ImageDescription::new(
            global.colourspace,
            out_planes[0].width(),
            out_planes[0].height(),
            global.enhancement_depth,
        );
        Ok(EncodedFrame {
            payload,
            reconstruction: Image::new(out_planes, description, source.timestamp()),
            is_idr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Encoder, EncoderConfiguration};
    use crate::config::{BaseFrameType, SignaledConfiguration};
    use crate::decoder::Decoder;
    use crate::image::{Colourspace, Image, ImageDescription, Plane};
    use crate::surface::Surface;
    use crate::{LOQ_LEVEL_1, LOQ_LEVEL_2};

    fn test_source(width: u32, height: u32, frame: u32) -> Image {
        let description = ImageDescription::new(Colourspace::Y, width, height, 8);
        let plane = Plane::U8(Surface::generate(width, height, |x, y| {
            let moving = (x + frame * 2) * 5 + y * 3;
            let edge = if (x / 8 + y / 8) % 2 == 0 { 40 } else { 0 };
            ((moving % 160) + edge) as u8
        }));
        Image::new(vec![plane], description, u64::from(frame))
    }

    fn test_encoder(width: u32, height: u32) -> Encoder {
        let mut configuration = SignaledConfiguration::default();
        configuration.global.colourspace = Colourspace::Y;
        configuration.global.num_processed_planes = 1;
        configuration.picture.step_width_loq[LOQ_LEVEL_2] = 2250;
        configuration.picture.step_width_loq[LOQ_LEVEL_1] = 3600;
        Encoder::new(configuration, EncoderConfiguration::default(), width, height).unwrap()
    }

    /// The base "codec" of the tests: the downsampled source itself.
    fn encode_one(
        encoder: &mut Encoder,
        frame: u32,
        frame_type: BaseFrameType,
    ) -> (super::EncodedFrame, Image) {
        let source = encoder.expand_image(&test_source(64, 48, frame));
        let intermediate = encoder.downsample_image(&source, LOQ_LEVEL_2);
        let base = encoder.downsample_image(&intermediate, LOQ_LEVEL_1);
        let encoded = encoder.encode_frame(&source, None, &intermediate, &base, frame_type).unwrap();
        (encoded, base)
    }

    #[test]
    fn idr_payload_carries_stream_configuration() {
        let mut encoder = test_encoder(64, 48);
        let (encoded, _) = encode_one(&mut encoder, 0, BaseFrameType::Idr);
        assert!(encoded.is_idr);

        use crate::syntax::PayloadType;
        let mut config = SignaledConfiguration::default();
        let parsed = crate::syntax::deserialize(&encoded.payload, &mut config).unwrap();
        assert_eq!(
            &parsed.blocks[..3],
            &[PayloadType::Sequence, PayloadType::Global, PayloadType::Picture]
        );
        assert_eq!(config.global.resolution_width, 64);
        assert_eq!(config.global.resolution_height, 48);
    }

    #[test]
    fn inter_payload_starts_with_picture_and_has_temporal_layer() {
        let mut encoder = test_encoder(64, 48);
        let (_, _) = encode_one(&mut encoder, 0, BaseFrameType::Idr);
        let (encoded, _) = encode_one(&mut encoder, 1, BaseFrameType::Inter);
        assert!(!encoded.is_idr);

        let mut config = encoder.configuration().clone();
        let parsed = crate::syntax::deserialize(&encoded.payload, &mut config).unwrap();
        assert_eq!(parsed.blocks[0], crate::syntax::PayloadType::Picture);
        assert!(config.picture.temporal_signalling_present);
        let symbols = parsed.symbols.unwrap();
        assert!(symbols.planes[0].temporal.is_some(), "temporal mask layer expected");
    }

    #[test]
    fn decoder_reproduces_the_encoder_reconstruction() {
        let mut encoder = test_encoder(64, 48);
        let mut decoder = Decoder::new();

        for frame in 0..4 {
            let frame_type = if frame == 0 { BaseFrameType::Idr } else { BaseFrameType::Inter };
            let (encoded, base) = encode_one(&mut encoder, frame, frame_type);
            let decoded = decoder.decode_frame(Some(&encoded.payload), &base, encoded.is_idr).unwrap();

            let (Plane::U8(ours), Plane::U8(theirs)) = (encoded.reconstruction.plane(0), decoded.plane(0)) else {
                panic!("expected 8-bit planes");
            };
            assert_eq!(ours.checksum(), theirs.checksum(), "frame {frame}");
        }
    }

    #[test]
    fn temporal_refresh_restarts_accumulation() {
        let mut encoder = test_encoder(64, 48);
        let mut decoder = Decoder::new();

        // A run of inter frames, then an IDR, then another inter frame.
        let mut sequence = vec![(0u32, BaseFrameType::Idr)];
        sequence.extend((1..4).map(|f| (f, BaseFrameType::Inter)));
        sequence.push((4, BaseFrameType::Idr));
        sequence.push((5, BaseFrameType::Inter));

        for &(frame, frame_type) in &sequence {
            let (encoded, base) = encode_one(&mut encoder, frame, frame_type);
            let decoded = decoder.decode_frame(Some(&encoded.payload), &base, encoded.is_idr).unwrap();
            let (Plane::U8(ours), Plane::U8(theirs)) = (encoded.reconstruction.plane(0), decoded.plane(0)) else {
                panic!("expected 8-bit planes");
            };
            assert_eq!(ours.checksum(), theirs.checksum(), "frame {frame} {frame_type:?}");
        }
    }

    #[test]
    fn reconstruction_tracks_the_source() {
        // With a moderate step width the enhanced output must be much
        // closer to the source than the upsampled base alone.
        let mut encoder = test_encoder(64, 48);
        let (encoded, base) = encode_one(&mut encoder, 0, BaseFrameType::Idr);

        let source = test_source(64, 48, 0);
        let mut decoder = Decoder::new();
        let decoded = decoder.decode_frame(Some(&encoded.payload), &base, true).unwrap();

        let (Plane::U8(src), Plane::U8(out)) = (source.plane(0), decoded.plane(0)) else {
            panic!("expected 8-bit planes");
        };
        let mut err_sum = 0u64;
        for y in 0..48 {
            for x in 0..64 {
                err_sum += u64::from(src.get(x, y).abs_diff(out.get(x, y)));
            }
        }
        let mean_error = err_sum as f64 / (64.0 * 48.0);
        assert!(mean_error < 32.0, "mean abs error {mean_error}");
    }

    #[test]
    fn odd_source_sizes_get_a_conformance_window(){
        let mut configuration = SignaledConfiguration::default();
        configuration.global.colourspace = Colourspace::Y;
        configuration.picture.step_width_loq[LOQ_LEVEL_2] = 1000;
        let encoder = Encoder::new(configuration, EncoderConfiguration::default(), 60, 44).unwrap();
        let config = encoder.configuration();
        assert!(config.sequence.conformance_window);
        assert_eq!(config.global.resolution_width, 64);
        assert_eq!(config.global.resolution_height, 48);
        assert_eq!(config.sequence.conf_win_right_offset, 4);
        assert_eq!(config.sequence.conf_win_bottom_offset, 4);

        // And the output comes back at the source size.
        let source = encoder.expand_image(&test_source(60, 44, 0));
        assert_eq!(source.description().width, 64);
    }

    #[test]
    fn rejects_out_of_range_step_widths() {
        let mut configuration = SignaledConfiguration::default();
        configuration.picture.step_width_loq[LOQ_LEVEL_2] = 0;
        assert!(Encoder::new(configuration, EncoderConfiguration::default(), 64, 48).is_err());
    }
}
