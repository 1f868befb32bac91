//! Per-frame decode driver.
//!
//! Applies the deserialized symbol surfaces on top of the decoded base
//! picture: dequantize, inverse transform, compose through both levels of
//! quality with temporal accumulation, then dither and crop.

use crate::config::{ScalingMode, SignaledConfiguration, TemporalSwm};
use crate::dimensions::Dimensions;
use crate::dither::Dither;
use crate::image::{Image, ImageDescription, Plane};
use crate::surface::Surface;
use crate::syntax::{self, DeserializedPicture, FrameSymbols};
use crate::temporal::{self, TEMPORAL_PRED};
use crate::transform::{self, TransformKind};
use crate::{
    compose, convert, deblock, quantize, upsample, Error, Result, LOQ_LEVEL_1, LOQ_LEVEL_2, MAX_NUM_LAYERS,
    MAX_NUM_LOQS, MAX_NUM_PLANES, MAX_STEP_WIDTH, MIN_STEP_WIDTH,
};

/// Scales a step width by the temporal modifier.
pub(crate) fn swm_step_width(step_width: i32, modifier: u32) -> i32 {
    let m = (f64::from(modifier) / 255.0).clamp(0.0, 0.5);
    ((f64::from(step_width) * (1.0 - m)) as i32).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
}

/// Chroma planes carry a scaled LoQ-2 step width.
pub(crate) fn plane_step_width(step_width: i32, plane: usize, loq: usize, chroma_multiplier: u32) -> i32 {
    if loq == LOQ_LEVEL_2 && plane > 0 {
        ((step_width * chroma_multiplier as i32) >> 6).clamp(MIN_STEP_WIDTH, MAX_STEP_WIDTH)
    } else {
        step_width
    }
}

/// Step widths for each quantizer pass at one LoQ.
pub(crate) fn pass_step_widths(
    configuration: &SignaledConfiguration,
    plane: usize,
    loq: usize,
    swm: TemporalSwm,
) -> ([i32; 2], usize) {
    let base = plane_step_width(
        configuration.picture.step_width_loq[loq],
        plane,
        loq,
        configuration.global.chroma_step_width_multiplier,
    );

    if loq != LOQ_LEVEL_2 {
        return ([base, base], 1);
    }

    match swm {
        TemporalSwm::Disabled => ([base, base], 1),
        TemporalSwm::Active => ([swm_step_width(base, configuration.global.temporal_step_width_modifier), base], 1),
        TemporalSwm::Dependent => (
            [swm_step_width(base, configuration.global.temporal_step_width_modifier), base],
            2,
        ),
    }
}

/// Enhancement layer decoder with persistent temporal state.
pub struct Decoder {
    configuration: SignaledConfiguration,
    dimensions: Dimensions,
    quant_matrix: [[[i32; MAX_NUM_LAYERS]; MAX_NUM_LOQS]; MAX_NUM_PLANES],
    temporal_buffer: Vec<Option<Surface<i16>>>,
    dither_seed: u32,
    have_configuration: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// A decoder with no stream state yet.
    pub fn new() -> Self {
        Self {
            configuration: SignaledConfiguration::default(),
            dimensions: Dimensions::default(),
            quant_matrix: [[[-1; MAX_NUM_LAYERS]; MAX_NUM_LOQS]; MAX_NUM_PLANES],
            temporal_buffer: vec![None; MAX_NUM_PLANES],
            dither_seed: 1,
            have_configuration: false,
        }
    }

    /// The configuration as of the last decoded picture.
    pub fn configuration(&self) -> &SignaledConfiguration {
        &self.configuration
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

    /// Dequantizes and inverse transforms one LoQ of symbol layers.
    fn decode_residuals(
        &mut self,
        plane: usize,
        loq: usize,
        symbols: &[Surface<i16>],
        swm: TemporalSwm,
        temporal_mask: Option<&Surface<u8>>,
    ) -> Surface<i16> {
        let picture = self.configuration.picture.clone();
        let global = &self.configuration.global;
        let num_layers = global.num_residual_layers;
        let horizontal_only = global.scaling_mode[loq] == ScalingMode::OneD;
        let is_user_data_layer = |layer: usize| {
            loq == LOQ_LEVEL_1
                && global.user_data_enabled != crate::config::UserDataMode::None
                && layer == if global.transform_block_size == 4 { 5 } else { 1 }
        };

        let (step_widths, passes) = pass_step_widths(&self.configuration, plane, loq, swm);

        let mut coefficients = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let qm = self.quant_matrix[plane][loq][layer];

            let syms = if is_user_data_layer(layer) {
                temporal::user_data_clear(&symbols[layer], global.user_data_enabled)
            } else {
                symbols[layer].clone()
            };

            if passes == 1 {
                let lq = quantize::layer_quant(&picture, step_widths[0], qm);
                coefficients.push(quantize::dequantize(&syms, lq.invq, lq.applied_offset));
            } else {
                let lq = [
                    quantize::layer_quant(&picture, step_widths[0], qm),
                    quantize::layer_quant(&picture, step_widths[1], qm),
                ];
                coefficients.push(quantize::dequantize_swm(
                    &syms,
                    [lq[0].invq, lq[1].invq],
                    [lq[0].applied_offset, lq[1].applied_offset],
                    temporal_mask.expect("dependent dequantization needs a mask"),
                ));
            }
        }

        let kind = TransformKind::select(global.transform_block_size, horizontal_only);
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

    /// Decodes one picture given its enhancement payload (if any) and the
    /// decoded base reconstruction. A missing payload falls back to the
    /// upsampled base.
    pub fn decode_frame(&mut self, payload: Option<&[u8]>, base: &Image, is_idr: bool) -> Result<Image> {
        let parsed: Option<DeserializedPicture> = match payload {
            Some(data) if !data.is_empty() => Some(syntax::deserialize(data, &mut self.configuration)?),
            _ => {
                if !self.have_configuration {
                    return Err(Error::Bitstream("no stream configuration received yet".into()));
                }
                tracing::warn!("no enhancement payload, passing the base through");
                self.configuration.picture.enhancement_enabled = false;
                self.configuration.picture.temporal_refresh = true;
                self.configuration.picture.temporal_signalling_present = false;
                None
            }
        };
        self.have_configuration = true;

        let global = self.configuration.global.clone();
        self.dimensions = Dimensions::new(&self.configuration, global.resolution_width, global.resolution_height);

        if is_idr {
            self.temporal_buffer = vec![None; MAX_NUM_PLANES];
        }

        let empty = FrameSymbols::default();
        let symbols = parsed.as_ref().and_then(|p| p.symbols.as_ref()).unwrap_or(&empty);

        let num_image_planes = base.description().num_planes();
        let mut out_planes: Vec<Plane> = Vec::with_capacity(num_image_planes);

        for plane in 0..num_image_planes {
            let processed = plane < global.num_processed_planes;
            // A payload without symbol surfaces decays to base passthrough.
            let have_symbols = symbols.planes.len() > plane;
            let enhancement = self.configuration.picture.enhancement_enabled && processed && have_symbols;

            // Base reconstruction in the internal representation.
            let (base_plane, base_depth);
            if global.enhancement_depth > global.base_depth && global.level1_depth_flag {
                base_plane = convert::bit_shift(base.plane(plane), global.base_depth, global.enhancement_depth);
                base_depth = global.enhancement_depth;
            } else {
                base_plane = base.plane(plane).clone();
                base_depth = global.base_depth;
            }
            let base_decoded = convert::to_internal(&base_plane, base_depth);

            if enhancement {
                self.resolve_quant_matrices(plane, is_idr);
            }

            //// Sub-layer 1
            let base_prediction = self.upsample_plane(&base_decoded, LOQ_LEVEL_1);

            let intermediate = if enhancement {
                let mut residuals = self.decode_residuals(
                    plane,
                    LOQ_LEVEL_1,
                    &symbols.planes[plane].residuals[LOQ_LEVEL_1],
                    TemporalSwm::Disabled,
                    None,
                );
                if self.configuration.picture.level_1_filtering_enabled && global.transform_block_size == 4 {
                    residuals = deblock::level1_filter(
                        &residuals,
                        global.level_1_filtering_first_coefficient,
                        global.level_1_filtering_second_coefficient,
                    );
                }
                compose::add(&base_prediction, &residuals)
            } else {
                base_prediction
            };

            //// Sub-layer 2
            let enhanced_prediction = self.upsample_plane(&intermediate, LOQ_LEVEL_2);

            let refresh = self.configuration.picture.temporal_refresh;
            let signalling = self.configuration.picture.temporal_signalling_present && processed && have_symbols;

            let reconstruction = if enhancement && !signalling {
                // Refresh picture: residuals stand alone and reseed the
                // temporal buffer.
                let residuals = self.decode_residuals(
                    plane,
                    LOQ_LEVEL_2,
                    &symbols.planes[plane].residuals[LOQ_LEVEL_2],
                    TemporalSwm::Disabled,
                    None,
                );
                self.temporal_buffer[plane] = global.temporal_enabled.then(|| residuals.clone());
                compose::add(&enhanced_prediction, &residuals)
            } else if enhancement && signalling {
                let mask = symbols.planes[plane]
                    .temporal
                    .clone()
                    .unwrap_or_else(|| {
                        Surface::filled(
                            TEMPORAL_PRED,
                            enhanced_prediction.width() / global.transform_block_size,
                            enhanced_prediction.height() / global.transform_block_size,
                        )
                    });

                // The first coefficient layer carries the mask in its
                // LSBs as well; recover it, check parity, and strip.
                let mut layers = symbols.planes[plane].residuals[LOQ_LEVEL_2].clone();
                let embedded = temporal::extract_mask(&layers[0]);
                if embedded.checksum() != mask.checksum() {
                    tracing::warn!(plane, "embedded temporal mask disagrees with the signalled layer");
                }
                layers[0] = temporal::strip_mask(&layers[0]);

                let residuals = self.decode_residuals(plane, LOQ_LEVEL_2, &layers, TemporalSwm::Dependent, Some(&mask));

                let previous = self
                    .temporal_buffer[plane]
                    .clone()
                    .unwrap_or_else(|| Surface::blank(residuals.width(), residuals.height()));
                let updated = temporal::update(
                    &previous,
                    &residuals,
                    Some(&mask),
                    global.transform_block_size,
                    refresh,
                    global.temporal_tile_intra_signalling_enabled,
                );
                self.temporal_buffer[plane] = Some(updated.clone());
                compose::add(&enhanced_prediction, &updated)
            } else if signalling {
                // No residuals, but the temporal layer keeps selected
                // accumulated blocks alive.
                let mask = symbols.planes[plane].temporal.clone().unwrap_or_else(|| {
                    Surface::filled(
                        TEMPORAL_PRED,
                        enhanced_prediction.width() / global.transform_block_size,
                        enhanced_prediction.height() / global.transform_block_size,
                    )
                });
                let previous = self
                    .temporal_buffer[plane]
                    .clone()
                    .unwrap_or_else(|| Surface::blank(enhanced_prediction.width(), enhanced_prediction.height()));
                let kept = temporal::apply_map(&previous, &mask, global.transform_block_size);
                self.temporal_buffer[plane] = Some(kept.clone());
                compose::add(&enhanced_prediction, &kept)
            } else {
                if processed && refresh {
                    self.temporal_buffer[plane] = None;
                }
                if let Some(previous) = (processed && !refresh).then(|| self.temporal_buffer[plane].clone()).flatten() {
                    compose::add(&enhanced_prediction, &previous)
                } else {
                    enhanced_prediction
                }
            };

            // Dithering applies to the luma output only.
            let reconstruction = if self.configuration.picture.dithering_control && plane == 0 {
                let mut dither = Dither::new(
                    self.configuration.picture.dithering_type,
                    self.configuration.picture.dithering_strength,
                    global.enhancement_depth,
                    self.dither_seed,
                );
                self.dither_seed = self.dither_seed.wrapping_mul(0x0001_9660).wrapping_add(0x3c6e_f35f);
                dither.process(&reconstruction)
            } else {
                reconstruction
            };

            // Conformance window.
            let sequence = &self.configuration.sequence;
            let cropped = if sequence.conformance_window {
                let cw = self.dimensions.crop_unit_width(plane);
                let ch = self.dimensions.crop_unit_height(plane);
                convert::conform(
                    &reconstruction,
                    sequence.conf_win_left_offset * cw,
                    sequence.conf_win_top_offset * ch,
                    sequence.conf_win_right_offset * cw,
                    sequence.conf_win_bottom_offset * ch,
                )
            } else {
                reconstruction
            };

            out_planes.push(convert::from_internal(&cropped, global.enhancement_depth));
        }

        let description = ImageDescription::new(
            global.colourspace,
            out_planes[0].width(),
            out_planes[0].height(),
            global.enhancement_depth,
        );
        Ok(Image::new(out_planes, description, base.timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::{pass_step_widths, plane_step_width, swm_step_width, Decoder};
    use crate::config::{SignaledConfiguration, TemporalSwm};
    use crate::image::{Colourspace, Image, ImageDescription, Plane};
    use crate::surface::Surface;
    use crate::{LOQ_LEVEL_2, MAX_STEP_WIDTH};

    #[test]
    fn swm_halves_at_most() {
        assert_eq!(swm_step_width(1000, 0), 1000);
        assert_eq!(swm_step_width(1000, 255), 500);
        // 48/255 of the way down.
        assert_eq!(swm_step_width(1000, 48), (1000.0 * (1.0 - 48.0 / 255.0)) as i32);
        assert_eq!(swm_step_width(1, 255), 1);
    }

    #[test]
    fn chroma_multiplier_applies_to_loq2_only() {
        assert_eq!(plane_step_width(1000, 1, LOQ_LEVEL_2, 128), 2000);
        assert_eq!(plane_step_width(1000, 0, LOQ_LEVEL_2, 128), 1000);
        assert_eq!(plane_step_width(1000, 1, crate::LOQ_LEVEL_1, 128), 1000);
        assert_eq!(plane_step_width(MAX_STEP_WIDTH, 1, LOQ_LEVEL_2, 255), MAX_STEP_WIDTH);
    }

    #[test]
    fn dependent_swm_runs_two_passes() {
        let mut config = SignaledConfiguration::default();
        config.picture.step_width_loq[LOQ_LEVEL_2] = 2000;
        config.global.temporal_step_width_modifier = 255;
        let (widths, passes) = pass_step_widths(&config, 0, LOQ_LEVEL_2, TemporalSwm::Dependent);
        assert_eq!(passes, 2);
        assert_eq!(widths, [1000, 2000]);
    }

    #[test]
    fn missing_payload_falls_back_to_upsampled_base() {
        let mut decoder = Decoder::new();
        decoder.configuration.global.resolution_width = 32;
        decoder.configuration.global.resolution_height = 32;
        decoder.configuration.global.colourspace = Colourspace::Y;
        decoder.have_configuration = true;

        let base = Image::new(
            vec![Plane::U8(Surface::filled(64u8, 16, 16))],
            ImageDescription::new(Colourspace::Y, 16, 16, 8),
            0,
        );
        let out = decoder.decode_frame(None, &base, true).unwrap();
        assert_eq!(out.description().width, 32);
        assert_eq!(out.description().height, 32);
        // Flat content upsamples to itself.
        match out.plane(0) {
            Plane::U8(s) => assert_eq!(s.get(8, 8), 64),
            _ => panic!("expected 8-bit output"),
        }
    }
}
