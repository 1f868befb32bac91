//! The parameters bundle: a map of name to bool / number / string,
//! assembled from a JSON defaults file plus command line overrides, and
//! resolved into the codec configuration records.

use std::collections::BTreeMap;
use std::path::Path;

use lcevc_enhancement::config::{
    CompressionType, DequantOffset, DitheringType, Downsample, QuantMatrixMode, ScalingMode, TransformType,
    Upsample, UserDataMethod, UserDataMode,
};
use lcevc_enhancement::encoder::EncoderConfiguration;
use lcevc_enhancement::nal::{BaseCoding, Encapsulation};
use lcevc_enhancement::{Colourspace, SignaledConfiguration, LOQ_LEVEL_1, LOQ_LEVEL_2};
use serde::Deserialize;

/// One parameter value.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// Boolean switch.
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// Free form string.
    String(String),
}

/// Errors raised while resolving parameters.
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    /// Unreadable or malformed defaults file.
    #[error("defaults file: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON.
    #[error("defaults file: {0}")]
    Json(#[from] serde_json::Error),
    /// A value that cannot be interpreted.
    #[error("parameter {name}: {message}")]
    Invalid {
        /// Parameter name.
        name: String,
        /// What went wrong.
        message: String,
    },
}

fn invalid(name: &str, message: impl Into<String>) -> ParameterError {
    ParameterError::Invalid {
        name: name.into(),
        message: message.into(),
    }
}

/// A name to value map with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    /// Loads a JSON object of defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ParameterError> {
        let text = std::fs::read_to_string(path)?;
        let values: BTreeMap<String, Value> = serde_json::from_str(&text)?;
        Ok(Self { values })
    }

    /// Applies `key=value` command line overrides on top.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ParameterError> {
        for entry in overrides {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| invalid(entry, "expected name=value"))?;
            let value = if let Ok(b) = value.parse::<bool>() {
                Value::Bool(b)
            } else if let Ok(n) = value.parse::<f64>() {
                Value::Number(n)
            } else {
                Value::String(value.to_string())
            };
            self.values.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Sets one value programmatically.
    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    /// Raw lookup.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Boolean parameter with a default.
    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool, ParameterError> {
        match self.values.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(*n != 0.0),
            Some(v) => Err(invalid(name, format!("expected a bool, got {v:?}"))),
        }
    }

    /// Unsigned parameter with a default.
    pub fn get_u32(&self, name: &str, default: u32) -> Result<u32, ParameterError> {
        match self.values.get(name) {
            None => Ok(default),
            Some(Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => Ok(*n as u32),
            Some(v) => Err(invalid(name, format!("expected an unsigned number, got {v:?}"))),
        }
    }

    /// String parameter with a default.
    pub fn get_str(&self, name: &str, default: &str) -> Result<String, ParameterError> {
        match self.values.get(name) {
            None => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v) => Err(invalid(name, format!("expected a string, got {v:?}"))),
        }
    }

    fn get_u32_list(&self, name: &str, count: usize) -> Result<Option<Vec<u32>>, ParameterError> {
        let Some(Value::String(s)) = self.values.get(name) else {
            return Ok(None);
        };
        let parsed: Result<Vec<u32>, _> = s.split_whitespace().map(str::parse).collect();
        let parsed = parsed.map_err(|e| invalid(name, format!("{e}")))?;
        if parsed.len() != count {
            return Err(invalid(name, format!("expected {count} values, got {}", parsed.len())));
        }
        Ok(Some(parsed))
    }
}

fn parse_enum<T: Copy>(name: &str, value: &str, table: &[(&str, T)]) -> Result<T, ParameterError> {
    table
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(value))
        .map(|&(_, v)| v)
        .ok_or_else(|| invalid(name, format!("unknown value {value:?}")))
}

/// External pieces of the encode run, beyond the codec configuration.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    /// Host codec of the base layer.
    pub base_coding: BaseCoding,
    /// Payload encapsulation.
    pub encapsulation: Encapsulation,
    /// Base codec quantizer.
    pub qp: u32,
    /// Frame rate, for the intra period derivation.
    pub fps: u32,
    /// Frame limit, 0 meaning the whole file.
    pub limit: u32,
}

/// Resolves the parameters bundle into the signalled configuration, the
/// encoder knobs and the run glue.
pub fn resolve(
    parameters: &Parameters,
    colourspace: Colourspace,
    bit_depth: u32,
) -> Result<(SignaledConfiguration, EncoderConfiguration, RunConfiguration), ParameterError> {
    let mut configuration = SignaledConfiguration::default();
    let global = &mut configuration.global;

    global.colourspace = colourspace;
    global.enhancement_depth = bit_depth;
    global.base_depth = parameters.get_u32("base_depth", bit_depth)?;
    global.num_processed_planes = parameters.get_u32("num_processed_planes", 1)? as usize;

    let transform = parse_enum(
        "encoding_transform_type",
        &parameters.get_str("encoding_transform_type", "dds")?,
        &[("dd", TransformType::Dd), ("dds", TransformType::Dds)],
    )?;
    global.set_transform(transform);

    let scaling_table = [
        ("none", ScalingMode::None),
        ("1d", ScalingMode::OneD),
        ("2d", ScalingMode::TwoD),
    ];
    global.scaling_mode[LOQ_LEVEL_1] = parse_enum(
        "scaling_mode_level1",
        &parameters.get_str("scaling_mode_level1", "none")?,
        &scaling_table,
    )?;
    global.scaling_mode[LOQ_LEVEL_2] = parse_enum(
        "scaling_mode_level2",
        &parameters.get_str("scaling_mode_level2", "2d")?,
        &scaling_table,
    )?;

    global.upsample = parse_enum(
        "encoding_upsample",
        &parameters.get_str("encoding_upsample", "modifiedcubic")?,
        &[
            ("nearest", Upsample::Nearest),
            ("linear", Upsample::Linear),
            ("cubic", Upsample::Cubic),
            ("modifiedcubic", Upsample::ModifiedCubic),
            ("adaptivecubic", Upsample::AdaptiveCubic),
        ],
    )?;
    if let Some(coefficients) = parameters.get_u32_list("upsampling_coefficients", 4)? {
        global.upsampling_coefficients = [coefficients[0], coefficients[1], coefficients[2], coefficients[3]];
    } else if global.upsample == Upsample::AdaptiveCubic {
        global.upsampling_coefficients = [1752, 14672, 4049, 585];
    }

    global.predicted_residual_enabled = parameters.get_bool("predicted_residual", true)?;
    global.temporal_enabled = parameters.get_bool("temporal_enabled", true)?;
    global.temporal_tile_intra_signalling_enabled = parameters.get_bool("temporal_use_reduced_signalling", true)?;
    global.temporal_step_width_modifier = parameters.get_u32("temporal_step_width_modifier", 48)?;
    global.chroma_step_width_multiplier = parameters.get_u32("chroma_step_width_multiplier", 64)?;
    global.level1_depth_flag = parameters.get_bool("level1_depth_flag", false)?;
    global.level_1_filtering_first_coefficient = parameters.get_u32("level_1_filtering_first_coefficient", 0)?;
    global.level_1_filtering_second_coefficient = parameters.get_u32("level_1_filtering_second_coefficient", 0)?;

    global.user_data_enabled = parse_enum(
        "user_data_enabled",
        &parameters.get_str("user_data_enabled", "none")?,
        &[
            ("none", UserDataMode::None),
            ("2bits", UserDataMode::TwoBits),
            ("6bits", UserDataMode::SixBits),
        ],
    )?;

    global.tile_width = parameters.get_u32("tile_width", 0)?;
    global.tile_height = parameters.get_u32("tile_height", 0)?;
    global.resolve_tile_dimensions();
    global.compression_type_entropy_enabled_per_tile =
        parameters.get_bool("compression_type_entropy_enabled_per_tile", false)?;
    global.compression_type_size_per_tile = parse_enum(
        "compression_type_size_per_tile",
        &parameters.get_str("compression_type_size_per_tile", "none")?,
        &[
            ("none", CompressionType::None),
            ("prefix", CompressionType::Prefix),
            ("prefix_diff", CompressionType::PrefixOnDiff),
        ],
    )?;

    let picture = &mut configuration.picture;
    picture.step_width_loq[LOQ_LEVEL_2] = parameters.get_u32("cq_step_width_loq_0", 32767)? as i32;
    picture.step_width_loq[LOQ_LEVEL_1] = parameters.get_u32("cq_step_width_loq_1", 32767)? as i32;

    picture.quant_matrix_mode = parse_enum(
        "quant_matrix_mode",
        &parameters.get_str("quant_matrix_mode", "previous")?,
        &[
            ("previous", QuantMatrixMode::BothPrevious),
            ("default", QuantMatrixMode::BothDefault),
            ("custom_same", QuantMatrixMode::SameAndCustom),
            ("custom_level2", QuantMatrixMode::Level2CustomLevel1Default),
            ("custom_level1", QuantMatrixMode::Level2DefaultLevel1Custom),
            ("custom_custom", QuantMatrixMode::DifferentAndCustom),
        ],
    )?;
    let num_layers = configuration.global.num_residual_layers;
    if let Some(values) = parameters.get_u32_list("qm_coefficient_1", num_layers)? {
        for (i, v) in values.iter().enumerate() {
            configuration.picture.qm_coefficient_1[i] = *v as u8;
        }
    }
    if let Some(values) = parameters.get_u32_list("qm_coefficient_2", num_layers)? {
        for (i, v) in values.iter().enumerate() {
            configuration.picture.qm_coefficient_2[i] = *v as u8;
        }
    }

    let picture = &mut configuration.picture;
    picture.dequant_offset = parameters.get_u32("dequant_offset", 0)? as i32;
    picture.dequant_offset_signalled = parameters.get("dequant_offset").is_some();
    picture.dequant_offset_mode = parse_enum(
        "dequant_offset_mode",
        &parameters.get_str("dequant_offset_mode", "default")?,
        &[
            ("default", DequantOffset::Default),
            ("const_offset", DequantOffset::ConstOffset),
        ],
    )?;

    picture.dithering_control = parameters.get_bool("dithering_control", false)?;
    picture.dithering_type = parse_enum(
        "dithering_type",
        &parameters.get_str("dithering_type", "none")?,
        &[
            ("none", DitheringType::None),
            ("uniform", DitheringType::Uniform),
            ("uniform_fixed", DitheringType::UniformFixed),
        ],
    )?;
    picture.dithering_strength = parameters.get_u32("dithering_strength", 0)?;

    let encoder_configuration = EncoderConfiguration {
        temporal_cq_sw_multiplier: parameters.get_u32("temporal_cq_sw_multiplier", 1000)?,
        user_data_method: parse_enum(
            "user_data_method",
            &parameters.get_str("user_data_method", "zeros")?,
            &[
                ("zeros", UserDataMethod::Zeros),
                ("ones", UserDataMethod::Ones),
                ("random", UserDataMethod::Random),
                ("fixedrandom", UserDataMethod::FixedRandom),
            ],
        )?,
        sad_threshold: parameters.get_u32("sad_threshold", 0)?,
        sad_coeff_threshold: parameters.get_u32("sad_coeff_threshold", 0)?,
        quant_reduced_deadzone: parameters.get_u32("quant_reduced_deadzone", 5)?,
        no_enhancement_temporal_layer: parameters.get_bool("temporal_signalling_present", false)?,
        downsample: parse_enum(
            "encoding_downsample",
            &parameters.get_str("encoding_downsample", "lanczos")?,
            &[
                ("area", Downsample::Area),
                ("lanczos", Downsample::Lanczos),
                ("lanczos3", Downsample::Lanczos3),
            ],
        )?,
    };

    let run = RunConfiguration {
        base_coding: parse_enum(
            "base_encoder",
            &parameters.get_str("base_encoder", "avc")?,
            &[
                ("avc", BaseCoding::Avc),
                ("hevc", BaseCoding::Hevc),
                ("vvc", BaseCoding::Vvc),
                ("evc", BaseCoding::Evc),
            ],
        )?,
        encapsulation: parse_enum(
            "encapsulation",
            &parameters.get_str("encapsulation", "nal")?,
            &[
                ("nal", Encapsulation::Nal),
                ("sei_registered", Encapsulation::SeiRegistered),
                ("sei_unregistered", Encapsulation::SeiUnregistered),
            ],
        )?,
        qp: parameters.get_u32("qp", 28)?,
        fps: parameters.get_u32("fps", 30)?,
        limit: parameters.get_u32("limit", 0)?,
    };

    Ok((configuration, encoder_configuration, run))
}

/// Intra period derived from the frame rate, as the reference tool does.
pub fn intra_period(fps: u32) -> u32 {
    match fps {
        30 => 32,
        50 => 48,
        60 => 64,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::{intra_period, resolve, Parameters, Value};
    use lcevc_enhancement::config::{QuantMatrixMode, ScalingMode, TransformType, Upsample};
    use lcevc_enhancement::nal::BaseCoding;
    use lcevc_enhancement::{Colourspace, LOQ_LEVEL_1, LOQ_LEVEL_2};

    #[test]
    fn defaults_resolve_to_the_reference_shape() {
        let parameters = Parameters::default();
        let (config, encoder, run) = resolve(&parameters, Colourspace::Yuv420, 8).unwrap();
        assert_eq!(config.global.transform_block_size, 4);
        assert_eq!(config.global.num_residual_layers, 16);
        assert_eq!(config.global.scaling_mode[LOQ_LEVEL_2], ScalingMode::TwoD);
        assert_eq!(config.global.upsample, Upsample::ModifiedCubic);
        assert!(config.global.temporal_enabled);
        assert_eq!(config.picture.quant_matrix_mode, QuantMatrixMode::BothPrevious);
        assert_eq!(encoder.temporal_cq_sw_multiplier, 1000);
        assert_eq!(run.base_coding, BaseCoding::Avc);
        assert_eq!(run.qp, 28);
    }

    #[test]
    fn overrides_take_effect() {
        let mut parameters = Parameters::default();
        parameters
            .apply_overrides(&[
                "encoding_transform_type=dd".to_string(),
                "cq_step_width_loq_0=2250".to_string(),
                "scaling_mode_level1=1d".to_string(),
                "temporal_enabled=false".to_string(),
            ])
            .unwrap();
        let (config, _, _) = resolve(&parameters, Colourspace::Y, 10).unwrap();
        assert_eq!(config.global.transform_block_size, 2);
        assert_eq!(config.picture.step_width_loq[LOQ_LEVEL_2], 2250);
        assert_eq!(config.global.scaling_mode[LOQ_LEVEL_1], ScalingMode::OneD);
        assert!(!config.global.temporal_enabled);
        assert_eq!(config.global.enhancement_depth, 10);
    }

    #[test]
    fn adaptive_kernel_defaults_its_coefficients() {
        let mut parameters = Parameters::default();
        parameters
            .apply_overrides(&["encoding_upsample=adaptivecubic".to_string()])
            .unwrap();
        let (config, _, _) = resolve(&parameters, Colourspace::Y, 8).unwrap();
        assert_eq!(config.global.upsampling_coefficients, [1752, 14672, 4049, 585]);
    }

    #[test]
    fn qm_list_length_is_checked() {
        let mut parameters = Parameters::default();
        parameters.set("qm_coefficient_2", Value::String("1 2 3".to_string()));
        assert!(resolve(&parameters, Colourspace::Y, 8).is_err());
    }

    #[test]
    fn transform_derives_its_own_qm_length() {
        let mut parameters = Parameters::default();
        parameters.set("encoding_transform_type", Value::String("dd".to_string()));
        parameters.set("qm_coefficient_2", Value::String("1 2 3 4".to_string()));
        let (config, _, _) = resolve(&parameters, Colourspace::Y, 8).unwrap();
        assert_eq!(&config.picture.qm_coefficient_2[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn intra_period_follows_frame_rate() {
        assert_eq!(intra_period(30), 32);
        assert_eq!(intra_period(50), 48);
        assert_eq!(intra_period(60), 64);
        assert_eq!(intra_period(25), 64);
    }
}
