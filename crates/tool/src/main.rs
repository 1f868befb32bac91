//! Command line encoder and decoder for the LCEVC enhancement codec.
//!
//! The tool owns everything outside the codec core: YUV files, the
//! external base codec binaries, access unit plumbing and the PSNR / MD5
//! reports. Frames are processed strictly in order; the base stream is
//! expected in display order.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use lcevc_enhancement::config::BaseFrameType;
use lcevc_enhancement::nal::{self, BaseCoding, Encapsulation};
use lcevc_enhancement::{Colourspace, Decoder, Encoder, Image, ImageDescription, SignaledConfiguration};

mod base;
mod esfile;
mod params;
mod report;
mod yuv;

#[derive(Parser)]
#[command(name = "lcevc-tool", about = "LCEVC enhancement encoder/decoder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a YUV source into a base stream with enhancement.
    Encode(EncodeArgs),
    /// Decode an enhanced stream back to YUV.
    Decode(DecodeArgs),
}

#[derive(Args)]
struct EncodeArgs {
    /// Source YUV file (dimensions may be inferred from its name).
    #[arg(long)]
    input: PathBuf,

    /// Output elementary stream.
    #[arg(long)]
    output: PathBuf,

    /// Luma width; overrides the filename hint.
    #[arg(long)]
    width: Option<u32>,

    /// Luma height; overrides the filename hint.
    #[arg(long)]
    height: Option<u32>,

    /// Bits per sample; overrides the filename hint.
    #[arg(long)]
    bit_depth: Option<u32>,

    /// Chroma format: 400, 420, 422 or 444.
    #[arg(long, default_value = "420")]
    format: String,

    /// JSON file of parameter defaults.
    #[arg(long)]
    defaults: Option<PathBuf>,

    /// name=value parameter overrides.
    #[arg(short = 'p', long = "param")]
    parameters: Vec<String>,

    /// Directory with the external base codec binaries.
    #[arg(long, default_value = "external_codecs")]
    codec_dir: PathBuf,

    /// Working directory for intermediate files.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Optional reconstruction YUV output.
    #[arg(long)]
    recon: Option<PathBuf>,
}

#[derive(Args)]
struct DecodeArgs {
    /// Enhanced elementary stream.
    #[arg(long)]
    input: PathBuf,

    /// Output YUV file.
    #[arg(long)]
    output: PathBuf,

    /// JSON file of parameter defaults.
    #[arg(long)]
    defaults: Option<PathBuf>,

    /// name=value parameter overrides.
    #[arg(short = 'p', long = "param")]
    parameters: Vec<String>,

    /// Directory with the external base codec binaries.
    #[arg(long, default_value = "external_codecs")]
    codec_dir: PathBuf,

    /// Working directory for intermediate files.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
}

fn parse_colourspace(format: &str) -> Result<Colourspace, String> {
    match format {
        "400" | "y" => Ok(Colourspace::Y),
        "420" => Ok(Colourspace::Yuv420),
        "422" => Ok(Colourspace::Yuv422),
        "444" => Ok(Colourspace::Yuv444),
        other => Err(format!("unknown chroma format {other:?}")),
    }
}

fn load_parameters(defaults: Option<&Path>, overrides: &[String]) -> Result<params::Parameters, String> {
    let mut parameters = match defaults {
        Some(path) => params::Parameters::from_json_file(path).map_err(|e| e.to_string())?,
        None => params::Parameters::default(),
    };
    parameters.apply_overrides(overrides).map_err(|e| e.to_string())?;
    Ok(parameters)
}

fn encode(args: &EncodeArgs) -> Result<(), String> {
    let hints = yuv::parse_file_name(&args.input);
    let width = args.width.or(hints.map(|h| h.width)).ok_or("missing --width")?;
    let height = args.height.or(hints.map(|h| h.height)).ok_or("missing --height")?;
    let bit_depth = args.bit_depth.or(hints.and_then(|h| h.bit_depth)).unwrap_or(8);
    let colourspace = parse_colourspace(&args.format)?;

    let mut parameters = load_parameters(args.defaults.as_deref(), &args.parameters)?;
    if let Some(fps) = hints.and_then(|h| h.fps) {
        if parameters.get("fps").is_none() {
            parameters.set("fps", params::Value::Number(f64::from(fps)));
        }
    }

    let (configuration, encoder_configuration, run) =
        params::resolve(&parameters, colourspace, bit_depth).map_err(|e| e.to_string())?;

    let mut encoder =
        Encoder::new(configuration, encoder_configuration, width, height).map_err(|e| e.to_string())?;

    let source_description = ImageDescription::new(colourspace, width, height, bit_depth);
    let mut source = yuv::YuvReader::open(&args.input, source_description).map_err(|e| e.to_string())?;
    let frame_count = if run.limit == 0 {
        source.length()
    } else {
        source.length().min(run.limit as usize)
    };
    if frame_count == 0 {
        return Err("no frames can be read from the source".into());
    }

    //// Source pyramid: expand, then one downsampling step per LoQ.
    std::fs::create_dir_all(&args.work_dir).map_err(|e| e.to_string())?;
    let base_yuv = args.work_dir.join("base_input.yuv");
    let base_es = args.work_dir.join("base.es");
    let base_recon_yuv = args.work_dir.join("base_recon.yuv");

    {
        let mut base_writer = yuv::YuvWriter::create(&base_yuv).map_err(|e| e.to_string())?;
        for n in 0..frame_count {
            let frame = source.read(n).map_err(|e| e.to_string())?;
            let expanded = encoder.expand_image(&frame);
            let intermediate = encoder.downsample_image(&expanded, lcevc_enhancement::LOQ_LEVEL_2);
            let base = encoder.downsample_image(&intermediate, lcevc_enhancement::LOQ_LEVEL_1);
            base_writer.write(&base).map_err(|e| e.to_string())?;
        }
    }

    //// Base codec round trip.
    let base_codec = base::BaseCodec::new(run.base_coding, &args.codec_dir);
    base_codec
        .encode(
            &base_yuv,
            &base_es,
            &base_recon_yuv,
            &encoder.base_description(),
            run.fps,
            run.qp,
            params::intra_period(run.fps),
            frame_count as u32,
        )
        .map_err(|e| e.to_string())?;

    let mut base_recon =
        yuv::YuvReader::open(&base_recon_yuv, encoder.base_description()).map_err(|e| e.to_string())?;
    let mut access_units = esfile::read_access_units(&base_es, run.base_coding).map_err(|e| e.to_string())?;
    if access_units.len() < frame_count {
        return Err(format!(
            "base stream has {} access units for {frame_count} frames",
            access_units.len()
        ));
    }

    //// Enhancement pass.
    let mut psnr = report::PsnrAccumulator::new();
    let mut md5 = report::Md5Accumulator::new();
    let mut recon_writer = match &args.recon {
        Some(path) => Some(yuv::YuvWriter::create(path).map_err(|e| e.to_string())?),
        None => None,
    };

    let mut enhancement_bytes = 0usize;
    for n in 0..frame_count {
        let frame = source.read(n).map_err(|e| e.to_string())?;
        let expanded = encoder.expand_image(&frame);
        let intermediate = encoder.downsample_image(&expanded, lcevc_enhancement::LOQ_LEVEL_2);
        let next = if n + 1 < frame_count {
            let next_frame = source.read(n + 1).map_err(|e| e.to_string())?;
            Some(encoder.expand_image(&next_frame))
        } else {
            None
        };
        let base_frame = base_recon.read(n).map_err(|e| e.to_string())?;

        let frame_type = if access_units[n].is_idr {
            BaseFrameType::Idr
        } else {
            BaseFrameType::Inter
        };

        let encoded = encoder
            .encode_frame(&expanded, next.as_ref(), &intermediate, &base_frame, frame_type)
            .map_err(|e| e.to_string())?;
        enhancement_bytes += encoded.payload.len();

        let unit = match (run.encapsulation, run.base_coding) {
            (Encapsulation::Nal, BaseCoding::Evc) => nal::enhancement_nalu_evc(encoded.is_idr, &encoded.payload),
            (Encapsulation::Nal, _) => nal::enhancement_nalu(encoded.is_idr, &encoded.payload),
            (Encapsulation::SeiRegistered, codec) => nal::sei_nalu(codec, true, encoded.is_idr, &encoded.payload),
            (Encapsulation::SeiUnregistered, codec) => nal::sei_nalu(codec, false, encoded.is_idr, &encoded.payload),
        };
        let nal_type = if encoded.is_idr { 29 } else { 28 };
        access_units[n].insert_enhancement(run.base_coding, nal_type, unit);

        psnr.add(&frame, &encoded.reconstruction);
        md5.add(&encoded.reconstruction);
        if let Some(writer) = &mut recon_writer {
            writer.write(&encoded.reconstruction).map_err(|e| e.to_string())?;
        }
    }

    esfile::write_access_units(&args.output, &access_units[..frame_count]).map_err(|e| e.to_string())?;

    psnr.report();
    info!(md5 = md5.finish(), "reconstruction digest");
    info!(
        enhancement_bytes,
        frames = frame_count,
        output = %args.output.display(),
        "encode complete"
    );
    Ok(())
}

fn decode(args: &DecodeArgs) -> Result<(), String> {
    let parameters = load_parameters(args.defaults.as_deref(), &args.parameters)?;
    let (_, _, run) = params::resolve(&parameters, Colourspace::Yuv420, 8).map_err(|e| e.to_string())?;

    let access_units = esfile::read_access_units(&args.input, run.base_coding).map_err(|e| e.to_string())?;
    if access_units.is_empty() {
        return Err("empty elementary stream".into());
    }

    //// Split enhancement payloads from the base stream.
    let mut payloads: Vec<Option<nal::ExtractedEnhancement>> = Vec::with_capacity(access_units.len());
    let mut base_stream = Vec::new();
    for unit in &access_units {
        let bytes = unit.to_bytes();
        let (remaining, mut found) = nal::scan_enhancement(&bytes, run.encapsulation, run.base_coding, unit.is_idr);
        base_stream.extend_from_slice(&remaining);
        if found.len() > 1 {
            tracing::warn!("multiple enhancement payloads in one access unit");
        }
        payloads.push(found.pop());
    }

    //// Recover the stream geometry from the first payload.
    let first = payloads
        .iter()
        .flatten()
        .next()
        .ok_or("no enhancement data found in the stream")?;
    let mut probe_configuration = SignaledConfiguration::default();
    lcevc_enhancement::syntax::deserialize(&first.payload, &mut probe_configuration).map_err(|e| e.to_string())?;
    let global = &probe_configuration.global;
    let dimensions = lcevc_enhancement::dimensions::Dimensions::new(
        &probe_configuration,
        global.resolution_width,
        global.resolution_height,
    );
    let base_description = ImageDescription::new(
        global.colourspace,
        dimensions.base_width(0),
        dimensions.base_height(0),
        global.base_depth,
    );

    //// Base decode.
    std::fs::create_dir_all(&args.work_dir).map_err(|e| e.to_string())?;
    let base_es = args.work_dir.join("base_only.es");
    let base_yuv = args.work_dir.join("base_decoded.yuv");
    std::fs::write(&base_es, &base_stream).map_err(|e| e.to_string())?;
    base::BaseCodec::new(run.base_coding, &args.codec_dir)
        .decode(&base_es, &base_yuv)
        .map_err(|e| e.to_string())?;

    let mut base_reader = yuv::YuvReader::open(&base_yuv, base_description).map_err(|e| e.to_string())?;
    let frame_count = base_reader.length().min(payloads.len());

    //// Enhancement pass.
    let mut decoder = Decoder::new();
    let mut writer = yuv::YuvWriter::create(&args.output).map_err(|e| e.to_string())?;
    let mut md5 = report::Md5Accumulator::new();

    let mut previous: Option<Image> = None;
    for (n, payload) in payloads.iter().enumerate().take(frame_count) {
        let base_frame = base_reader.read(n).map_err(|e| e.to_string())?;
        let (data, is_idr) = match payload {
            Some(p) => (Some(p.payload.as_slice()), p.is_idr),
            None => (None, access_units[n].is_idr),
        };
        // A malformed payload loses this access unit only: the previous
        // reconstruction is held, or the bare base is passed through.
        let decoded: Image = match decoder.decode_frame(data, &base_frame, is_idr) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(frame = n, "enhancement decode failed: {e}");
                match &previous {
                    Some(image) => image.clone(),
                    None => decoder.decode_frame(None, &base_frame, is_idr).map_err(|e| e.to_string())?,
                }
            }
        };
        writer.write(&decoded).map_err(|e| e.to_string())?;
        md5.add(&decoded);
        previous = Some(decoded);
    }

    info!(md5 = md5.finish(), frames = frame_count, output = %args.output.display(), "decode complete");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .init();

    let result = match &cli.command {
        Commands::Encode(args) => encode(args),
        Commands::Decode(args) => decode(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
