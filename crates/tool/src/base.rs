//! External base codec invocation.
//!
//! The base layer is produced and consumed by the reference command line
//! binaries (JM, HM, VTM, ETM), driven here as blocking subprocesses. A
//! failed base codec run is fatal for the file.

use std::path::{Path, PathBuf};
use std::process::Command;

use lcevc_enhancement::nal::BaseCoding;
use lcevc_enhancement::{Colourspace, ImageDescription};

/// Errors from base codec runs.
#[derive(Debug, thiserror::Error)]
pub enum BaseCodecError {
    /// Could not launch the binary at all.
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// The binary.
        program: String,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The binary ran and failed.
    #[error("{program} exited with {status}")]
    Failed {
        /// The binary.
        program: String,
        /// Its exit status.
        status: std::process::ExitStatus,
    },
}

/// Locations and settings for one base codec run.
pub struct BaseCodec {
    codec: BaseCoding,
    /// Directory holding the external codec binaries.
    binary_dir: PathBuf,
}

impl BaseCodec {
    /// A runner using binaries under `binary_dir`.
    pub fn new(codec: BaseCoding, binary_dir: &Path) -> Self {
        Self {
            codec,
            binary_dir: binary_dir.to_path_buf(),
        }
    }

    fn run(&self, program: PathBuf, args: Vec<String>) -> Result<(), BaseCodecError> {
        let program_display = program.display().to_string();
        tracing::info!(program = %program_display, ?args, "running base codec");
        let status = Command::new(&program).args(&args).status().map_err(|source| BaseCodecError::Launch {
            program: program_display.clone(),
            source,
        })?;
        if !status.success() {
            return Err(BaseCodecError::Failed {
                program: program_display,
                status,
            });
        }
        Ok(())
    }

    fn chroma_format(description: &ImageDescription) -> u32 {
        match description.colourspace {
            Colourspace::Y => 400,
            Colourspace::Yuv420 => 420,
            Colourspace::Yuv422 => 422,
            Colourspace::Yuv444 => 444,
        }
    }

    /// Encodes `yuv_file`, producing an elementary stream and the
    /// reconstruction the enhancement layers are built against.
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        yuv_file: &Path,
        es_file: &Path,
        recon_file: &Path,
        description: &ImageDescription,
        fps: u32,
        qp: u32,
        intra_period: u32,
        frame_count: u32,
    ) -> Result<(), BaseCodecError> {
        let (program, args) = match self.codec {
            BaseCoding::Avc => (
                self.binary_dir.join("JM/lencod"),
                vec![
                    format!("-d{}", self.binary_dir.join("JM/encoder.cfg").display()),
                    format!("-pInputFile={}", yuv_file.display()),
                    format!("-pOutputFile={}", es_file.display()),
                    format!("-pReconFile={}", recon_file.display()),
                    format!("-pSourceWidth={}", description.width),
                    format!("-pSourceHeight={}", description.height),
                    format!("-pSourceBitDepthLuma={}", description.bit_depth),
                    format!("-pSourceBitDepthChroma={}", description.bit_depth),
                    format!("-pOutputBitDepthLuma={}", description.bit_depth),
                    format!("-pOutputBitDepthChroma={}", description.bit_depth),
                    format!("-pFrameRate={fps}"),
                    format!("-pQPISlice={qp}"),
                    format!("-pQPPSlice={}", qp + 1),
                    format!("-pQPBSlice={}", qp + 1),
                    format!("-pIntraPeriod={intra_period}"),
                    format!("-pFramesToBeEncoded={frame_count}"),
                ],
            ),
            BaseCoding::Hevc => (
                self.binary_dir.join("HM/TAppEncoder"),
                vec![
                    "-c".to_string(),
                    self.binary_dir.join("HM/encoder_randomaccess_main10.cfg").display().to_string(),
                    format!("--InputFile={}", yuv_file.display()),
                    format!("--BitstreamFile={}", es_file.display()),
                    format!("--ReconFile={}", recon_file.display()),
                    format!("--SourceWidth={}", description.width),
                    format!("--SourceHeight={}", description.height),
                    format!("--InputBitDepth={}", description.bit_depth),
                    format!("--OutputBitDepth={}", description.bit_depth),
                    format!("--InternalBitDepth={}", description.bit_depth),
                    format!("--InputChromaFormat={}", Self::chroma_format(description)),
                    format!("--FrameRate={fps}"),
                    format!("--QP={qp}"),
                    format!("--IntraPeriod={intra_period}"),
                    format!("--FramesToBeEncoded={frame_count}"),
                    "--ConformanceWindowMode=1".to_string(),
                ],
            ),
            BaseCoding::Vvc => (
                self.binary_dir.join("VTM/EncoderApp"),
                vec![
                    "-c".to_string(),
                    self.binary_dir.join("VTM/encoder_randomaccess_vtm.cfg").display().to_string(),
                    format!("--InputFile={}", yuv_file.display()),
                    format!("--BitstreamFile={}", es_file.display()),
                    format!("--ReconFile={}", recon_file.display()),
                    format!("--SourceWidth={}", description.width),
                    format!("--SourceHeight={}", description.height),
                    format!("--InputBitDepth={}", description.bit_depth),
                    format!("--InputChromaFormat={}", Self::chroma_format(description)),
                    format!("--FrameRate={fps}"),
                    format!("--QP={qp}"),
                    format!("--IntraPeriod={intra_period}"),
                    format!("--FramesToBeEncoded={frame_count}"),
                ],
            ),
            BaseCoding::Evc => (
                self.binary_dir.join("ETM/evca"),
                vec![
                    "-i".to_string(),
                    yuv_file.display().to_string(),
                    "-o".to_string(),
                    es_file.display().to_string(),
                    "-r".to_string(),
                    recon_file.display().to_string(),
                    "-w".to_string(),
                    description.width.to_string(),
                    "-h".to_string(),
                    description.height.to_string(),
                    "-d".to_string(),
                    description.bit_depth.to_string(),
                    "-z".to_string(),
                    fps.to_string(),
                    "-q".to_string(),
                    qp.to_string(),
                    "-p".to_string(),
                    intra_period.to_string(),
                    "-f".to_string(),
                    frame_count.to_string(),
                ],
            ),
        };
        self.run(program, args)
    }

    /// Decodes an elementary stream back to YUV.
    pub fn decode(&self, es_file: &Path, yuv_file: &Path) -> Result<(), BaseCodecError> {
        let (program, args) = match self.codec {
            BaseCoding::Avc => (
                self.binary_dir.join("JM/ldecod"),
                vec![
                    format!("-pInputFile={}", es_file.display()),
                    format!("-pOutputFile={}", yuv_file.display()),
                    "-pWriteUV=1".to_string(),
                ],
            ),
            BaseCoding::Hevc => (
                self.binary_dir.join("HM/TAppDecoder"),
                vec![
                    "-b".to_string(),
                    es_file.display().to_string(),
                    "-o".to_string(),
                    yuv_file.display().to_string(),
                ],
            ),
            BaseCoding::Vvc => (
                self.binary_dir.join("VTM/DecoderApp"),
                vec![
                    "-b".to_string(),
                    es_file.display().to_string(),
                    "-o".to_string(),
                    yuv_file.display().to_string(),
                ],
            ),
            BaseCoding::Evc => (
                self.binary_dir.join("ETM/evcd"),
                vec![
                    "-i".to_string(),
                    es_file.display().to_string(),
                    "-o".to_string(),
                    yuv_file.display().to_string(),
                ],
            ),
        };
        self.run(program, args)
    }
}
