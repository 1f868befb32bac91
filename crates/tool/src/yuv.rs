//! Raw planar YUV file IO.
//!
//! Planes are stored in full, Y then U then V; samples wider than 8 bits
//! are little-endian 16-bit words. The filename conventions
//! `name_WxH_Dbit.yuv` and `name_WxH_FPSfps.yuv` carry format hints.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lcevc_enhancement::surface::SurfaceBuilder;
use lcevc_enhancement::{Colourspace, Image, ImageDescription, Plane};

/// Format hints recovered from a filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileNameHints {
    /// Luma width.
    pub width: u32,
    /// Luma height.
    pub height: u32,
    /// Bit depth, when the name carries one.
    pub bit_depth: Option<u32>,
    /// Frame rate, when the name carries one.
    pub fps: Option<u32>,
}

/// Parses `name_WxH_Dbit.yuv` / `name_WxH_FPSfps.yuv` style names.
pub fn parse_file_name(path: &Path) -> Option<FileNameHints> {
    let stem = path.file_stem()?.to_str()?;

    let mut hints = None;
    for part in stem.split('_') {
        if let Some((w, h)) = part.split_once('x') {
            if let (Ok(width), Ok(height)) = (w.parse(), h.parse()) {
                hints = Some(FileNameHints {
                    width,
                    height,
                    bit_depth: None,
                    fps: None,
                });
            }
        } else if let Some(h) = &mut hints {
            if let Some(d) = part.strip_suffix("bit") {
                h.bit_depth = d.parse().ok();
            } else if let Some(f) = part.strip_suffix("fps") {
                h.fps = f.parse().ok();
            }
        }
    }
    hints
}

/// Sequential reader over a raw YUV file.
pub struct YuvReader {
    file: File,
    description: ImageDescription,
    length: usize,
}

impl YuvReader {
    /// Opens `path` and derives the frame count from the file size.
    pub fn open(path: &Path, description: ImageDescription) -> io::Result<Self> {
        let file = File::open(path)?;
        let bytes = file.metadata()?.len() as usize;
        let frame_size = description.frame_size();
        if bytes % frame_size != 0 {
            tracing::warn!(path = %path.display(), "file size is not a whole number of frames");
        }
        Ok(Self {
            file,
            description,
            length: bytes / frame_size,
        })
    }

    /// Number of whole frames in the file.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The frame format.
    pub fn description(&self) -> &ImageDescription {
        &self.description
    }

    /// Reads frame `index`.
    pub fn read(&mut self, index: usize) -> io::Result<Image> {
        if index >= self.length {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("frame {index} past end of file")));
        }
        self.file
            .seek(SeekFrom::Start((index * self.description.frame_size()) as u64))?;

        let mut planes = Vec::with_capacity(self.description.num_planes());
        for p in 0..self.description.num_planes() {
            let w = self.description.plane_width(p);
            let h = self.description.plane_height(p);
            if self.description.byte_depth() == 1 {
                let mut b = SurfaceBuilder::<u8>::new(w, h);
                let mut row = vec![0u8; w as usize];
                for y in 0..h {
                    self.file.read_exact(&mut row)?;
                    for (x, &v) in row.iter().enumerate() {
                        b.write(x as u32, y, v);
                    }
                }
                planes.push(Plane::U8(b.finish()));
            } else {
                let mut b = SurfaceBuilder::<u16>::new(w, h);
                for y in 0..h {
                    for x in 0..w {
                        b.write(x, y, self.file.read_u16::<LittleEndian>()?);
                    }
                }
                planes.push(Plane::U16(b.finish()));
            }
        }
        Ok(Image::new(planes, self.description, index as u64))
    }
}

/// Sequential writer producing a raw YUV file, flushed per frame.
pub struct YuvWriter {
    file: File,
}

impl YuvWriter {
    /// Creates (truncates) `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self { file: File::create(path)? })
    }

    /// Appends one frame.
    pub fn write(&mut self, image: &Image) -> io::Result<()> {
        for plane in image.planes() {
            match plane {
                Plane::U8(s) => {
                    for y in 0..s.height() {
                        self.file.write_all(s.row(y))?;
                    }
                }
                Plane::U16(s) => {
                    for y in 0..s.height() {
                        for &v in s.row(y) {
                            self.file.write_u16::<LittleEndian>(v)?;
                        }
                    }
                }
            }
        }
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcevc_enhancement::surface::Surface;

    #[test]
    fn file_name_inference() {
        let hints = parse_file_name(Path::new("/tmp/foreman_352x288_8bit.yuv")).unwrap();
        assert_eq!((hints.width, hints.height), (352, 288));
        assert_eq!(hints.bit_depth, Some(8));
        assert_eq!(hints.fps, None);

        let hints = parse_file_name(Path::new("city_1920x1080_50fps.yuv")).unwrap();
        assert_eq!((hints.width, hints.height), (1920, 1080));
        assert_eq!(hints.fps, Some(50));

        assert!(parse_file_name(Path::new("nodimension.yuv")).is_none());
    }

    #[test]
    fn write_then_read_round_trips_8_bit() {
        let dir = std::env::temp_dir().join("lcevc-yuv-test-8");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test_16x8_8bit.yuv");

        let description = ImageDescription::new(Colourspace::Yuv420, 16, 8, 8);
        let image = Image::new(
            vec![
                Plane::U8(Surface::generate(16, 8, |x, y| (x * 7 + y) as u8)),
                Plane::U8(Surface::filled(64u8, 8, 4)),
                Plane::U8(Surface::filled(192u8, 8, 4)),
            ],
            description,
            0,
        );

        let mut writer = YuvWriter::create(&path).unwrap();
        writer.write(&image).unwrap();
        writer.write(&image).unwrap();
        drop(writer);

        let mut reader = YuvReader::open(&path, description).unwrap();
        assert_eq!(reader.length(), 2);
        let back = reader.read(1).unwrap();
        match (image.plane(0), back.plane(0)) {
            (Plane::U8(a), Plane::U8(b)) => assert_eq!(a.checksum(), b.checksum()),
            _ => panic!("plane depth changed"),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_then_read_round_trips_10_bit() {
        let dir = std::env::temp_dir().join("lcevc-yuv-test-10");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test_8x4_10bit.yuv");

        let description = ImageDescription::new(Colourspace::Y, 8, 4, 10);
        let image = Image::new(
            vec![Plane::U16(Surface::generate(8, 4, |x, y| (x * 100 + y * 3) as u16))],
            description,
            0,
        );

        let mut writer = YuvWriter::create(&path).unwrap();
        writer.write(&image).unwrap();
        drop(writer);

        let mut reader = YuvReader::open(&path, description).unwrap();
        let back = reader.read(0).unwrap();
        match (image.plane(0), back.plane(0)) {
            (Plane::U16(a), Plane::U16(b)) => assert_eq!(a.checksum(), b.checksum()),
            _ => panic!("plane depth changed"),
        }
        std::fs::remove_file(&path).ok();
    }
}
