//! Raster interchange format.
//!
//! One file holds one 2-D pixel buffer: a colour image (`Bgra32`) or a
//! single-channel mask (`Alpha8`). Both sides of the process boundary read
//! and write this format.
//!
//! Layout (all fields little-endian):
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 4    | signature `"FHRF"`            |
//! | 4      | 4    | format version (i32)          |
//! | 8      | 4    | width (i32)                   |
//! | 12     | 4    | height (i32)                  |
//! | 16     | 4    | pixel format (i32)            |
//! | 20     | 4    | stride in bytes (i32)         |
//! | 24     | 8    | horizontal resolution (f64)   |
//! | 32     | 8    | vertical resolution (f64)     |
//!
//! Rows follow the header top-to-bottom with no padding beyond `stride`, so
//! the file is exactly `HEADER_LEN + stride * height` bytes long.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

pub const RASTER_SIGNATURE: u32 = u32::from_le_bytes(*b"FHRF");
pub const RASTER_FORMAT_VERSION: i32 = 1;
pub const HEADER_LEN: usize = 40;

/// Largest accepted width or height.
pub const MAX_DIMENSION: u32 = 300_000;

pub const DEFAULT_DPI: f64 = 96.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Bgra32,
    Alpha8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra32 => 4,
            Self::Alpha8 => 1,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Self::Bgra32 => 0,
            Self::Alpha8 => 1,
        }
    }

    fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Bgra32),
            1 => Some(Self::Alpha8),
            _ => None,
        }
    }
}

/// Resolution in dots per inch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Dpi {
    pub x: f64,
    pub y: f64,
}

impl Dpi {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for Dpi {
    fn default() -> Self {
        Self::new(DEFAULT_DPI, DEFAULT_DPI)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("raster file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("not a raster file (signature 0x{found:08x})")]
    BadSignature { found: u32 },

    #[error("unsupported raster format version {found} (expected {RASTER_FORMAT_VERSION})")]
    UnsupportedVersion { found: i32 },

    #[error("raster file is truncated ({actual} bytes)")]
    Truncated { actual: u64 },

    #[error("invalid raster dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },

    #[error("unknown pixel format {0}")]
    UnknownPixelFormat(i32),

    #[error("stride {stride} does not match {format:?} row of width {width}")]
    StrideMismatch {
        stride: i64,
        width: u32,
        format: PixelFormat,
    },

    #[error("raster file is {actual} bytes but header describes {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },

    #[error("raster I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl RasterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The file exists but is not a raster this build can read.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::BadSignature { .. }
                | Self::UnsupportedVersion { .. }
                | Self::Truncated { .. }
                | Self::InvalidDimensions { .. }
                | Self::UnknownPixelFormat(_)
                | Self::StrideMismatch { .. }
                | Self::SizeMismatch { .. }
        )
    }
}

/// Decoded raster header.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RasterHeader {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
    pub dpi: Dpi,
}

impl RasterHeader {
    pub fn payload_len(&self) -> usize {
        self.stride * self.height as usize
    }

    pub fn file_len(&self) -> u64 {
        (HEADER_LEN + self.payload_len()) as u64
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&RASTER_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&RASTER_FORMAT_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.width as i32).to_le_bytes());
        buf[12..16].copy_from_slice(&(self.height as i32).to_le_bytes());
        buf[16..20].copy_from_slice(&self.format.to_wire().to_le_bytes());
        buf[20..24].copy_from_slice(&(self.stride as i32).to_le_bytes());
        buf[24..32].copy_from_slice(&self.dpi.x.to_le_bytes());
        buf[32..40].copy_from_slice(&self.dpi.y.to_le_bytes());
        buf
    }

    /// Read and validate a header, checking signature and version before
    /// anything else is interpreted.
    fn read_from<R: Read>(reader: &mut R, file_len: u64) -> Result<Self, RasterError> {
        let truncated = |e: io::Error| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                RasterError::Truncated { actual: file_len }
            } else {
                RasterError::Io(e)
            }
        };

        let mut buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut buf[0..4]).map_err(truncated)?;
        let signature = u32::from_le_bytes(word(&buf, 0));
        if signature != RASTER_SIGNATURE {
            return Err(RasterError::BadSignature { found: signature });
        }

        reader.read_exact(&mut buf[4..8]).map_err(truncated)?;
        let version = i32::from_le_bytes(word(&buf, 4));
        if version != RASTER_FORMAT_VERSION {
            return Err(RasterError::UnsupportedVersion { found: version });
        }

        reader.read_exact(&mut buf[8..]).map_err(truncated)?;
        let width = i32::from_le_bytes(word(&buf, 8));
        let height = i32::from_le_bytes(word(&buf, 12));
        let format_raw = i32::from_le_bytes(word(&buf, 16));
        let stride = i32::from_le_bytes(word(&buf, 20));
        let dpi = Dpi::new(
            f64::from_le_bytes(dword(&buf, 24)),
            f64::from_le_bytes(dword(&buf, 32)),
        );

        let (width, height) = checked_dimensions(i64::from(width), i64::from(height))?;
        let format =
            PixelFormat::from_wire(format_raw).ok_or(RasterError::UnknownPixelFormat(format_raw))?;
        let expected_stride = width as usize * format.bytes_per_pixel();
        if stride < 0 || stride as usize != expected_stride {
            return Err(RasterError::StrideMismatch {
                stride: i64::from(stride),
                width,
                format,
            });
        }

        let header = Self {
            width,
            height,
            format,
            stride: expected_stride,
            dpi,
        };
        if header.file_len() != file_len {
            return Err(RasterError::SizeMismatch {
                expected: header.file_len(),
                actual: file_len,
            });
        }
        Ok(header)
    }
}

fn word(buf: &[u8; HEADER_LEN], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn dword(buf: &[u8; HEADER_LEN], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn checked_dimensions(width: i64, height: i64) -> Result<(u32, u32), RasterError> {
    let valid = |v: i64| (1..=i64::from(MAX_DIMENSION)).contains(&v);
    if valid(width) && valid(height) {
        Ok((width as u32, height as u32))
    } else {
        Err(RasterError::InvalidDimensions { width, height })
    }
}

/// An in-memory pixel buffer with tightly packed rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    format: PixelFormat,
    dpi: Dpi,
    data: Vec<u8>,
}

impl Raster {
    /// A zero-filled raster.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, RasterError> {
        let (width, height) = checked_dimensions(i64::from(width), i64::from(height))?;
        let len = width as usize * format.bytes_per_pixel() * height as usize;
        Ok(Self {
            width,
            height,
            format,
            dpi: Dpi::default(),
            data: vec![0; len],
        })
    }

    pub fn from_pixels(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, RasterError> {
        let mut raster = Self::new(width, height, format)?;
        if data.len() != raster.data.len() {
            return Err(RasterError::BufferLength {
                expected: raster.data.len(),
                actual: data.len(),
            });
        }
        raster.data = data;
        Ok(raster)
    }

    /// A `Bgra32` raster filled with one colour, given as `[b, g, r, a]`.
    pub fn solid_bgra(width: u32, height: u32, bgra: [u8; 4]) -> Result<Self, RasterError> {
        let mut raster = Self::new(width, height, PixelFormat::Bgra32)?;
        for pixel in raster.data.chunks_exact_mut(4) {
            pixel.copy_from_slice(&bgra);
        }
        Ok(raster)
    }

    pub fn with_dpi(mut self, dpi: Dpi) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn dpi(&self) -> Dpi {
        self.dpi
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.stride();
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    pub fn header(&self) -> RasterHeader {
        RasterHeader {
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.stride(),
            dpi: self.dpi,
        }
    }
}

/// Write `raster` to `path`, replacing any existing file.
///
/// The file is sized up front so a full disk fails before any pixels are
/// written.
pub fn save(path: &Path, raster: &Raster) -> Result<(), RasterError> {
    let header = raster.header();
    let file = File::create(path)?;
    file.set_len(header.file_len())?;

    let mut writer = BufWriter::new(file);
    writer.write_all(&header.encode())?;
    for row in raster.data.chunks_exact(header.stride) {
        writer.write_all(row)?;
    }
    writer.flush()?;

    tracing::trace!(
        path = %path.display(),
        width = header.width,
        height = header.height,
        format = ?header.format,
        "Saved raster"
    );
    Ok(())
}

/// Read a raster file written by [`save`].
pub fn load(path: &Path) -> Result<Raster, RasterError> {
    let (header, mut reader) = open(path)?;

    let mut data = vec![0u8; header.payload_len()];
    for row in data.chunks_exact_mut(header.stride) {
        reader.read_exact(row).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                RasterError::Truncated {
                    actual: header.file_len(),
                }
            } else {
                RasterError::Io(e)
            }
        })?;
    }

    Ok(Raster {
        width: header.width,
        height: header.height,
        format: header.format,
        dpi: header.dpi,
        data,
    })
}

/// Read and validate only the header of a raster file.
pub fn inspect(path: &Path) -> Result<RasterHeader, RasterError> {
    open(path).map(|(header, _)| header)
}

fn open(path: &Path) -> Result<(RasterHeader, BufReader<File>), RasterError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            RasterError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            RasterError::Io(e)
        }
    })?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let header = RasterHeader::read_from(&mut reader, file_len)?;
    Ok((header, reader))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, format: PixelFormat) -> Raster {
        let len = width as usize * height as usize * format.bytes_per_pixel();
        let data = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        Raster::from_pixels(width, height, format, data).unwrap()
    }

    fn write_header_field(path: &Path, offset: usize, bytes: &[u8]) {
        let mut contents = std::fs::read(path).unwrap();
        contents[offset..offset + bytes.len()].copy_from_slice(bytes);
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn roundtrip_preserves_pixels_and_dpi() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            (1, 1, PixelFormat::Bgra32, Dpi::new(72.0, 72.0)),
            (3, 5, PixelFormat::Bgra32, Dpi::new(300.0, 150.5)),
            (17, 2, PixelFormat::Alpha8, Dpi::new(0.1 + 0.2, f64::MIN_POSITIVE)),
            (1, 9, PixelFormat::Alpha8, Dpi::default()),
        ];

        for (i, (width, height, format, dpi)) in cases.into_iter().enumerate() {
            let path = dir.path().join(format!("{i}.raster"));
            let raster = gradient(width, height, format).with_dpi(dpi);

            save(&path, &raster).unwrap();
            let loaded = load(&path).unwrap();

            assert_eq!(loaded.data(), raster.data());
            assert_eq!((loaded.width(), loaded.height()), (width, height));
            assert_eq!(loaded.format(), format);
            assert_eq!(loaded.dpi().x.to_bits(), dpi.x.to_bits());
            assert_eq!(loaded.dpi().y.to_bits(), dpi.y.to_bits());
        }
    }

    #[test]
    fn file_size_matches_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.raster");
        save(&path, &gradient(10, 3, PixelFormat::Bgra32)).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (HEADER_LEN + 10 * 4 * 3) as u64);

        let header = inspect(&path).unwrap();
        assert_eq!(header.stride, 40);
        assert_eq!(header.file_len(), len);
    }

    #[test]
    fn mutated_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.raster");
        save(&path, &gradient(2, 2, PixelFormat::Bgra32)).unwrap();
        write_header_field(&path, 4, &2i32.to_le_bytes());

        let err = load(&path).unwrap_err();
        assert!(matches!(err, RasterError::UnsupportedVersion { found: 2 }));
        assert!(err.is_corrupt());
        assert!(!err.is_not_found());
    }

    #[test]
    fn bad_signature_is_checked_before_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.raster");
        save(&path, &gradient(2, 2, PixelFormat::Bgra32)).unwrap();
        write_header_field(&path, 0, b"JUNK");
        write_header_field(&path, 8, &i32::MAX.to_le_bytes());

        assert!(matches!(
            load(&path).unwrap_err(),
            RasterError::BadSignature { .. }
        ));
    }

    #[test]
    fn stride_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stride.raster");
        save(&path, &gradient(4, 2, PixelFormat::Bgra32)).unwrap();
        write_header_field(&path, 20, &4i32.to_le_bytes());

        assert!(matches!(
            load(&path).unwrap_err(),
            RasterError::StrideMismatch { stride: 4, width: 4, .. }
        ));
    }

    #[test]
    fn size_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raster");
        save(&path, &gradient(4, 4, PixelFormat::Alpha8)).unwrap();
        let mut contents = std::fs::read(&path).unwrap();
        contents.pop();
        std::fs::write(&path, contents).unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(
            err,
            RasterError::SizeMismatch {
                expected: 56,
                actual: 55
            }
        ));
    }

    #[test]
    fn huge_dimensions_are_rejected_without_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.raster");
        save(&path, &gradient(1, 1, PixelFormat::Alpha8)).unwrap();
        write_header_field(&path, 8, &i32::MAX.to_le_bytes());

        assert!(matches!(
            load(&path).unwrap_err(),
            RasterError::InvalidDimensions { .. }
        ));
    }

    #[test]
    fn tiny_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.raster");
        std::fs::write(&path, b"FH").unwrap();
        assert!(matches!(
            load(&path).unwrap_err(),
            RasterError::Truncated { actual: 2 }
        ));
    }

    #[test]
    fn missing_file_is_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.raster")).unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_corrupt());
    }

    #[test]
    fn from_pixels_checks_length() {
        let err = Raster::from_pixels(2, 2, PixelFormat::Bgra32, vec![0; 15]).unwrap_err();
        assert!(matches!(
            err,
            RasterError::BufferLength {
                expected: 16,
                actual: 15
            }
        ));
    }

    #[test]
    fn zero_dimensions_are_invalid() {
        assert!(Raster::new(0, 4, PixelFormat::Alpha8).is_err());
        assert!(Raster::new(4, 0, PixelFormat::Bgra32).is_err());
    }

    #[test]
    fn rows_are_tightly_packed() {
        let raster = gradient(3, 2, PixelFormat::Bgra32);
        assert_eq!(raster.row(1).unwrap(), &raster.data()[12..24]);
        assert!(raster.row(2).is_none());
    }
}
