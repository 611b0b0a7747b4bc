//! Post-processing applied to a helper's result raster.
//!
//! Some plugins write pixels outside the selection or clobber the alpha
//! channel. The helper records which fix-ups are needed with
//! `SetPostProcessingOptions`; the controller applies them after loading the
//! result, since only the controller still holds the original source and mask.

use std::fmt;

use crate::raster::{PixelFormat, Raster};

/// Bit set sent as a 4-byte little-endian word on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PostProcessingFlags(u32);

impl PostProcessingFlags {
    pub const NONE: Self = Self(0);
    /// Blend the result back over the source using the selection mask.
    pub const CLIP_TO_MASK: Self = Self(1 << 0);
    /// Copy the source alpha channel over the result's.
    pub const RESTORE_ALPHA: Self = Self(1 << 1);

    const KNOWN: u32 = Self::CLIP_TO_MASK.0 | Self::RESTORE_ALPHA.0;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits this build does not know how to apply.
    pub const fn unknown_bits(self) -> u32 {
        self.0 & !Self::KNOWN
    }
}

impl std::ops::BitOr for PostProcessingFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for PostProcessingFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PostProcessError {
    #[error("result is {result_width}x{result_height} but source is {source_width}x{source_height}")]
    DimensionMismatch {
        result_width: u32,
        result_height: u32,
        source_width: u32,
        source_height: u32,
    },

    #[error("expected {expected:?} raster, got {actual:?}")]
    WrongFormat {
        expected: PixelFormat,
        actual: PixelFormat,
    },
}

/// Apply `flags` to `result` in place.
///
/// `CLIP_TO_MASK` without a mask is a no-op: with no selection the whole
/// image is editable.
pub fn apply(
    flags: PostProcessingFlags,
    result: &mut Raster,
    source: &Raster,
    mask: Option<&Raster>,
) -> Result<(), PostProcessError> {
    if flags.unknown_bits() != 0 {
        tracing::warn!(
            unknown = %format!("0x{:08x}", flags.unknown_bits()),
            "Ignoring unknown post-processing flags"
        );
    }
    if flags.is_empty() {
        return Ok(());
    }

    expect_format(result, PixelFormat::Bgra32)?;
    expect_format(source, PixelFormat::Bgra32)?;
    expect_same_size(result, source)?;

    if flags.contains(PostProcessingFlags::RESTORE_ALPHA) {
        for (dst, src) in result
            .data_mut()
            .chunks_exact_mut(4)
            .zip(source.data().chunks_exact(4))
        {
            dst[3] = src[3];
        }
    }

    if flags.contains(PostProcessingFlags::CLIP_TO_MASK)
        && let Some(mask) = mask
    {
        expect_format(mask, PixelFormat::Alpha8)?;
        expect_same_size(mask, source)?;
        for ((dst, src), &coverage) in result
            .data_mut()
            .chunks_exact_mut(4)
            .zip(source.data().chunks_exact(4))
            .zip(mask.data())
        {
            match coverage {
                255 => {}
                0 => dst.copy_from_slice(src),
                c => {
                    let c = u32::from(c);
                    for (d, &s) in dst.iter_mut().zip(src) {
                        let blended = (u32::from(*d) * c + u32::from(s) * (255 - c) + 127) / 255;
                        *d = blended as u8;
                    }
                }
            }
        }
    }

    Ok(())
}

fn expect_format(raster: &Raster, expected: PixelFormat) -> Result<(), PostProcessError> {
    if raster.format() == expected {
        Ok(())
    } else {
        Err(PostProcessError::WrongFormat {
            expected,
            actual: raster.format(),
        })
    }
}

fn expect_same_size(result: &Raster, source: &Raster) -> Result<(), PostProcessError> {
    if result.width() == source.width() && result.height() == source.height() {
        Ok(())
    } else {
        Err(PostProcessError::DimensionMismatch {
            result_width: result.width(),
            result_height: result.height(),
            source_width: source.width(),
            source_height: source.height(),
        })
    }
}
