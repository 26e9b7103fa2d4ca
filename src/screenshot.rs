use log::info;
use std::path::Path;

use crate::error::ScreenshotError;

/// Where row 0 of a readback sits on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOrigin {
    TopLeft,
    BottomLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba8,
    Bgra8,
}

impl PixelLayout {
    pub fn from_format(format: wgpu::TextureFormat) -> Option<Self> {
        match format {
            wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb => {
                Some(PixelLayout::Rgba8)
            }
            wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => {
                Some(PixelLayout::Bgra8)
            }
            _ => None,
        }
    }
}

/// Rows copied out of a texture must start on this alignment.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (unpadded + align - 1) / align * align
}

/// Raw pixels read back from a frame, tightly packed, in readback row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub origin: RowOrigin,
    pub pixels: Vec<u8>,
}

impl Capture {
    /// Strips the per-row padding a texture-to-buffer copy leaves behind.
    pub fn from_padded_rows(
        width: u32,
        height: u32,
        padded_row: u32,
        data: &[u8],
        layout: PixelLayout,
        origin: RowOrigin,
    ) -> Result<Self, ScreenshotError> {
        let expected = padded_row as usize * height as usize;
        if data.len() < expected {
            return Err(ScreenshotError::Size {
                expected,
                actual: data.len(),
            });
        }
        let row = width as usize * 4;
        let mut pixels = Vec::with_capacity(row * height as usize);
        for chunk in data.chunks(padded_row as usize).take(height as usize) {
            pixels.extend_from_slice(&chunk[..row]);
        }
        Ok(Capture {
            width,
            height,
            layout,
            origin,
            pixels,
        })
    }

    /// Top-down RGBA image of the capture.
    pub fn to_image(&self) -> Result<image::RgbaImage, ScreenshotError> {
        let expected = self.width as usize * self.height as usize * 4;
        if self.pixels.len() != expected {
            return Err(ScreenshotError::Size {
                expected,
                actual: self.pixels.len(),
            });
        }
        let mut pixels = self.pixels.clone();
        if self.layout == PixelLayout::Bgra8 {
            for px in pixels.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        let mut image = image::RgbaImage::from_raw(self.width, self.height, pixels).ok_or(
            ScreenshotError::Size {
                expected,
                actual: self.pixels.len(),
            },
        )?;
        if self.origin == RowOrigin::BottomLeft {
            image::imageops::flip_vertical_in_place(&mut image);
        }
        Ok(image)
    }

    /// Encodes the capture as PNG at `path`, replacing any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ScreenshotError> {
        let path = path.as_ref();
        self.to_image()?
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|source| ScreenshotError::Encode {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            "Wrote {}x{} screenshot to {}",
            self.width,
            self.height,
            path.display()
        );
        Ok(())
    }
}
