//! RGB888 frame buffer and the gray-card region math used by the
//! calibration loops.

use thiserror::Error;

/// Side length of the sampled gray-card window, in pixels.
pub const GRAY_CARD_ROI_PX: u32 = 100;

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("focus window coordinates must satisfy 0.0 <= x1 < x2 <= 1.0 and 0.0 <= y1 < y2 <= 1.0")]
    InvalidWindow,
    #[error("frame buffer length {actual} does not match {width}x{height} RGB888")]
    BufferMismatch { width: u32, height: u32, actual: usize },
}

/// Pixel-space rectangle, inclusive origin, exclusive extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::BufferMismatch {
                width,
                height,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Per-channel means over `region`, clamped to the frame bounds.
    pub fn region_mean_rgb(&self, region: Region) -> (f64, f64, f64) {
        let x_end = (region.x + region.width).min(self.width);
        let y_end = (region.y + region.height).min(self.height);
        let x_start = region.x.min(x_end);
        let y_start = region.y.min(y_end);

        let mut sums = [0u64; 3];
        let mut count = 0u64;
        for y in y_start..y_end {
            for x in x_start..x_end {
                let offset = (y as usize * self.width as usize + x as usize) * 3;
                sums[0] += u64::from(self.data[offset]);
                sums[1] += u64::from(self.data[offset + 1]);
                sums[2] += u64::from(self.data[offset + 2]);
                count += 1;
            }
        }

        if count == 0 {
            return (0.0, 0.0, 0.0);
        }
        (
            sums[0] as f64 / count as f64,
            sums[1] as f64 / count as f64,
            sums[2] as f64 / count as f64,
        )
    }

    /// Unweighted mean of the three channel means over the gray-card
    /// region, on the 0-255 luma scale the exposure search targets.
    pub fn gray_card_brightness(&self) -> f64 {
        let (r, g, b) = self.region_mean_rgb(gray_card_region(self.width, self.height));
        (r + g + b) / 3.0
    }
}

/// The gray-card window: 100x100 px, horizontally centered, placed 6/7
/// down the frame. Chosen empirically so the sample lands on the
/// reference gray target instead of sky or background.
pub fn gray_card_region(width: u32, height: u32) -> Region {
    let half = GRAY_CARD_ROI_PX / 2;
    let cy = height * 6 / 7;
    let cx = width / 2;

    let x = cx.saturating_sub(half);
    let y = cy.saturating_sub(half);
    Region {
        x,
        y,
        width: (cx + half).min(width) - x,
        height: (cy + half).min(height) - y,
    }
}

/// Convert a normalized focus window to pixel coordinates.
pub fn focus_window(
    width: u32,
    height: u32,
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
) -> Result<Region, FrameError> {
    if !(0.0..1.0).contains(&x1) || !(0.0..1.0).contains(&y1) || x2 <= x1 || y2 <= y1 || x2 > 1.0
        || y2 > 1.0
    {
        return Err(FrameError::InvalidWindow);
    }

    let x = (x1 * f64::from(width)) as u32;
    let y = (y1 * f64::from(height)) as u32;
    Ok(Region {
        x,
        y,
        width: (x2 * f64::from(width)) as u32 - x,
        height: (y2 * f64::from(height)) as u32 - y,
    })
}
