//! Camera frames and the weighting masks used to refine tip localization.

use serde::{Deserialize, Serialize};

use crate::geometry::PixelPoint;

/// Fixed-size 2-D intensity image returned by the imaging interface.
///
/// Pixels are stored row-major. `frame_number` is assigned by the camera and
/// survives masking, so a localizer can correlate derived frames with captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Driver-assigned monotonic frame number.
    pub frame_number: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row-major intensities, `width * height` long.
    pub pixels: Vec<f32>,
}

impl Frame {
    /// Zero-filled frame.
    pub fn blank(frame_number: u64, width: u32, height: u32) -> Self {
        Self {
            frame_number,
            width,
            height,
            pixels: vec![0.0; width as usize * height as usize],
        }
    }

    /// Intensity at column `x`, row `y`. Panics outside the frame.
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Sigma used for the refinement mask: (width / divisor, height / divisor)
    /// with integer division, never below one pixel.
    pub fn mask_sigma(&self, divisor: u32) -> (f64, f64) {
        let divisor = divisor.max(1);
        (
            f64::from((self.width / divisor).max(1)),
            f64::from((self.height / divisor).max(1)),
        )
    }

    /// Unnormalised Gaussian weights centred on `center`, same shape as `self`.
    pub fn gaussian_mask(&self, center: PixelPoint, sigma: (f64, f64)) -> Vec<f32> {
        let (sx, sy) = sigma;
        let mut mask = Vec::with_capacity(self.pixels.len());
        for y in 0..self.height {
            let dy = f64::from(y) - center.y;
            let wy = dy * dy / (2.0 * sy * sy);
            for x in 0..self.width {
                let dx = f64::from(x) - center.x;
                let wx = dx * dx / (2.0 * sx * sx);
                mask.push((-(wx + wy)).exp() as f32);
            }
        }
        mask
    }

    /// Elementwise product with a mask of the same shape.
    pub fn masked(&self, mask: &[f32]) -> Frame {
        let pixels = self
            .pixels
            .iter()
            .zip(mask.iter())
            .map(|(p, w)| p * w)
            .collect();
        Frame {
            frame_number: self.frame_number,
            width: self.width,
            height: self.height,
            pixels,
        }
    }

    /// Variance of the 4-neighbour Laplacian over the frame interior.
    ///
    /// Larger is sharper. Frames smaller than 3x3 score zero.
    pub fn laplacian_variance(&self) -> f64 {
        if self.width < 3 || self.height < 3 {
            return 0.0;
        }
        let mut responses = Vec::with_capacity((self.width as usize - 2) * (self.height as usize - 2));
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                let centre = f64::from(self.get(x, y));
                let lap = f64::from(self.get(x - 1, y))
                    + f64::from(self.get(x + 1, y))
                    + f64::from(self.get(x, y - 1))
                    + f64::from(self.get(x, y + 1))
                    - 4.0 * centre;
                responses.push(lap);
            }
        }
        let n = responses.len() as f64;
        let mean = responses.iter().sum::<f64>() / n;
        responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
    }
}
