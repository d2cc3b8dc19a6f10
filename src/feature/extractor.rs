//! Feature-extraction interface.
//!
//! Pyramid construction and ORB computation are supplied by the caller; the
//! engine only requires aligned keypoints and 256-bit descriptors.

use super::{Descriptor, KeyPoint};
use crate::error::{Error, Result};

/// A grayscale input image. The engine never inspects pixel content beyond
/// emptiness checks; the buffer exists to be handed to the extractor.
#[derive(Debug, Clone)]
pub struct Image {
    pub cols: u32,
    pub rows: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(cols: u32, rows: u32, data: Vec<u8>) -> Self {
        Self { cols, rows, data }
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0 || self.data.is_empty()
    }

    /// Reject images the extractor cannot process.
    pub fn check(&self, expected_cols: u32, expected_rows: u32) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InputInvalid("empty image".into()));
        }
        if self.cols != expected_cols || self.rows != expected_rows {
            return Err(Error::InputInvalid(format!(
                "image size {}x{} does not match configured {}x{}",
                self.cols, self.rows, expected_cols, expected_rows
            )));
        }
        Ok(())
    }
}

/// A registered depth map aligned with the gray image (meters; ≤ 0 means no
/// measurement).
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub cols: u32,
    pub rows: u32,
    pub data: Vec<f32>,
}

impl DepthImage {
    pub fn new(cols: u32, rows: u32, data: Vec<f32>) -> Self {
        Self { cols, rows, data }
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0 || self.data.is_empty()
    }

    /// Depth at the nearest pixel, if measured.
    pub fn depth_at(&self, x: f64, y: f64) -> Option<f64> {
        let col = x.round() as i64;
        let row = y.round() as i64;
        if col < 0 || row < 0 || col >= self.cols as i64 || row >= self.rows as i64 {
            return None;
        }
        let depth = self.data[row as usize * self.cols as usize + col as usize] as f64;
        (depth > 0.0).then_some(depth)
    }
}

/// Extraction output: keypoints with aligned descriptors.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Supplies keypoints + descriptors for an input image.
///
/// `timestamp` identifies the frame; synthetic extractors used in tests key
/// their output on it.
pub trait FeatureExtractor: Send {
    fn extract(
        &mut self,
        image: &Image,
        timestamp: f64,
        mask: Option<&Image>,
    ) -> Result<Features>;

    /// For stereo setups: extract from the right image of the pair.
    fn extract_right(
        &mut self,
        image: &Image,
        timestamp: f64,
        mask: Option<&Image>,
    ) -> Result<Features> {
        self.extract(image, timestamp, mask)
    }
}
