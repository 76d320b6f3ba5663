//! Scale separation guard.
//!
//! When a face fills a large share of the frame, both the 2.7× and 4.0×
//! context crops run off the same image edges and end up mirroring the same
//! pixels, so the two models see nearly identical input. Downsampling the
//! whole frame until the largest face side equals a fixed fraction of the
//! original frame's shorter side keeps the two crop scales visibly distinct.

use crate::types::FaceDetection;
use fast_image_resize as fr;
use image::RgbImage;
use serde::Deserialize;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResizeError {
    #[error("resize source: {0}")]
    Source(#[from] fr::ImageBufferError),
    #[error("resize failed: {0}")]
    Resize(#[from] fr::ResizeError),
    #[error("resized buffer does not match {0}x{1}")]
    Buffer(u32, u32),
}

/// Downsampling policy for frames with oversized faces.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScaleSeparation {
    /// Target largest-face side, as a fraction of the input frame's shorter side.
    pub target_ratio: f32,
    /// Frames are never downsampled below this width.
    pub min_width: u32,
    /// Frames are never downsampled below this height.
    pub min_height: u32,
}

impl Default for ScaleSeparation {
    fn default() -> Self {
        Self {
            target_ratio: 0.20,
            min_width: 240,
            min_height: 180,
        }
    }
}

impl ScaleSeparation {
    /// Downsample `image` (and every valid box in `detections`) so that the
    /// largest face side shrinks to `target_ratio` of the input's shorter side.
    ///
    /// Returns the input unchanged when no face is too large, or when the
    /// downsampled frame would fall below the minimum size.
    pub fn ensure_separation<'a>(
        &self,
        image: &'a RgbImage,
        detections: &[FaceDetection],
    ) -> (Cow<'a, RgbImage>, Vec<FaceDetection>) {
        let (w, h) = image.dimensions();
        let max_face_dim = detections
            .iter()
            .filter_map(|d| d.bbox.as_ref().ok())
            .map(|b| b.max_side())
            .fold(0.0f32, f32::max);

        let min_dim = w.min(h);
        if max_face_dim <= 0.0 || min_dim == 0 {
            return (Cow::Borrowed(image), detections.to_vec());
        }

        let current_ratio = max_face_dim / min_dim as f32;
        if current_ratio <= self.target_ratio {
            return (Cow::Borrowed(image), detections.to_vec());
        }

        let factor = self.target_ratio / current_ratio;
        let new_w = (w as f32 * factor) as u32;
        let new_h = (h as f32 * factor) as u32;

        if new_w < self.min_width || new_h < self.min_height {
            tracing::warn!(
                width = w,
                height = h,
                new_width = new_w,
                new_height = new_h,
                face_px = max_face_dim,
                ratio = current_ratio,
                "scale separation: cannot downsample further; texture and shape crops may coincide"
            );
            return (Cow::Borrowed(image), detections.to_vec());
        }

        tracing::info!(
            width = w,
            height = h,
            new_width = new_w,
            new_height = new_h,
            factor,
            face_px = max_face_dim,
            ratio = current_ratio,
            "scale separation: downsampling frame"
        );

        let resized = match resize_area(image, new_w, new_h) {
            Ok(resized) => resized,
            Err(e) => {
                tracing::warn!(error = %e, "scale separation: downsampling failed; keeping original frame");
                return (Cow::Borrowed(image), detections.to_vec());
            }
        };
        let scaled = detections
            .iter()
            .map(|d| FaceDetection {
                bbox: d.bbox.clone().map(|b| b.scaled(factor)),
                ..d.clone()
            })
            .collect();

        (Cow::Owned(resized), scaled)
    }
}

/// Downsample with a box filter, so every output pixel is the mean of the
/// source pixels it covers.
pub fn resize_area(image: &RgbImage, new_w: u32, new_h: u32) -> Result<RgbImage, ResizeError> {
    let (src_w, src_h) = image.dimensions();
    if new_w == 0 || new_h == 0 || src_w == 0 || src_h == 0 {
        return Ok(RgbImage::new(new_w, new_h));
    }

    let src = fr::images::ImageRef::new(src_w, src_h, image.as_raw(), fr::PixelType::U8x3)?;
    let mut dst = fr::images::Image::new(new_w, new_h, fr::PixelType::U8x3);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
    resizer.resize(&src, &mut dst, Some(&options))?;

    RgbImage::from_raw(new_w, new_h, dst.into_vec()).ok_or(ResizeError::Buffer(new_w, new_h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoxError, FaceBox};
    use image::Rgb;

    fn detection(x: f32, y: f32, w: f32, h: f32) -> FaceDetection {
        FaceDetection::new(FaceBox::new(x, y, w, h).unwrap())
    }

    #[test]
    fn test_small_faces_untouched() {
        let img = RgbImage::new(640, 480);
        let dets = vec![detection(10.0, 10.0, 90.0, 90.0)];
        let (out, out_dets) = ScaleSeparation::default().ensure_separation(&img, &dets);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out_dets, dets);
    }

    #[test]
    fn test_large_face_downsamples_to_target_ratio() {
        let img = RgbImage::new(1280, 960);
        let dets = vec![detection(100.0, 100.0, 400.0, 300.0), detection(800.0, 50.0, 100.0, 100.0)];
        let (out, out_dets) = ScaleSeparation::default().ensure_separation(&img, &dets);

        // ratio = 400 / 960; factor = 0.2 / ratio = 0.48
        assert_eq!(out.dimensions(), (614, 460));
        let largest = out_dets[0].bbox.as_ref().unwrap();
        assert!((largest.width - 0.2 * 960.0).abs() < 0.05);
        let other = out_dets[1].bbox.as_ref().unwrap();
        assert!((other.x - 384.0).abs() < 0.01);
        assert!((other.width - 48.0).abs() < 0.01);
    }

    #[test]
    fn test_refuses_below_minimum_size() {
        let img = RgbImage::new(320, 240);
        let dets = vec![detection(60.0, 20.0, 200.0, 200.0)];
        let (out, out_dets) = ScaleSeparation::default().ensure_separation(&img, &dets);
        assert_eq!(out.dimensions(), (320, 240));
        assert_eq!(out_dets, dets);
    }

    #[test]
    fn test_invalid_boxes_pass_through() {
        let img = RgbImage::new(1280, 960);
        let mut bad = detection(0.0, 0.0, 1.0, 1.0);
        bad.bbox = Err(BoxError::Missing);
        let dets = vec![bad.clone(), detection(0.0, 0.0, 480.0, 480.0)];
        let (_, out_dets) = ScaleSeparation::default().ensure_separation(&img, &dets);
        assert_eq!(out_dets[0].bbox, Err(BoxError::Missing));
        assert!(out_dets[1].bbox.as_ref().unwrap().width < 480.0);
    }

    #[test]
    fn test_metadata_preserved_on_rescale() {
        let img = RgbImage::new(1280, 960);
        let mut meta = serde_json::Map::new();
        meta.insert("name".into(), serde_json::json!("alice"));
        let dets = vec![detection(0.0, 0.0, 480.0, 480.0).with_track_id(4).with_metadata(meta.clone())];
        let (_, out_dets) = ScaleSeparation::default().ensure_separation(&img, &dets);
        assert_eq!(out_dets[0].track_id, Some(4));
        assert_eq!(out_dets[0].metadata, meta);
    }

    #[test]
    fn test_resize_area_averages_blocks() {
        // 4x2 image: left half 0, right half 200 → 2x1 output [0, 200]
        let img = RgbImage::from_fn(4, 2, |x, _| if x < 2 { Rgb([0, 0, 0]) } else { Rgb([200, 200, 200]) });
        let out = resize_area(&img, 2, 1).unwrap();
        assert_eq!(out.dimensions(), (2, 1));
        assert!(out.get_pixel(0, 0)[0] <= 1);
        assert!(out.get_pixel(1, 0)[0] >= 199);
    }

    #[test]
    fn test_resize_area_mixes_neighbouring_columns() {
        let img = RgbImage::from_fn(3, 1, |x, _| Rgb([[0, 90, 180][x as usize]; 3]));
        let out = resize_area(&img, 2, 1).unwrap();
        let (left, right) = (out.get_pixel(0, 0)[0], out.get_pixel(1, 0)[0]);
        assert!(left < 90 && right > 90);
        assert!(left < right);
    }

    #[test]
    fn test_resize_area_keeps_mean_brightness() {
        let img = RgbImage::from_fn(640, 480, |x, y| {
            let v = ((x + y) % 2 * 200) as u8;
            Rgb([v, v, v])
        });
        let out = resize_area(&img, 307, 230).unwrap();
        let mean = out.as_raw().iter().map(|&v| v as f32).sum::<f32>() / out.as_raw().len() as f32;
        assert!((mean - 100.0).abs() < 3.0, "mean {mean}");
    }

    #[test]
    fn test_resize_area_empty_target() {
        let img = RgbImage::new(10, 10);
        assert_eq!(resize_area(&img, 0, 5).unwrap().dimensions(), (0, 5));
    }
}
