//! Context-scaled face crops for the liveness models.
//!
//! Each model was trained on crops that extend the detector box by a fixed
//! context factor (2.7× for the texture model, 4.0× for the shape model)
//! around the box centre. Integer truncation is applied to width, height,
//! centre and shift exactly as the MiniFASNet training cropper does, so pixel
//! content matches the crops the models were trained on.
//!
//! Where the expanded rectangle leaves the frame, the frame is mirrored
//! (reflect-101, edge pixel not repeated) instead of sliding the rectangle
//! inward. The face therefore stays centred in every crop.

use crate::types::FaceBox;
use image::{imageops, RgbImage};

/// Smallest face box (and output crop) the extractor accepts, in pixels.
pub const MIN_CROP_SIZE: u32 = 32;

/// Largest crop side the extractor builds, as a multiple of the matching
/// image side.
pub const MAX_REGION_FACTOR: u64 = 8;

/// Integer crop rectangle in source-image coordinates. May extend past the
/// image on any side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub left: i64,
    pub top: i64,
    pub width: u32,
    pub height: u32,
}

impl CropRegion {
    /// Amount by which the region overflows `(image_width, image_height)`
    /// as `(left, top, right, bottom)`.
    pub fn overflow(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let right = self.left + self.width as i64;
        let bottom = self.top + self.height as i64;
        (
            (-self.left).max(0) as u32,
            (-self.top).max(0) as u32,
            (right - image_width as i64).max(0) as u32,
            (bottom - image_height as i64).max(0) as u32,
        )
    }

    pub fn fits_within(&self, image_width: u32, image_height: u32) -> bool {
        self.overflow(image_width, image_height) == (0, 0, 0, 0)
    }
}

/// Compute the scaled crop rectangle for `bbox`.
///
/// `shift_x` / `shift_y` are fractions of the box size, truncated to whole
/// pixels. The scale is never clamped to the image: clamping would make the
/// 2.7× and 4.0× crops identical for large faces.
///
/// Returns `None` when the rectangle cannot be represented in pixel
/// coordinates.
pub fn crop_region(bbox: &FaceBox, scale: f64, shift_x: f64, shift_y: f64) -> Option<CropRegion> {
    let box_width = bbox.width as i64;
    let box_height = bbox.height as i64;

    let shift_x_px = (box_width as f64 * shift_x) as i64;
    let shift_y_px = (box_height as f64 * shift_y) as i64;

    let new_width = (box_width as f64 * scale) as i64;
    let new_height = (box_height as f64 * scale) as i64;

    let center_x = (box_width / 2).checked_add(bbox.x as i64)?;
    let center_y = (box_height / 2).checked_add(bbox.y as i64)?;

    let left = center_x.checked_sub(new_width / 2)?.checked_add(shift_x_px)?;
    let top = center_y.checked_sub(new_height / 2)?.checked_add(shift_y_px)?;
    let width = u32::try_from(new_width.max(0)).ok()?;
    let height = u32::try_from(new_height.max(0)).ok()?;

    // overflow() and extract_region() index up to left + width.
    left.checked_add(width as i64)?;
    top.checked_add(height as i64)?;

    Some(CropRegion {
        left,
        top,
        width,
        height,
    })
}

/// Extract a `scale`× context crop centred on `bbox`.
///
/// Returns `None` when the box is smaller than [`MIN_CROP_SIZE`] on either
/// side, when the resulting crop would be, or when the crop is more than
/// [`MAX_REGION_FACTOR`] times the image on either side.
pub fn extract_crop(image: &RgbImage, bbox: &FaceBox, scale: f64) -> Option<RgbImage> {
    extract_shifted_crop(image, bbox, scale, 0.0, 0.0)
}

/// [`extract_crop`] with the crop centre offset by a fraction of the box size.
pub fn extract_shifted_crop(
    image: &RgbImage,
    bbox: &FaceBox,
    scale: f64,
    shift_x: f64,
    shift_y: f64,
) -> Option<RgbImage> {
    let min = MIN_CROP_SIZE as f32;
    if bbox.width < min || bbox.height < min {
        return None;
    }
    if image.width() == 0 || image.height() == 0 {
        return None;
    }

    let Some(region) = crop_region(bbox, scale, shift_x, shift_y) else {
        tracing::debug!(?bbox, scale, "crop region out of range");
        return None;
    };
    if region.width < MIN_CROP_SIZE || region.height < MIN_CROP_SIZE {
        return None;
    }
    if region.width as u64 > MAX_REGION_FACTOR * image.width() as u64
        || region.height as u64 > MAX_REGION_FACTOR * image.height() as u64
    {
        tracing::warn!(
            region_width = region.width,
            region_height = region.height,
            image_width = image.width(),
            image_height = image.height(),
            "crop region too large for frame"
        );
        return None;
    }

    Some(extract_region(image, &region))
}

/// Copy `region` out of `image`, mirroring the image wherever the region
/// overflows it.
pub fn extract_region(image: &RgbImage, region: &CropRegion) -> RgbImage {
    let (w, h) = image.dimensions();

    if region.fits_within(w, h) {
        return imageops::crop_imm(
            image,
            region.left as u32,
            region.top as u32,
            region.width,
            region.height,
        )
        .to_image();
    }

    let (pad_left, pad_top, pad_right, pad_bottom) = region.overflow(w, h);
    tracing::trace!(
        pad_left,
        pad_top,
        pad_right,
        pad_bottom,
        "reflect-padding crop region"
    );

    RgbImage::from_fn(region.width, region.height, |cx, cy| {
        let sx = reflect_101(region.left + cx as i64, w);
        let sy = reflect_101(region.top + cy as i64, h);
        *image.get_pixel(sx, sy)
    })
}

/// Map a possibly out-of-range coordinate into `[0, len)` by mirroring
/// about the edge pixels without repeating them (`dcb|abcd|cba`).
///
/// Overflows larger than the image are folded periodically.
pub fn reflect_101(index: i64, len: u32) -> u32 {
    if len <= 1 {
        return 0;
    }
    let n = len as i64;
    let period = 2 * (n - 1);
    let mut i = index.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    i as u32
}

/// Plain crop of `bbox` clamped to the image bounds, used when the scaled
/// crops cannot be produced.
pub fn clamped_crop(image: &RgbImage, bbox: &FaceBox) -> Option<RgbImage> {
    let (img_w, img_h) = (image.width() as i64, image.height() as i64);
    let x = bbox.x as i64;
    let y = bbox.y as i64;
    let w = bbox.width as i64;
    let h = bbox.height as i64;

    let x1 = x.max(0);
    let y1 = y.max(0);
    let x2 = x.saturating_add(w).min(img_w);
    let y2 = y.saturating_add(h).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    Some(
        imageops::crop_imm(
            image,
            x1 as u32,
            y1 as u32,
            (x2 - x1) as u32,
            (y2 - y1) as u32,
        )
        .to_image(),
    )
}
