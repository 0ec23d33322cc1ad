//! Invisible provenance watermarking.
//!
//! The encoder sits behind [`Watermarker`] so a different codec can be
//! plugged in; the bundled codec stores a length-prefixed payload in the
//! least significant bit of the blue channel, row-major. [`extract`] is the
//! matching decoder, used for provenance checks and tests.

use image::RgbImage;

use crate::error::{Error, Result};

/// Byte string identifying images produced by this tool.
pub const DEFAULT_PAYLOAD: &[u8] = b"txt2img-rs";

const LENGTH_BITS: usize = 32;

/// Applies (or skips) the invisible watermark.
pub struct Watermarker {
    payload: Option<Vec<u8>>,
}

impl Watermarker {
    /// A watermarker that passes images through untouched.
    pub fn disabled() -> Self {
        Self { payload: None }
    }

    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.payload.is_some()
    }

    /// Embed the payload, or return the image unchanged when disabled.
    pub fn apply(&self, image: RgbImage) -> Result<RgbImage> {
        match &self.payload {
            None => Ok(image),
            Some(payload) => {
                let mut image = image;
                embed(&mut image, payload)?;
                Ok(image)
            }
        }
    }
}

fn capacity_bytes(image: &RgbImage) -> usize {
    let pixels = image.width() as usize * image.height() as usize;
    pixels.saturating_sub(LENGTH_BITS) / 8
}

/// Write `payload` into the blue-channel LSBs of `image`, preceded by a
/// 32-bit big-endian byte count.
pub fn embed(image: &mut RgbImage, payload: &[u8]) -> Result<()> {
    let capacity = capacity_bytes(image);
    if payload.len() > capacity {
        return Err(Error::WatermarkCapacity {
            payload: payload.len(),
            capacity,
        });
    }

    let length = payload.len() as u32;
    let bits = (0..LENGTH_BITS)
        .map(|i| (length >> (LENGTH_BITS - 1 - i)) & 1 == 1)
        .chain(
            payload
                .iter()
                .flat_map(|byte| (0..8).map(move |i| (byte >> (7 - i)) & 1 == 1)),
        );
    for (pixel, bit) in image.pixels_mut().zip(bits) {
        pixel.0[2] = (pixel.0[2] & !1) | u8::from(bit);
    }
    Ok(())
}

/// Recover a payload previously written by [`embed`].
pub fn extract(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bits = image.pixels().map(|pixel| pixel.0[2] & 1);
    let mut length = 0u32;
    for _ in 0..LENGTH_BITS {
        let bit = bits.next().ok_or(Error::WatermarkMissing)?;
        length = (length << 1) | u32::from(bit);
    }
    if length as usize > capacity_bytes(image) {
        return Err(Error::WatermarkMissing);
    }

    let mut payload = Vec::with_capacity(length as usize);
    for _ in 0..length {
        let mut byte = 0u8;
        for _ in 0..8 {
            let bit = bits.next().ok_or(Error::WatermarkMissing)?;
            byte = (byte << 1) | bit;
        }
        payload.push(byte);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn disabled_watermarker_is_pixel_identical() {
        let image = gradient(32, 32);
        let out = Watermarker::disabled().apply(image.clone()).unwrap();
        assert_eq!(out.as_raw(), image.as_raw());
    }

    #[test]
    fn payload_round_trips() {
        let image = gradient(64, 64);
        let out = Watermarker::new(DEFAULT_PAYLOAD).apply(image).unwrap();
        assert_eq!(extract(&out).unwrap(), DEFAULT_PAYLOAD);
    }

    #[test]
    fn embedding_preserves_dimensions_and_high_bits() {
        let image = gradient(48, 32);
        let out = Watermarker::new(b"mark".to_vec()).apply(image.clone()).unwrap();
        assert_eq!(out.dimensions(), image.dimensions());
        for (before, after) in image.pixels().zip(out.pixels()) {
            assert_eq!(before.0[0], after.0[0]);
            assert_eq!(before.0[1], after.0[1]);
            assert_eq!(before.0[2] & !1, after.0[2] & !1);
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut image = gradient(4, 4);
        let err = embed(&mut image, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::WatermarkCapacity { .. }));
    }

    #[test]
    fn extract_without_watermark_fails() {
        // All-zero LSBs decode to a zero-length payload; a saturated image
        // instead claims an impossible length.
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        assert!(matches!(extract(&image), Err(Error::WatermarkMissing)));
    }
}
