//! Image decoding and thumbnail generation

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;
use tessera_core::ThumbnailSize;

use crate::pipeline::Variant;
use crate::validator::ValidationError;

pub fn decode(data: &[u8]) -> Result<DynamicImage, ValidationError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| ValidationError::UndecodableImage(e.to_string()))?;
    let img = reader
        .decode()
        .map_err(|e| ValidationError::UndecodableImage(e.to_string()))?;

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ValidationError::UndecodableImage(
            "image has zero width or height".to_string(),
        ));
    }
    Ok(img)
}

/// Scale and center-crop to exactly `size`, encoded as PNG.
pub fn render(img: &DynamicImage, size: ThumbnailSize) -> Result<Variant, ValidationError> {
    let thumb = img.resize_to_fill(size.width, size.height, FilterType::Lanczos3);

    let mut buffer = Vec::new();
    thumb
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| ValidationError::EncodeFailed(e.to_string()))?;

    Ok(Variant {
        name: size.name(),
        data: buffer,
    })
}

/// Decode once and render every configured size.
pub fn thumbnails(data: &[u8], sizes: &[ThumbnailSize]) -> Result<Vec<Variant>, ValidationError> {
    let img = decode(data)?;
    sizes.iter().map(|size| render(&img, *size)).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut buffer = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn test_thumbnails_have_exact_dimensions() {
        let data = png_bytes(640, 480);
        let sizes = [ThumbnailSize::new(100, 100), ThumbnailSize::new(300, 200)];

        let variants = thumbnails(&data, &sizes).unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].name, "100x100");
        assert_eq!(variants[1].name, "300x200");

        for (variant, size) in variants.iter().zip(sizes.iter()) {
            assert_eq!(image::guess_format(&variant.data).unwrap(), ImageFormat::Png);
            let decoded = image::load_from_memory(&variant.data).unwrap();
            assert_eq!(decoded.dimensions(), (size.width, size.height));
        }
    }

    #[test]
    fn test_truncated_image_is_undecodable() {
        let data = png_bytes(64, 64);
        let truncated = &data[..data.len() / 2];
        assert!(matches!(
            decode(truncated),
            Err(ValidationError::UndecodableImage(_))
        ));
    }
}
