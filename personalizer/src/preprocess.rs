use image::{ColorType, DynamicImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

use crate::{
    PersonalizeErr, Result,
    artifact::{ImageConstraint, PixelFormat},
};

/// How an image whose dimensions differ from the model's input gets resized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Scales each axis independently, ignoring the aspect ratio.
    #[default]
    Stretch,
    /// Scales keeping the aspect ratio and crops the overflow around the center.
    CenterCrop,
}

fn color_of(format: PixelFormat) -> ColorType {
    match format {
        PixelFormat::Rgb8 => ColorType::Rgb8,
        PixelFormat::Gray8 => ColorType::L8,
    }
}

/// Converts `image` to the constraint's pixel format and then resizes it to its dimensions.
///
/// An image that already conforms is returned unchanged, so conforming twice is the same as
/// conforming once.
pub fn conform(image: &DynamicImage, constraint: ImageConstraint, mode: ResizeMode) -> DynamicImage {
    let converted = if image.color() == color_of(constraint.format) {
        image.clone()
    } else {
        match constraint.format {
            PixelFormat::Rgb8 => DynamicImage::ImageRgb8(image.to_rgb8()),
            PixelFormat::Gray8 => DynamicImage::ImageLuma8(image.to_luma8()),
        }
    };

    let (width, height) = (constraint.width, constraint.height);
    if converted.width() == width && converted.height() == height {
        return converted;
    }

    match mode {
        ResizeMode::Stretch => converted.resize_exact(width, height, FilterType::Triangle),
        ResizeMode::CenterCrop => converted.resize_to_fill(width, height, FilterType::Triangle),
    }
}

/// Checks that `image` matches `constraint` exactly.
///
/// # Returns
/// `ConstraintMismatch` describing both sides if it doesn't.
pub fn validate(image: &DynamicImage, constraint: ImageConstraint) -> Result<()> {
    let fits = image.width() == constraint.width
        && image.height() == constraint.height
        && image.color() == color_of(constraint.format);

    if !fits {
        return Err(PersonalizeErr::ConstraintMismatch {
            expected: constraint.to_string(),
            got: format!("{}x{} {:?}", image.width(), image.height(), image.color()),
        });
    }

    Ok(())
}

/// Average pools a conforming image into a `(columns, rows)` grid of cells.
///
/// # Arguments
/// * `image` - An image matching `constraint`.
/// * `constraint` - The model's input constraint.
/// * `grid` - The amount of cells per axis.
///
/// # Returns
/// The mean of every channel of every cell scaled to `[0, 1]`, row after row.
pub fn features(image: &DynamicImage, constraint: ImageConstraint, grid: (u32, u32)) -> Result<Vec<f32>> {
    validate(image, constraint)?;

    let (cols, rows) = grid;
    if cols == 0 || rows == 0 || cols > constraint.width || rows > constraint.height {
        return Err(PersonalizeErr::ConstraintMismatch {
            expected: constraint.to_string(),
            got: format!("a {cols}x{rows} pooling grid"),
        });
    }

    let (w, h) = (constraint.width as usize, constraint.height as usize);
    let (cols, rows) = (cols as usize, rows as usize);
    let channels = constraint.format.channels();
    let bytes = image.as_bytes();

    let mut out = Vec::with_capacity(cols * rows * channels);
    for r in 0..rows {
        let (y0, y1) = (r * h / rows, (r + 1) * h / rows);

        for c in 0..cols {
            let (x0, x1) = (c * w / cols, (c + 1) * w / cols);
            let area = ((y1 - y0) * (x1 - x0)) as f32;

            for k in 0..channels {
                let mut sum = 0u64;
                for y in y0..y1 {
                    let row = y * w;
                    for x in x0..x1 {
                        sum += bytes[(row + x) * channels + k] as u64;
                    }
                }

                out.push(sum as f32 / (area * 255.));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    const GRAY: ImageConstraint = ImageConstraint {
        width: 8,
        height: 8,
        format: PixelFormat::Gray8,
    };

    #[test]
    fn conforming_is_idempotent() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 10, Rgb([10, 200, 30])));

        for mode in [ResizeMode::Stretch, ResizeMode::CenterCrop] {
            let once = conform(&image, GRAY, mode);
            let twice = conform(&once, GRAY, mode);

            validate(&once, GRAY).unwrap();
            assert_eq!(once.as_bytes(), twice.as_bytes());
        }
    }

    #[test]
    fn conforming_images_are_left_untouched() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_fn(8, 8, |x, y| Luma([(x * 8 + y) as u8])));
        let conformed = conform(&image, GRAY, ResizeMode::Stretch);
        assert_eq!(conformed.as_bytes(), image.as_bytes());
    }

    #[test]
    fn validation_reports_both_sides() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(4, 8));
        let err = validate(&image, GRAY).unwrap_err();

        match err {
            PersonalizeErr::ConstraintMismatch { expected, got } => {
                assert_eq!(expected, "8x8 gray8");
                assert!(got.starts_with("4x8"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn pooling_averages_each_cell() {
        // Left half black, right half white.
        let image = DynamicImage::ImageLuma8(GrayImage::from_fn(8, 8, |x, _| {
            Luma([if x < 4 { 0 } else { 255 }])
        }));

        assert_eq!(features(&image, GRAY, (2, 1)).unwrap(), [0., 1.]);
        assert_eq!(features(&image, GRAY, (1, 1)).unwrap(), [0.5]);
    }
}
