//! Tiered derivative rendering.
//!
//! Each call is idempotent: source dimensions are read once from the header,
//! the derivative's mtime is compared with the source's, and work is only
//! done when the derivative is missing or older than its source.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{modified_time, write_atomic, SidecarStore, Tier};
use crate::error::FolioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn longer_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    /// A new derivative was written.
    Generated,
    /// The existing derivative is at least as new as its source.
    Fresh,
    /// The tier does not exist for this source (full tier of a small image).
    NotApplicable,
}

/// Outcome of a generation call.
#[derive(Debug, Clone)]
pub struct Rendition {
    pub tier: Tier,
    pub status: GenerationStatus,
    /// Oriented source dimensions.
    pub source: Dimensions,
    /// Derivative file; `None` when the tier is not applicable.
    pub path: Option<PathBuf>,
}

/// EXIF orientation tag (1-8), 1 when absent or unreadable.
fn read_orientation(path: &Path) -> u32 {
    let Ok(file) = File::open(path) else {
        return 1;
    };
    let mut reader = BufReader::new(file);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) else {
        return 1;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .filter(|o| (1..=8).contains(o))
        .unwrap_or(1)
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Header-only dimension read, swapped for quarter-turn orientations.
fn read_dimensions(path: &Path, orientation: u32) -> Result<Dimensions, FolioError> {
    let decode_err = |message: String| FolioError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let (width, height) = ImageReader::open(path)
        .map_err(|e| decode_err(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| decode_err(e.to_string()))?
        .into_dimensions()
        .map_err(|e| decode_err(e.to_string()))?;
    if orientation >= 5 {
        Ok(Dimensions { width: height, height: width })
    } else {
        Ok(Dimensions { width, height })
    }
}

fn decode(path: &Path, orientation: u32) -> Result<DynamicImage, FolioError> {
    let img = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| FolioError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .decode()
        .map_err(|e| FolioError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(apply_orientation(img, orientation))
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut bytes = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
        encoder.encode_image(&rgb).context("JPEG encoding failed")?;
    }
    Ok(bytes)
}

impl SidecarStore {
    /// A derivative is fresh when it exists and is not older than its source.
    pub fn is_fresh(&self, tier: Tier, file_name: &str) -> Result<bool> {
        let derivative = self.derivative_path(tier, file_name);
        if !derivative.is_file() {
            return Ok(false);
        }
        let source = modified_time(&self.source_path(file_name))?;
        Ok(modified_time(&derivative)? >= source)
    }

    /// Whether a source of these dimensions gets a full-size tier at all.
    pub fn has_full_tier(&self, dims: Dimensions) -> bool {
        dims.longer_edge() > self.config.preview_max_edge
    }

    pub fn generate(&self, tier: Tier, file_name: &str) -> Result<Rendition> {
        let source_path = self.source_path(file_name);
        let source_mtime = modified_time(&source_path)?;
        let orientation = read_orientation(&source_path);
        let dims = read_dimensions(&source_path, orientation)?;
        let target = self.derivative_path(tier, file_name);

        if tier == Tier::Full && !self.has_full_tier(dims) {
            // A replaced source may have shrunk below the threshold.
            if target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("Failed to remove stale {}", target.display()))?;
            }
            return Ok(Rendition {
                tier,
                status: GenerationStatus::NotApplicable,
                source: dims,
                path: None,
            });
        }

        if target.is_file() && modified_time(&target)? >= source_mtime {
            return Ok(Rendition {
                tier,
                status: GenerationStatus::Fresh,
                source: dims,
                path: Some(target),
            });
        }

        let img = decode(&source_path, orientation)?;
        let bytes = self.render(tier, &img, dims)?;
        write_atomic(&target, &bytes)?;
        debug!("Generated {:?} for {}", tier, file_name);

        Ok(Rendition {
            tier,
            status: GenerationStatus::Generated,
            source: dims,
            path: Some(target),
        })
    }

    fn render(&self, tier: Tier, img: &DynamicImage, dims: Dimensions) -> Result<Vec<u8>> {
        let config = &self.config;
        match tier {
            Tier::Thumbnail => {
                let size = config.thumbnail_size;
                let thumb = img.resize_to_fill(size, size, FilterType::Triangle);
                encode_jpeg(&thumb, config.thumbnail_quality)
            }
            Tier::Standard => {
                let max_edge = config.preview_max_edge;
                if dims.longer_edge() > max_edge {
                    let resized = img.resize(max_edge, max_edge, FilterType::Lanczos3);
                    encode_jpeg(&resized, config.preview_quality)
                } else {
                    // No resize loss, so spend the bits on quality instead.
                    encode_jpeg(img, config.preview_quality_small)
                }
            }
            Tier::Full => encode_jpeg(img, config.full_quality),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DerivativeConfig;
    use std::time::{Duration, SystemTime};

    fn create_jpeg(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 241) as u8, ((x * 7 + y * 13) % 256) as u8])
        });
        img.save(path).unwrap();
    }

    fn store_with(files: &[(&str, u32, u32)]) -> (tempfile::TempDir, SidecarStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, w, h) in files {
            create_jpeg(&dir.path().join(name), *w, *h);
        }
        let store = SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_thumbnail_is_square_crop() {
        let (_dir, store) = store_with(&[("wide.jpg", 900, 300)]);
        let rendition = store.generate(Tier::Thumbnail, "wide.jpg").unwrap();

        assert_eq!(rendition.status, GenerationStatus::Generated);
        assert_eq!(rendition.source, Dimensions { width: 900, height: 300 });
        let thumb = image::open(rendition.path.unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (256, 256));
    }

    #[test]
    fn test_regeneration_of_unchanged_source_is_noop() {
        let (_dir, store) = store_with(&[("a.jpg", 400, 300)]);
        let first = store.generate(Tier::Thumbnail, "a.jpg").unwrap();
        let path = first.path.unwrap();
        let mtime_before = fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let second = store.generate(Tier::Thumbnail, "a.jpg").unwrap();

        assert_eq!(second.status, GenerationStatus::Fresh);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), mtime_before);
        assert!(store.is_fresh(Tier::Thumbnail, "a.jpg").unwrap());
    }

    #[test]
    fn test_stale_derivative_is_regenerated() {
        let (dir, store) = store_with(&[("a.jpg", 400, 300)]);
        let path = store.generate(Tier::Thumbnail, "a.jpg").unwrap().path.unwrap();

        // Age the derivative behind its source
        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(!store.is_fresh(Tier::Thumbnail, "a.jpg").unwrap());

        let again = store.generate(Tier::Thumbnail, "a.jpg").unwrap();
        assert_eq!(again.status, GenerationStatus::Generated);
        assert!(store.is_fresh(Tier::Thumbnail, "a.jpg").unwrap());
        drop(dir);
    }

    #[test]
    fn test_standard_preview_limits_longer_edge() {
        let (_dir, store) = store_with(&[("big.jpg", 3000, 2000), ("small.jpg", 800, 600)]);

        let big = store.generate(Tier::Standard, "big.jpg").unwrap();
        let img = image::open(big.path.unwrap()).unwrap();
        assert_eq!(img.width(), 1600);
        assert!((1066..=1067).contains(&img.height()));

        let small = store.generate(Tier::Standard, "small.jpg").unwrap();
        let img = image::open(small.path.unwrap()).unwrap();
        assert_eq!((img.width(), img.height()), (800, 600));
    }

    #[test]
    fn test_full_tier_only_for_large_sources() {
        let (_dir, store) = store_with(&[("big.jpg", 3000, 2000), ("small.jpg", 800, 600)]);

        let small = store.generate(Tier::Full, "small.jpg").unwrap();
        assert_eq!(small.status, GenerationStatus::NotApplicable);
        assert!(small.path.is_none());
        assert!(store.existing_derivative(Tier::Full, "small.jpg").is_none());

        let full = store.generate(Tier::Full, "big.jpg").unwrap();
        let standard = store.generate(Tier::Standard, "big.jpg").unwrap();
        let full_path = full.path.unwrap();
        let img = image::open(&full_path).unwrap();
        assert_eq!((img.width(), img.height()), (3000, 2000));
        assert!(
            fs::metadata(&full_path).unwrap().len()
                > fs::metadata(standard.path.unwrap()).unwrap().len()
        );
    }

    #[test]
    fn test_corrupt_source_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();
        let store = SidecarStore::open(dir.path(), &DerivativeConfig::default()).unwrap();

        let err = store.generate(Tier::Thumbnail, "broken.jpg").unwrap_err();
        assert!(err.downcast_ref::<FolioError>().is_some());
        assert!(store.existing_derivative(Tier::Thumbnail, "broken.jpg").is_none());
    }

    #[test]
    fn test_orientation_swaps_quarter_turns() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::new(40, 10));
        let rotated = apply_orientation(img, 6);
        assert_eq!((rotated.width(), rotated.height()), (10, 40));
    }
}
