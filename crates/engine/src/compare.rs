//! Visual regression testing with screenshot comparison
//!
//! Comparison is a pure function of its inputs: the same candidate, baseline
//! and options always produce the same [`Comparison`].

use std::collections::VecDeque;
use std::io::Cursor;

use image::{ImageFormat, Pixel, Rgba, RgbaImage};
use tracing::{debug, warn};

use visreg_common::blob::digest;
use visreg_common::{
    BoundingBox, ComparisonFailure, ComparisonResult, DiffMetadata, Dimensions, Error, Result,
    TargetKey,
};

/// Default pass threshold on the similarity score
pub const DEFAULT_THRESHOLD: f64 = 0.95;

/// Default per-channel delta tolerated before a pixel counts as changed
pub const DEFAULT_PIXEL_TOLERANCE: u8 = 5;

const HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 0, 255]);
const CLUSTER_OUTLINE: Rgba<u8> = Rgba([255, 0, 255, 255]);

/// Comparison parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareOptions {
    /// Pass iff similarity >= threshold
    pub threshold: f64,
    /// Max per-channel difference treated as noise (anti-aliasing, compression)
    pub pixel_tolerance: u8,
}

impl CompareOptions {
    pub fn new(threshold: f64, pixel_tolerance: u8) -> Result<Self> {
        validate_threshold(threshold)?;
        Ok(Self {
            threshold,
            pixel_tolerance,
        })
    }
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            pixel_tolerance: DEFAULT_PIXEL_TOLERANCE,
        }
    }
}

pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
        return Err(Error::InvalidConfig(format!(
            "threshold {} outside [0, 1]",
            threshold
        )));
    }
    Ok(())
}

/// A decoded image together with the digest of its encoded form
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub digest: String,
    pub image: RgbaImage,
}

impl DecodedImage {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?.to_rgba8();
        Ok(Self {
            digest: digest(bytes),
            image,
        })
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }
}

/// Comparison outcome plus the rendered diff image on failure
#[derive(Debug, Clone)]
pub struct Comparison {
    pub result: ComparisonResult,
    /// Candidate copy with changed pixels highlighted; present only on a
    /// below-threshold failure
    pub diff_image: Option<RgbaImage>,
}

/// Compare two encoded images.
///
/// Byte-identical inputs skip decoding of pixel data entirely.
pub fn compare_encoded(
    key: &TargetKey,
    candidate: &[u8],
    baseline: &[u8],
    options: &CompareOptions,
) -> Result<Comparison> {
    if candidate == baseline {
        debug!("{}: screenshots match exactly (same bytes)", key);
        let total = image_dimensions(candidate)?.pixel_count();
        let digest = digest(candidate);
        return Ok(Comparison {
            result: ComparisonResult {
                key: key.clone(),
                similarity: 1.0,
                threshold: options.threshold,
                passed: true,
                failure: None,
                metadata: DiffMetadata {
                    total_pixels: total,
                    ..Default::default()
                },
                candidate_digest: digest.clone(),
                baseline_digest: digest,
                baseline_version: None,
                diff_image: None,
            },
            diff_image: None,
        });
    }

    let candidate = DecodedImage::decode(candidate)?;
    let baseline = DecodedImage::decode(baseline)?;
    Ok(compare(key, &candidate, &baseline, options))
}

/// Compare a decoded candidate against a decoded baseline
pub fn compare(
    key: &TargetKey,
    candidate: &DecodedImage,
    baseline: &DecodedImage,
    options: &CompareOptions,
) -> Comparison {
    let candidate_dims = candidate.dimensions();
    let baseline_dims = baseline.dimensions();

    let mut result = ComparisonResult {
        key: key.clone(),
        similarity: 0.0,
        threshold: options.threshold,
        passed: false,
        failure: None,
        metadata: DiffMetadata::default(),
        candidate_digest: candidate.digest.clone(),
        baseline_digest: baseline.digest.clone(),
        baseline_version: None,
        diff_image: None,
    };

    if candidate_dims != baseline_dims {
        warn!(
            "{}: screenshot dimensions differ: candidate {} vs baseline {}",
            key, candidate_dims, baseline_dims
        );
        result.failure = Some(ComparisonFailure::DimensionMismatch {
            candidate: candidate_dims,
            baseline: baseline_dims,
        });
        return Comparison {
            result,
            diff_image: None,
        };
    }

    let mask = diff_mask(&candidate.image, &baseline.image, options.pixel_tolerance);
    let diff_pixels = mask.iter().filter(|&&changed| changed).count() as u64;
    let total_pixels = candidate_dims.pixel_count();

    let similarity = if total_pixels == 0 {
        1.0
    } else {
        1.0 - diff_pixels as f64 / total_pixels as f64
    };
    let passed = similarity >= options.threshold;

    let clusters = if diff_pixels > 0 {
        find_clusters(&mask, candidate_dims.width, candidate_dims.height)
    } else {
        ClusterSummary::default()
    };

    result.similarity = similarity;
    result.passed = passed;
    result.metadata = DiffMetadata {
        diff_pixels,
        total_pixels,
        cluster_count: clusters.count,
        largest_cluster: clusters.largest,
        largest_cluster_pixels: clusters.largest_pixels,
    };

    let diff_image = if passed {
        None
    } else {
        warn!(
            "Visual regression detected in '{}': similarity {:.4} (threshold: {:.4}), {} pixels differ",
            key, similarity, options.threshold, diff_pixels
        );
        result.failure = Some(ComparisonFailure::BelowThreshold {
            similarity,
            threshold: options.threshold,
        });
        Some(render_diff(&candidate.image, &mask, clusters.largest))
    };

    Comparison { result, diff_image }
}

/// Check if two pixels differ beyond the tolerance on any channel
fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>, tolerance: u8) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(&x, &y)| x.abs_diff(y) > tolerance)
}

/// Row-major changed-pixel mask for two same-size images
fn diff_mask(a: &RgbaImage, b: &RgbaImage, tolerance: u8) -> Vec<bool> {
    a.pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| pixels_differ(pa, pb, tolerance))
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct ClusterSummary {
    count: usize,
    largest: Option<BoundingBox>,
    largest_pixels: u64,
}

/// 8-connected components over the changed-pixel mask.
///
/// Ties keep the first cluster found in row-major order.
fn find_clusters(mask: &[bool], width: u32, height: u32) -> ClusterSummary {
    let (w, h) = (width as usize, height as usize);
    let mut seen = vec![false; mask.len()];
    let mut queue = VecDeque::new();
    let mut summary = ClusterSummary::default();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }

        summary.count += 1;
        seen[start] = true;
        queue.push_back(start);

        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut pixels = 0u64;

        while let Some(idx) = queue.pop_front() {
            let (x, y) = (idx % w, idx / w);
            pixels += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for dy in [-1isize, 0, 1] {
                for dx in [-1isize, 0, 1] {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as isize + dx;
                    let ny = y as isize + dy;
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if mask[n] && !seen[n] {
                        seen[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }

        if pixels > summary.largest_pixels {
            summary.largest_pixels = pixels;
            summary.largest = Some(BoundingBox {
                x: min_x as u32,
                y: min_y as u32,
                width: (max_x - min_x + 1) as u32,
                height: (max_y - min_y + 1) as u32,
            });
        }
    }

    summary
}

/// Candidate copy: changed pixels in red, unchanged dimmed, largest cluster outlined
fn render_diff(candidate: &RgbaImage, mask: &[bool], largest: Option<BoundingBox>) -> RgbaImage {
    let mut diff = candidate.clone();
    for (pixel, &changed) in diff.pixels_mut().zip(mask) {
        if changed {
            *pixel = HIGHLIGHT;
        } else {
            let c = pixel.channels();
            *pixel = Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 255]);
        }
    }

    if let Some(bbox) = largest {
        let (x0, y0) = (bbox.x, bbox.y);
        let (x1, y1) = (bbox.x + bbox.width - 1, bbox.y + bbox.height - 1);
        for x in x0..=x1 {
            diff.put_pixel(x, y0, CLUSTER_OUTLINE);
            diff.put_pixel(x, y1, CLUSTER_OUTLINE);
        }
        for y in y0..=y1 {
            diff.put_pixel(x0, y, CLUSTER_OUTLINE);
            diff.put_pixel(x1, y, CLUSTER_OUTLINE);
        }
    }

    diff
}

/// Pixel size of an encoded image, read from its header only
pub fn image_dimensions(bytes: &[u8]) -> Result<Dimensions> {
    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()?;
    Ok(Dimensions::new(width, height))
}

/// Pixel size of an encoded image after decoding every pixel.
///
/// Unlike [`image_dimensions`] this rejects truncated or corrupt data.
pub fn decoded_dimensions(bytes: &[u8]) -> Result<Dimensions> {
    let image = image::load_from_memory(bytes)?;
    Ok(Dimensions::new(image.width(), image.height()))
}

/// Encode an image as PNG
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
