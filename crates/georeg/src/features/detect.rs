use std::cmp::Ordering;
use std::collections::HashSet;

use image::{imageops, GrayImage};
use imageproc::corners::{corners_fast9, Corner};

use super::FeatureConfig;

/// Radius of the intensity-centroid patch used for orientation.
const ORIENTATION_RADIUS: i32 = 15;

/// Keypoints closer than this to the border are discarded so that rotated
/// descriptor samples stay inside the image.
const BORDER_MARGIN: u32 = 20;

/// Oriented corner in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub response: f32,
    /// Orientation in radians.
    pub angle: f64,
}

/// FAST-9 corners of the image and of its mirror image, mapped back into the
/// image frame. `corners_fast9` misses corners of some orientations; the
/// mirrored pass picks those up.
fn fast9_both_handed(image: &GrayImage, threshold: u8) -> Vec<Corner> {
    let w = image.width();
    let mut corners = corners_fast9(image, threshold);
    let mirrored = imageops::flip_horizontal(image);
    corners.extend(
        corners_fast9(&mirrored, threshold)
            .into_iter()
            .map(|c| Corner {
                x: w - 1 - c.x,
                ..c
            }),
    );
    corners
}

/// FAST-9 corners, grid non-maximum suppression and intensity-centroid
/// orientation. Returns at most `config.max_keypoints`, strongest first.
pub fn detect_keypoints(image: &GrayImage, config: &FeatureConfig) -> Vec<Keypoint> {
    let (w, h) = image.dimensions();
    if w <= 2 * BORDER_MARGIN || h <= 2 * BORDER_MARGIN {
        return Vec::new();
    }
    let mut corners: Vec<_> = fast9_both_handed(image, config.fast_threshold)
        .into_iter()
        .filter(|c| {
            c.x >= BORDER_MARGIN
                && c.y >= BORDER_MARGIN
                && c.x < w - BORDER_MARGIN
                && c.y < h - BORDER_MARGIN
        })
        .collect();
    corners.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let cell = config.nms_cell_px.max(1.0);
    let mut occupied: HashSet<(i64, i64)> = HashSet::new();
    let mut keypoints = Vec::with_capacity(config.max_keypoints.min(corners.len()));
    for c in corners {
        let gx = (c.x as f64 / cell) as i64;
        let gy = (c.y as f64 / cell) as i64;
        let suppressed = (-1..=1).any(|dy| (-1..=1).any(|dx| occupied.contains(&(gx + dx, gy + dy))));
        if suppressed {
            continue;
        }
        occupied.insert((gx, gy));
        keypoints.push(Keypoint {
            x: c.x as f64,
            y: c.y as f64,
            response: c.score,
            angle: intensity_centroid_angle(image, c.x as i32, c.y as i32),
        });
        if keypoints.len() >= config.max_keypoints {
            break;
        }
    }
    keypoints
}

/// Orientation of the vector from the patch center to its intensity centroid.
fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32) -> f64 {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    let mut m01 = 0.0f64;
    let mut m10 = 0.0f64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        let py = y + dy;
        if py < 0 || py >= h {
            continue;
        }
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            let px = x + dx;
            if px < 0 || px >= w || dx * dx + dy * dy > r2 {
                continue;
            }
            let v = image.get_pixel(px as u32, py as u32)[0] as f64;
            m10 += v * dx as f64;
            m01 += v * dy as f64;
        }
    }
    m01.atan2(m10)
}
