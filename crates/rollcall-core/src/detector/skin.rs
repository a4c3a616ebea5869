//! Model-free fallback detector: skin-chroma blobs on a coarse cell grid.
//!
//! Classifies pixels with a fixed YCbCr skin range, marks grid cells that are
//! mostly skin, and reports 4-connected cell groups with a face-like aspect
//! ratio. Crude, but needs no model files and is always available.

use super::{DetectorBackend, DetectorError};
use crate::types::{BoundingBox, Detection};
use image::RgbImage;

const CELL_SIZE: u32 = 8;
const CELL_SKIN_RATIO: f32 = 0.5;
const MIN_BLOB_CELLS: usize = 6;
const MIN_ASPECT: f32 = 0.4;
const MAX_ASPECT: f32 = 1.6;
/// Blobs covering more than this share of the frame are treated as background.
const MAX_FRAME_SHARE: f32 = 0.5;

const CB_RANGE: (f32, f32) = (77.0, 127.0);
const CR_RANGE: (f32, f32) = (133.0, 173.0);

#[derive(Debug, Default)]
pub struct SkinToneBackend;

impl DetectorBackend for SkinToneBackend {
    fn name(&self) -> &'static str {
        "skin-tone"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let grid = SkinGrid::build(image);
        let frame_cells = (grid.cols * grid.rows) as f32;

        let detections = grid
            .blobs()
            .into_iter()
            .filter_map(|blob| {
                let (bw, bh) = (blob.col_span(), blob.row_span());
                let aspect = bw as f32 / bh as f32;
                let box_cells = (bw * bh) as f32;
                if blob.cells < MIN_BLOB_CELLS
                    || !(MIN_ASPECT..=MAX_ASPECT).contains(&aspect)
                    || box_cells / frame_cells > MAX_FRAME_SHARE
                {
                    return None;
                }
                let bbox = BoundingBox::new(
                    (blob.min_col * CELL_SIZE) as f32,
                    (blob.min_row * CELL_SIZE) as f32,
                    ((blob.max_col + 1) * CELL_SIZE) as f32,
                    ((blob.max_row + 1) * CELL_SIZE) as f32,
                )
                .clamp_to(image.width(), image.height());
                Some(Detection::new(bbox, blob.cells as f32 / box_cells))
            })
            .collect();

        Ok(detections)
    }
}

fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (CB_RANGE.0..=CB_RANGE.1).contains(&cb) && (CR_RANGE.0..=CR_RANGE.1).contains(&cr)
}

struct SkinGrid {
    cols: u32,
    rows: u32,
    skin: Vec<bool>,
}

struct Blob {
    cells: usize,
    min_col: u32,
    max_col: u32,
    min_row: u32,
    max_row: u32,
}

impl Blob {
    fn col_span(&self) -> u32 {
        self.max_col - self.min_col + 1
    }

    fn row_span(&self) -> u32 {
        self.max_row - self.min_row + 1
    }
}

impl SkinGrid {
    fn build(image: &RgbImage) -> Self {
        let cols = image.width().div_ceil(CELL_SIZE);
        let rows = image.height().div_ceil(CELL_SIZE);
        let mut counts = vec![(0u32, 0u32); (cols * rows) as usize];

        for (x, y, px) in image.enumerate_pixels() {
            let cell = &mut counts[((y / CELL_SIZE) * cols + x / CELL_SIZE) as usize];
            cell.1 += 1;
            if is_skin(px.0[0], px.0[1], px.0[2]) {
                cell.0 += 1;
            }
        }

        let skin = counts
            .into_iter()
            .map(|(s, total)| total > 0 && s as f32 / total as f32 >= CELL_SKIN_RATIO)
            .collect();

        Self { cols, rows, skin }
    }

    /// 4-connected components of skin cells, in scan order of their first cell.
    fn blobs(&self) -> Vec<Blob> {
        let mut seen = vec![false; self.skin.len()];
        let mut blobs = Vec::new();
        let mut stack = Vec::new();

        for start in 0..self.skin.len() {
            if !self.skin[start] || seen[start] {
                continue;
            }
            seen[start] = true;
            stack.push(start);

            let (c0, r0) = (start as u32 % self.cols, start as u32 / self.cols);
            let mut blob = Blob {
                cells: 0,
                min_col: c0,
                max_col: c0,
                min_row: r0,
                max_row: r0,
            };

            while let Some(idx) = stack.pop() {
                let (c, r) = (idx as u32 % self.cols, idx as u32 / self.cols);
                blob.cells += 1;
                blob.min_col = blob.min_col.min(c);
                blob.max_col = blob.max_col.max(c);
                blob.min_row = blob.min_row.min(r);
                blob.max_row = blob.max_row.max(r);

                let neighbors = [
                    (c > 0).then(|| idx - 1),
                    (c + 1 < self.cols).then(|| idx + 1),
                    (r > 0).then(|| idx - self.cols as usize),
                    (r + 1 < self.rows).then(|| idx + self.cols as usize),
                ];
                for n in neighbors.into_iter().flatten() {
                    if self.skin[n] && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }

            blobs.push(blob);
        }

        blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const SKIN: Rgb<u8> = Rgb([224, 172, 150]);
    const BACKGROUND: Rgb<u8> = Rgb([20, 40, 200]);

    fn paint(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
        for yy in y..y + h {
            for xx in x..x + w {
                image.put_pixel(xx, yy, color);
            }
        }
    }

    #[test]
    fn test_skin_classifier() {
        assert!(is_skin(SKIN.0[0], SKIN.0[1], SKIN.0[2]));
        assert!(!is_skin(BACKGROUND.0[0], BACKGROUND.0[1], BACKGROUND.0[2]));
        assert!(!is_skin(0, 0, 0));
    }

    #[test]
    fn test_detects_face_sized_blob() {
        let mut image = RgbImage::from_pixel(320, 240, BACKGROUND);
        paint(&mut image, 96, 80, 64, 80, SKIN);

        let dets = SkinToneBackend.detect(&image).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(96.0, 80.0, 160.0, 160.0));
        assert!((dets[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_thin_strip() {
        let mut image = RgbImage::from_pixel(320, 240, BACKGROUND);
        paint(&mut image, 0, 100, 320, 16, SKIN);
        assert!(SkinToneBackend.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_full_frame() {
        let image = RgbImage::from_pixel(160, 160, SKIN);
        assert!(SkinToneBackend.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn test_two_separate_blobs() {
        let mut image = RgbImage::from_pixel(320, 240, BACKGROUND);
        paint(&mut image, 16, 16, 40, 48, SKIN);
        paint(&mut image, 200, 120, 40, 48, SKIN);
        assert_eq!(SkinToneBackend.detect(&image).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_image() {
        assert!(SkinToneBackend.detect(&RgbImage::new(0, 0)).unwrap().is_empty());
    }
}
