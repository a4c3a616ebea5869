//! Frame annotation: one box and text label per track.

use ab_glyph::FontRef;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rollcall_core::BoundingBox;
use std::sync::OnceLock;

pub const KNOWN_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);
pub const TEXT_COLOUR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 2;
const LABEL_BAR_HEIGHT: i32 = 14;
const LABEL_PAD: i32 = 4;
const LABEL_SCALE: f32 = 12.0;
// Bar width per character when the font cannot be parsed.
const FALLBACK_CHAR_WIDTH: i32 = 7;

static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_BYTES) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unavailable; drawing bars without text");
            None
        }
    })
    .as_ref()
}

/// Draw a 2px box around `bbox` and a filled bar above it carrying `label`.
///
/// The bar moves inside the box when there is no room above.
pub fn draw_track(canvas: &mut RgbImage, bbox: &BoundingBox, label: &str, known: bool) {
    let (w, h) = canvas.dimensions();
    let b = bbox.clamp_to(w, h);
    let (x1, y1) = (b.x1.round() as i32, b.y1.round() as i32);
    let (x2, y2) = (b.x2.round() as i32, b.y2.round() as i32);
    if x2 <= x1 || y2 <= y1 {
        return;
    }
    let colour = if known { KNOWN_COLOUR } else { UNKNOWN_COLOUR };

    for inset in 0..BOX_THICKNESS {
        let (rw, rh) = (x2 - x1 - 2 * inset, y2 - y1 - 2 * inset);
        if rw <= 0 || rh <= 0 {
            break;
        }
        draw_hollow_rect_mut(canvas, Rect::at(x1 + inset, y1 + inset).of_size(rw as u32, rh as u32), colour);
    }

    let font = label_font();
    let text_w = match font {
        Some(font) => text_size(LABEL_SCALE, font, label).0 as i32,
        None => label.chars().count() as i32 * FALLBACK_CHAR_WIDTH,
    };
    let bar_w = (text_w + 2 * LABEL_PAD).min(w as i32 - x1);
    let bar_y = if y1 >= LABEL_BAR_HEIGHT { y1 - LABEL_BAR_HEIGHT } else { y1 };
    let bar_h = LABEL_BAR_HEIGHT.min(h as i32 - bar_y);
    if bar_w <= 0 || bar_h <= 0 {
        return;
    }
    draw_filled_rect_mut(canvas, Rect::at(x1, bar_y).of_size(bar_w as u32, bar_h as u32), colour);

    if let Some(font) = font {
        draw_text_mut(canvas, TEXT_COLOUR, x1 + LABEL_PAD, bar_y + 1, LABEL_SCALE, font, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pixels in the given region that have been blended towards white text.
    fn text_pixels(img: &RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> usize {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y).0[2] > 100)
            .count()
    }

    #[test]
    fn test_font_is_bundled() {
        assert!(label_font().is_some());
    }

    #[test]
    fn test_draws_box_and_bar() {
        let mut img = RgbImage::new(100, 100);
        draw_track(&mut img, &BoundingBox::new(20.0, 30.0, 60.0, 80.0), "Alice", true);

        // Outer and inner border lines.
        assert_eq!(*img.get_pixel(20, 50), KNOWN_COLOUR);
        assert_eq!(*img.get_pixel(21, 50), KNOWN_COLOUR);
        assert_eq!(*img.get_pixel(22, 50), Rgb([0, 0, 0]));
        // Label bar sits above the box, with the name written on it.
        assert_eq!(*img.get_pixel(22, 20), KNOWN_COLOUR);
        assert!(text_pixels(&img, 24..60, 16..30) > 0);
        assert_eq!(*img.get_pixel(40, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_longer_label_gets_wider_bar() {
        let mut short = RgbImage::new(200, 60);
        let mut long = RgbImage::new(200, 60);
        let bbox = BoundingBox::new(10.0, 20.0, 50.0, 50.0);
        draw_track(&mut short, &bbox, "Bo", true);
        draw_track(&mut long, &bbox, "Bartholomew", true);

        let bar_width = |img: &RgbImage| (0..200).filter(|&x| img.get_pixel(x, 7).0 != [0, 0, 0]).count();
        assert!(bar_width(&long) > bar_width(&short));
    }

    #[test]
    fn test_bar_moves_inside_at_top_edge() {
        let mut img = RgbImage::new(50, 50);
        draw_track(&mut img, &BoundingBox::new(5.0, 0.0, 45.0, 40.0), "Unknown", false);
        assert_eq!(*img.get_pixel(7, 5), UNKNOWN_COLOUR);
        assert!(text_pixels(&img, 9..45, 0..14) > 0);
    }

    #[test]
    fn test_degenerate_box_is_ignored() {
        let mut img = RgbImage::new(20, 20);
        draw_track(&mut img, &BoundingBox::new(30.0, 30.0, 40.0, 40.0), "x", true);
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}
