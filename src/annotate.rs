//! Detection overlay and JPEG encoding.
//!
//! `Annotator` is a pure function of (frame, detections): it never mutates the
//! input frame, so the same snapshot can be annotated for several viewers.
//! Labels use a built-in 5x7 bitmap font, so no font files are needed.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{ClassNames, Detection};
use crate::frame::Frame;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
/// Label baseline offset above the box, in pixels.
const LABEL_OFFSET: i32 = 10;

#[derive(Clone, Debug)]
pub struct Annotator {
    class_names: ClassNames,
    color: [u8; 3],
    text_color: [u8; 3],
    thickness: u32,
}

impl Annotator {
    pub fn new(class_names: ClassNames) -> Self {
        Self {
            class_names,
            color: [255, 0, 0],
            text_color: [255, 255, 255],
            thickness: 2,
        }
    }

    pub fn with_color(mut self, color: [u8; 3]) -> Self {
        self.color = color;
        self
    }

    pub fn with_thickness(mut self, thickness: u32) -> Self {
        self.thickness = thickness.max(1);
        self
    }

    pub fn class_names(&self) -> &ClassNames {
        &self.class_names
    }

    /// `"<label>: <confidence>"` with two decimals.
    pub fn label_text(&self, detection: &Detection) -> String {
        format!(
            "{}: {:.2}",
            self.class_names.label(detection.class_id),
            detection.confidence
        )
    }

    /// Copy of `frame` with every detection's box and label drawn on it.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> RgbImage {
        let mut image = frame.to_rgb_image();
        if image.width() == 0 || image.height() == 0 {
            return image;
        }
        for detection in detections {
            self.draw_box(&mut image, detection);
            self.draw_label(&mut image, detection);
        }
        image
    }

    pub fn annotate_frame(&self, frame: &Frame, detections: &[Detection]) -> Frame {
        Frame::from_rgb_image(self.annotate(frame, detections))
    }

    pub fn annotate_jpeg(
        &self,
        frame: &Frame,
        detections: &[Detection],
        quality: u8,
    ) -> Result<Vec<u8>> {
        encode_jpeg(&self.annotate(frame, detections), quality)
    }

    fn draw_box(&self, image: &mut RgbImage, detection: &Detection) {
        let bbox = detection.bbox.clamp_to(image.width(), image.height());
        for inset in 0..self.thickness as i32 {
            let width = bbox.width() - 2 * inset;
            let height = bbox.height() - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset)
                .of_size(width as u32 + 1, height as u32 + 1);
            draw_hollow_rect_mut(image, rect, Rgb(self.color));
        }
    }

    fn draw_label(&self, image: &mut RgbImage, detection: &Detection) {
        let text = self.label_text(detection);
        let bbox = detection.bbox.clamp_to(image.width(), image.height());
        let x = bbox.x1;
        let y = (bbox.y1 - LABEL_OFFSET).max(0);
        let text_width = text.chars().count() as i32 * GLYPH_ADVANCE + 1;

        let background = Rect::at(x, y).of_size(text_width as u32, GLYPH_HEIGHT as u32 + 2);
        draw_filled_rect_mut(image, background, Rgb(self.color));
        draw_text(image, x + 1, y + 1, &text, Rgb(self.text_color));
    }
}

/// Encode an image as baseline JPEG. `quality` is clamped to `1..=100`.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..GLYPH_WIDTH {
                    let px = x + col;
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn annotator() -> Annotator {
        Annotator::new(ClassNames::default())
    }

    #[test]
    fn label_uses_class_name_and_two_decimals() {
        let det = Detection::new(BoundingBox::new(0, 0, 5, 5), 0.876, 1);
        assert_eq!(annotator().label_text(&det), "rifle: 0.88");
    }

    #[test]
    fn draws_box_edges_without_touching_input() {
        let frame = Frame::solid(64, 64, [0, 0, 0]);
        let det = Detection::new(BoundingBox::new(10, 20, 40, 50), 0.9, 0);
        let image = annotator().annotate(&frame, &[det]);

        assert_eq!(image.get_pixel(25, 50), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(40, 35), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(25, 35), &Rgb([0, 0, 0]), "interior untouched");
        assert!(frame.pixels().iter().all(|b| *b == 0));
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() {
        let frame = Frame::solid(16, 16, [0, 0, 0]);
        let det = Detection::new(BoundingBox::new(-20, -20, 500, 500), 0.9, 3);
        let image = annotator().annotate(&frame, &[det]);
        assert_eq!(image.get_pixel(15, 15), &Rgb([255, 0, 0]));
    }

    #[test]
    fn no_detections_leaves_frame_unchanged() {
        let frame = Frame::solid(8, 8, [7, 8, 9]);
        assert_eq!(annotator().annotate_frame(&frame, &[]), frame);
    }

    #[test]
    fn jpeg_output_has_markers() {
        let frame = Frame::solid(16, 16, [100, 100, 100]);
        let jpeg = annotator().annotate_jpeg(&frame, &[], 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }
}
