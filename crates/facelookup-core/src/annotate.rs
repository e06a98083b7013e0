//! Draws face boxes and labels onto a copy of the input image.

use crate::config::AnnotationConfig;
use crate::matcher::ConfidenceTier;
use crate::pipeline::{FaceOutcome, RecognizedFace};
use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BANNER_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const PAD: u32 = 3;

enum TextRenderer {
    TrueType { font: FontArc, scale: PxScale },
    /// Built-in 3x5 glyphs, each dot drawn as a `scale` x `scale` square.
    Bitmap { scale: u32 },
}

impl TextRenderer {
    fn size(&self, text: &str) -> (u32, u32) {
        match self {
            Self::TrueType { font, scale } => text_size(*scale, font, text),
            Self::Bitmap { scale } => {
                let chars = text.chars().count() as u32;
                ((chars * 4).saturating_sub(1) * scale, 5 * scale)
            }
        }
    }

    fn draw(&self, canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
        match self {
            Self::TrueType { font, scale } => draw_text_mut(canvas, color, x, y, *scale, font, text),
            Self::Bitmap { scale } => {
                let s = *scale as i32;
                for (i, c) in text.chars().enumerate() {
                    let origin = x + i as i32 * 4 * s;
                    for (row, bits) in glyph(c).iter().enumerate() {
                        for col in 0..3 {
                            if bits & (0b100 >> col) != 0 {
                                let rect = Rect::at(origin + col * s, y + row as i32 * s).of_size(*scale, *scale);
                                draw_filled_rect_mut(canvas, rect, color);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Renders recognition outcomes for human review.
pub struct Annotator {
    config: AnnotationConfig,
    text: TextRenderer,
}

impl Annotator {
    /// Uses the configured TrueType font when it loads, the bitmap font otherwise.
    pub fn new(config: AnnotationConfig) -> Self {
        let text = match &config.font_path {
            Some(path) => match std::fs::read(path).map_err(|e| e.to_string()).and_then(|bytes| {
                FontArc::try_from_vec(bytes).map_err(|e| e.to_string())
            }) {
                Ok(font) => {
                    tracing::debug!(path = %path.display(), "annotation font loaded");
                    TextRenderer::TrueType {
                        font,
                        scale: PxScale::from(config.font_size),
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot load annotation font, using built-in");
                    bitmap(config.font_size)
                }
            },
            None => bitmap(config.font_size),
        };
        Self { config, text }
    }

    /// Return an annotated RGB copy of `image`.
    pub fn annotate(&self, image: &DynamicImage, faces: &[RecognizedFace]) -> RgbImage {
        let mut canvas = image.to_rgb8();
        for face in faces {
            self.draw_face(&mut canvas, face);
        }
        if self.config.draw_summary {
            let recognized = faces.iter().filter(|f| f.outcome.is_known()).count();
            let summary = format!("Faces: {} | Recognized: {}", faces.len(), recognized);
            let (tw, th) = self.text.size(&summary);
            fill(&mut canvas, 0, 0, tw + 4 * PAD, th + 2 * PAD, BANNER_COLOR);
            self.text.draw(&mut canvas, TEXT_COLOR, 2 * PAD as i32, PAD as i32, &summary);
        }
        canvas
    }

    fn color(&self, outcome: &FaceOutcome) -> Rgb<u8> {
        let rgb = match outcome {
            FaceOutcome::Known { tier, .. } => match tier {
                ConfidenceTier::Excellent | ConfidenceTier::Good => self.config.known_color,
                ConfidenceTier::Fair | ConfidenceTier::Reject => self.config.weak_color,
            },
            FaceOutcome::Unknown { .. } => self.config.unknown_color,
            FaceOutcome::Error { .. } => self.config.error_color,
        };
        Rgb(rgb)
    }

    fn draw_face(&self, canvas: &mut RgbImage, face: &RecognizedFace) {
        let color = self.color(&face.outcome);
        let b = face.bbox;
        let thickness = if face.outcome.is_known() { 3 } else { 2 };
        for i in 0..thickness {
            if b.width > 2 * i && b.height > 2 * i {
                let rect = Rect::at((b.x + i) as i32, (b.y + i) as i32).of_size(b.width - 2 * i, b.height - 2 * i);
                draw_hollow_rect_mut(canvas, rect, color);
            }
        }

        let label = label_for(&face.outcome);
        let (tw, th) = self.text.size(&label);
        let bar_h = th + 2 * PAD;
        let bar_y = b.bottom().saturating_sub(bar_h).max(b.y);
        fill(canvas, b.x, bar_y, b.width.max(tw + 2 * PAD), bar_h, color);
        self.text
            .draw(canvas, TEXT_COLOR, (b.x + PAD) as i32, (bar_y + PAD) as i32, &label);

        let index = format!("#{}", face.face_index + 1);
        let (iw, ih) = self.text.size(&index);
        let tag_h = ih + 2 * PAD;
        let tag_y = if b.y >= tag_h { b.y - tag_h } else { b.y };
        fill(canvas, b.x, tag_y, iw + 2 * PAD, tag_h, color);
        self.text
            .draw(canvas, TEXT_COLOR, (b.x + PAD) as i32, (tag_y + PAD) as i32, &index);
    }
}

fn bitmap(font_size: f32) -> TextRenderer {
    TextRenderer::Bitmap {
        scale: ((font_size / 8.0).round() as u32).max(1),
    }
}

fn fill(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    if w > 0 && h > 0 {
        draw_filled_rect_mut(canvas, Rect::at(x as i32, y as i32).of_size(w, h), color);
    }
}

/// "Name (87.5%) - EMP001" for known faces.
fn label_for(outcome: &FaceOutcome) -> String {
    match outcome {
        FaceOutcome::Known {
            identity, confidence, ..
        } => {
            let mut label = format!("{} ({:.1}%)", identity.name, confidence);
            if let Some(emp) = &identity.metadata.employee_id {
                label.push_str(" - ");
                label.push_str(emp);
            }
            label
        }
        FaceOutcome::Unknown { .. } => "Unknown".to_string(),
        FaceOutcome::Error { .. } => "Error".to_string(),
    }
}

/// Rows of a 3x5 glyph, top to bottom, most significant bit on the left.
/// Lowercase renders as uppercase; anything unsupported renders as `?`.
fn glyph(c: char) -> [u8; 5] {
    match c.to_ascii_uppercase() {
        'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'M' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'N' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'Q' => [0b010, 0b101, 0b101, 0b110, 0b011],
        'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'W' => [0b101, 0b101, 0b111, 0b111, 0b101],
        'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b110, 0b001, 0b010, 0b100, 0b111],
        '3' => [0b110, 0b001, 0b010, 0b001, 0b110],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b110, 0b001, 0b110],
        '6' => [0b011, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b010, 0b010, 0b010],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b110],
        ' ' => [0, 0, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0b010],
        ',' => [0, 0, 0, 0b010, 0b100],
        '-' => [0, 0, 0b111, 0, 0],
        '+' => [0, 0b010, 0b111, 0b010, 0],
        '(' => [0b001, 0b010, 0b010, 0b010, 0b001],
        ')' => [0b100, 0b010, 0b010, 0b010, 0b100],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        '#' => [0b101, 0b111, 0b101, 0b111, 0b101],
        ':' => [0, 0b010, 0, 0b010, 0],
        '|' => [0b010, 0b010, 0b010, 0b010, 0b010],
        '\'' => [0b010, 0b010, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0b111],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        '!' => [0b010, 0b010, 0b010, 0, 0b010],
        '&' => [0b010, 0b101, 0b010, 0b101, 0b011],
        '@' => [0b010, 0b101, 0b111, 0b100, 0b011],
        _ => [0b110, 0b001, 0b010, 0, 0b010],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::UnknownReason;
    use crate::types::{BoundingBox, IdentityId, IdentityMetadata, IdentityRecord};
    use image::Luma;

    fn known(index: usize, bbox: BoundingBox, tier: ConfidenceTier) -> RecognizedFace {
        RecognizedFace {
            face_index: index,
            bbox,
            outcome: FaceOutcome::Known {
                identity: IdentityRecord {
                    id: IdentityId(1),
                    name: "Ada Lovelace".into(),
                    metadata: IdentityMetadata {
                        employee_id: Some("EMP001".into()),
                        ..Default::default()
                    },
                },
                distance: 12.5,
                confidence: 87.5,
                tier,
            },
        }
    }

    fn unknown(index: usize, bbox: BoundingBox) -> RecognizedFace {
        RecognizedFace {
            face_index: index,
            bbox,
            outcome: FaceOutcome::Unknown {
                distance: Some(250.0),
                reason: UnknownReason::BelowConfidenceThreshold,
            },
        }
    }

    fn canvas() -> DynamicImage {
        DynamicImage::ImageLuma8(image::GrayImage::from_pixel(400, 300, Luma([60])))
    }

    #[test]
    fn test_label_text() {
        let face = known(0, BoundingBox::new(0, 0, 10, 10), ConfidenceTier::Excellent);
        assert_eq!(label_for(&face.outcome), "Ada Lovelace (87.5%) - EMP001");
        assert_eq!(label_for(&unknown(0, BoundingBox::new(0, 0, 1, 1)).outcome), "Unknown");
    }

    #[test]
    fn test_colors_by_outcome() {
        let config = AnnotationConfig::default();
        let annotator = Annotator::new(config.clone());
        let faces = vec![
            known(0, BoundingBox::new(40, 80, 100, 120), ConfidenceTier::Good),
            unknown(1, BoundingBox::new(180, 80, 100, 120)),
            known(2, BoundingBox::new(300, 80, 90, 120), ConfidenceTier::Fair),
        ];
        let out = annotator.annotate(&canvas(), &faces);
        assert_eq!(out.dimensions(), (400, 300));
        assert_eq!(out.get_pixel(40, 140), &Rgb(config.known_color));
        assert_eq!(out.get_pixel(42, 140), &Rgb(config.known_color));
        assert_eq!(out.get_pixel(180, 140), &Rgb(config.unknown_color));
        assert_eq!(out.get_pixel(182, 140), &Rgb([60, 60, 60]));
        assert_eq!(out.get_pixel(300, 140), &Rgb(config.weak_color));
    }

    #[test]
    fn test_error_face_is_grey() {
        let config = AnnotationConfig::default();
        let face = RecognizedFace {
            face_index: 0,
            bbox: BoundingBox::new(100, 100, 80, 80),
            outcome: FaceOutcome::Error {
                error: "bad region".into(),
            },
        };
        let out = Annotator::new(config.clone()).annotate(&canvas(), &[face]);
        assert_eq!(out.get_pixel(100, 130), &Rgb(config.error_color));
    }

    #[test]
    fn test_input_is_not_modified() {
        let input = canvas();
        let before = input.clone();
        let _ = Annotator::new(AnnotationConfig::default())
            .annotate(&input, &[unknown(0, BoundingBox::new(10, 10, 50, 50))]);
        assert_eq!(input, before);
    }

    #[test]
    fn test_summary_banner() {
        let out = Annotator::new(AnnotationConfig::default()).annotate(&canvas(), &[]);
        let banner = (0..20).flat_map(|y| (0..60).map(move |x| (x, y)));
        let pixels: Vec<_> = banner.map(|(x, y)| *out.get_pixel(x, y)).collect();
        assert!(pixels.contains(&BANNER_COLOR));
        assert!(pixels.contains(&TEXT_COLOR));

        let quiet = AnnotationConfig {
            draw_summary: false,
            ..AnnotationConfig::default()
        };
        let out = Annotator::new(quiet).annotate(&canvas(), &[]);
        assert!(out.pixels().all(|p| *p == Rgb([60, 60, 60])));
    }

    #[test]
    fn test_boxes_at_image_edge() {
        let faces = vec![
            unknown(0, BoundingBox::new(0, 0, 30, 30)),
            known(1, BoundingBox::new(380, 280, 40, 40), ConfidenceTier::Excellent),
        ];
        let out = Annotator::new(AnnotationConfig::default()).annotate(&canvas(), &faces);
        assert_eq!(out.dimensions(), (400, 300));
    }

    #[test]
    fn test_missing_font_falls_back_to_bitmap() {
        let config = AnnotationConfig {
            font_path: Some("/nonexistent/font.ttf".into()),
            ..AnnotationConfig::default()
        };
        let annotator = Annotator::new(config);
        assert!(matches!(annotator.text, TextRenderer::Bitmap { scale: 2 }));
        assert_eq!(annotator.text.size("AB"), (14, 10));
    }

    #[test]
    fn test_unsupported_glyph_renders_question_mark() {
        assert_eq!(glyph('~'), glyph('?'));
        assert_eq!(glyph('a'), glyph('A'));
    }
}
