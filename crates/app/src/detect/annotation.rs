//! Frame annotation: box outlines, track labels, speed and loitering tags,
//! plus JPEG encoding of the finished frame.
//!
//! Rendering is deliberately primitive (1px outlines, a 5x7 bitmap font) so
//! the postprocess stage stays allocation-light on the per-frame path.

use anyhow::{Result, anyhow};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};

use crate::detect::data::DetectionSummary;
use video_ingest::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const SPEED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LOITER_COLOR: Rgb<u8> = Rgb([255, 64, 64]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);

/// Draw all detection overlays onto the frame and encode it as JPEG.
pub(crate) fn annotate_and_encode(
    frame: &Frame,
    summaries: &[DetectionSummary],
    jpeg_quality: u8,
) -> Result<Vec<u8>> {
    let width = frame.width as u32;
    let height = frame.height as u32;
    let rgb = bgr_to_rgb(&frame.data);
    let mut image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    for summary in summaries {
        let left = summary.bbox[0].round() as i32;
        let top = summary.bbox[1].round() as i32;
        let right = summary.bbox[2].round() as i32;
        let bottom = summary.bbox[3].round() as i32;
        draw_rectangle(&mut image, left, top, right, bottom, BOX_COLOR);

        let mut tag = match summary.track_id {
            Some(id) => format!("{} {} {:.0}%", summary.label, id, summary.score * 100.0),
            None => format!("{} {:.0}%", summary.label, summary.score * 100.0),
        };
        let tag_y = (top - 10).max(0);
        draw_tag(&mut image, left, tag_y, &tag, BOX_COLOR);

        let mut line_y = bottom + 3;
        if let Some(speed) = summary.speed_kmh {
            tag = format!("{speed:.1} km/h");
            draw_tag(&mut image, left, line_y, &tag, SPEED_COLOR);
            line_y += 10;
        }
        if summary.loitering {
            draw_tag(&mut image, left, line_y, "LOITERING", LOITER_COLOR);
        }
    }

    let mut jpeg = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality.clamp(1, 100));
    image
        .write_with_encoder(encoder)
        .map_err(|err| anyhow!("jpeg encode failed: {err}"))?;
    Ok(jpeg)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn draw_rectangle(
    image: &mut ImageBuffer<Rgb<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(
    image: &mut ImageBuffer<Rgb<u8>, Vec<u8>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

/// Text on a filled background strip.
fn draw_tag(
    image: &mut ImageBuffer<Rgb<u8>, Vec<u8>>,
    x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
) {
    let text_width = text.chars().count() as i32 * 6;
    fill_rect(image, x, y, x + text_width, y + 8, LABEL_BG);
    draw_text(image, x + 1, y + 1, text, color);
}

fn draw_text(
    image: &mut ImageBuffer<Rgb<u8>, Vec<u8>>,
    mut x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

#[rustfmt::skip]
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110]),
        'E' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001]),
        'X' => Some([0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b01010, 0b10001]),
        'Y' => Some([0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        '%' => Some([0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000]),
        '/' => Some([0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
        '-' => Some([0, 0, 0, 0b01110, 0, 0, 0]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::FrameFormat;

    fn test_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![32u8; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    fn summary(loitering: bool) -> DetectionSummary {
        DetectionSummary {
            label: "person".to_string(),
            score: 0.9,
            bbox: [10.0, 10.0, 60.0, 90.0],
            track_id: Some(3),
            speed_kmh: Some(12.4),
            loitering,
        }
    }

    #[test]
    fn produces_valid_jpeg() {
        let frame = test_frame(160, 120);
        let jpeg = annotate_and_encode(&frame, &[summary(true)], 70).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 160);
        assert_eq!(decoded.height(), 120);
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let frame = test_frame(64, 64);
        let mut det = summary(false);
        det.bbox = [-20.0, -20.0, 200.0, 200.0];
        assert!(annotate_and_encode(&frame, &[det], 70).is_ok());
    }
}
