//! Recognition overlay: face rectangles drawn onto a preview image.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use rollcall_core::{BoundingBox, RecognitionResult};

const MATCHED: Rgb<u8> = Rgb([0, 200, 83]);
const UNKNOWN: Rgb<u8> = Rgb([229, 57, 53]);
const STROKE: u32 = 2;

/// Draw one rectangle per detected face. Matched faces are green, the rest red.
///
/// `mirrored` flips boxes horizontally for front-camera previews, since
/// detections are reported on the unmirrored frame.
pub fn draw_overlay(image: &mut RgbImage, result: &RecognitionResult, mirrored: bool) {
    let width = image.width() as f32;
    for face in &result.faces {
        let bbox = if mirrored {
            face.detection.bbox.mirrored(width)
        } else {
            face.detection.bbox
        };
        let colour = if face.identity.is_some() { MATCHED } else { UNKNOWN };
        draw_rect(image, &bbox, colour);
    }
}

fn draw_rect(image: &mut RgbImage, bbox: &BoundingBox, colour: Rgb<u8>) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || bbox.width <= 0.0 || bbox.height <= 0.0 {
        return;
    }
    // Clamp to the image so boxes hanging off an edge still show that edge.
    let x0 = bbox.x.max(0.0) as u32;
    let y0 = bbox.y.max(0.0) as u32;
    let x1 = ((bbox.x + bbox.width).max(0.0) as u32).min(w - 1);
    let y1 = ((bbox.y + bbox.height).max(0.0) as u32).min(h - 1);
    if x0 > x1 || y0 > y1 {
        return;
    }

    let (rect_w, rect_h) = (x1 - x0 + 1, y1 - y0 + 1);
    for t in 0..STROKE {
        if 2 * t >= rect_w || 2 * t >= rect_h {
            break;
        }
        let rect = Rect::at((x0 + t) as i32, (y0 + t) as i32)
            .of_size(rect_w - 2 * t, rect_h - 2 * t);
        draw_hollow_rect_mut(image, rect, colour);
    }
}
