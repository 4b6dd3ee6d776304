//! Cursor change watcher
//!
//! Subscribes to XFIXES cursor-change notifications, converts the current
//! cursor image to a cropped (and possibly downscaled) PNG, and broadcasts
//! it as a `cursor,<json>` message. The Broadcaster caches the last message
//! so late joiners see the correct pointer immediately.

use crate::broadcaster::Broadcaster;
use crate::protocol;
use base64::Engine;
use image::imageops::FilterType;
use image::RgbaImage;
use log::{error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use x11rb::connection::Connection;
use x11rb::protocol::xfixes::ConnectionExt as XfixesExt;
use x11rb::protocol::Event;

/// A raw cursor image as returned by XFIXES (ARGB, row-major).
#[derive(Debug, Clone)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub xhot: u32,
    pub yhot: u32,
    pub serial: u32,
    pub pixels: Vec<u32>,
}

fn empty_descriptor(serial: u32) -> serde_json::Value {
    json!({
        "curdata": "", "width": 0, "height": 0,
        "hotx": 0, "hoty": 0, "handle": serial,
    })
}

/// Bounding box of non-transparent pixels, or None for a fully empty image.
fn bounding_box(image: &CursorImage) -> Option<(u32, u32, u32, u32)> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut any = false;
    for y in 0..image.height {
        for x in 0..image.width {
            if image.pixels[(y * image.width + x) as usize] != 0 {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }
    if any {
        Some((min_x, min_y, max_x + 1, max_y + 1))
    } else {
        None
    }
}

/// Build the cursor descriptor JSON: crop to content, rescale the hotspot,
/// cap the larger dimension at `size_cap`, PNG-encode, base64.
pub fn cursor_to_descriptor(image: &CursorImage, size_cap: u32) -> serde_json::Value {
    if image.width == 0 || image.height == 0 {
        return empty_descriptor(image.serial);
    }
    let Some((left, top, right, bottom)) = bounding_box(image) else {
        return empty_descriptor(image.serial);
    };

    let crop_w = right - left;
    let crop_h = bottom - top;
    let mut rgba = RgbaImage::new(crop_w, crop_h);
    for y in 0..crop_h {
        for x in 0..crop_w {
            let pixel = image.pixels[((top + y) * image.width + (left + x)) as usize];
            let a = (pixel >> 24) as u8;
            let r = (pixel >> 16) as u8;
            let g = (pixel >> 8) as u8;
            let b = pixel as u8;
            rgba.put_pixel(x, y, image::Rgba([r, g, b, a]));
        }
    }

    let mut hotx = image.xhot.saturating_sub(left) as i64;
    let mut hoty = image.yhot.saturating_sub(top) as i64;
    let mut out = rgba;
    if size_cap > 0 && (out.width() > size_cap || out.height() > size_cap) {
        let max_dim = out.width().max(out.height());
        let scale = size_cap as f64 / max_dim as f64;
        let new_w = ((out.width() as f64 * scale) as u32).max(1);
        let new_h = ((out.height() as f64 * scale) as u32).max(1);
        out = image::imageops::resize(&out, new_w, new_h, FilterType::Lanczos3);
        hotx = (hotx as f64 * scale) as i64;
        hoty = (hoty as f64 * scale) as i64;
    }

    let mut png_data = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_data);
    if let Err(err) = image::ImageEncoder::write_image(
        encoder,
        out.as_raw(),
        out.width(),
        out.height(),
        image::ColorType::Rgba8,
    ) {
        warn!("Cursor PNG encode failed: {}", err);
        return empty_descriptor(image.serial);
    }

    json!({
        "curdata": base64::engine::general_purpose::STANDARD.encode(&png_data),
        "width": out.width(),
        "height": out.height(),
        "hotx": hotx,
        "hoty": hoty,
        "handle": image.serial,
    })
}

/// Run the XFIXES watcher until `running` clears. Blocking; callers put
/// this on a blocking thread.
pub fn run_cursor_watcher(
    broadcaster: Arc<Broadcaster>,
    size_cap: u32,
    running: Arc<AtomicBool>,
) {
    let (conn, screen_num) = match x11rb::connect(None) {
        Ok(pair) => pair,
        Err(err) => {
            error!("Cursor watcher: cannot connect to X display: {}", err);
            return;
        }
    };
    let root = conn.setup().roots[screen_num].root;

    match conn.xfixes_query_version(5, 0) {
        Ok(cookie) => {
            if let Ok(version) = cookie.reply() {
                info!(
                    "Found XFIXES version {}.{}",
                    version.major_version, version.minor_version
                );
            }
        }
        Err(err) => {
            error!("XFIXES not supported, cannot watch cursor changes: {}", err);
            return;
        }
    }
    if conn
        .xfixes_select_cursor_input(
            root,
            x11rb::protocol::xfixes::CursorNotifyMask::DISPLAY_CURSOR,
        )
        .is_err()
    {
        error!("Failed to select XFIXES cursor input");
        return;
    }
    let _ = conn.flush();
    info!("Cursor watcher running (size cap {}px)", size_cap);

    let fetch_and_broadcast = |conn: &x11rb::rust_connection::RustConnection| {
        let reply = match conn.xfixes_get_cursor_image().map(|c| c.reply()) {
            Ok(Ok(reply)) => reply,
            _ => {
                warn!("Failed to fetch cursor image");
                return;
            }
        };
        let image = CursorImage {
            width: reply.width as u32,
            height: reply.height as u32,
            xhot: reply.xhot as u32,
            yhot: reply.yhot as u32,
            serial: reply.cursor_serial,
            pixels: reply.cursor_image,
        };
        let message = protocol::cursor_message(&cursor_to_descriptor(&image, size_cap));
        broadcaster.set_cursor_message(message.clone());
        broadcaster.broadcast_text(&message);
    };

    fetch_and_broadcast(&conn);

    while running.load(Ordering::Relaxed) {
        match conn.poll_for_event() {
            Ok(Some(Event::XfixesCursorNotify(_))) => fetch_and_broadcast(&conn),
            Ok(Some(_)) => {}
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
            Err(err) => {
                error!("Cursor watcher connection error: {}", err);
                break;
            }
        }
    }
    info!("Cursor watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_image(width: u32, height: u32) -> CursorImage {
        CursorImage {
            width,
            height,
            xhot: 2,
            yhot: 2,
            serial: 7,
            pixels: vec![0xFF00_FF00; (width * height) as usize],
        }
    }

    #[test]
    fn empty_cursor_yields_empty_descriptor() {
        let image = CursorImage {
            width: 4,
            height: 4,
            xhot: 0,
            yhot: 0,
            serial: 3,
            pixels: vec![0; 16],
        };
        let descriptor = cursor_to_descriptor(&image, 64);
        assert_eq!(descriptor["curdata"], "");
        assert_eq!(descriptor["width"], 0);
        assert_eq!(descriptor["handle"], 3);
    }

    #[test]
    fn crop_rescales_hotspot() {
        // Single opaque pixel at (3, 2) in an 8x8 image.
        let mut image = CursorImage {
            width: 8,
            height: 8,
            xhot: 3,
            yhot: 2,
            serial: 1,
            pixels: vec![0; 64],
        };
        image.pixels[2 * 8 + 3] = 0xFFFF_FFFF;
        let descriptor = cursor_to_descriptor(&image, 64);
        assert_eq!(descriptor["width"], 1);
        assert_eq!(descriptor["height"], 1);
        assert_eq!(descriptor["hotx"], 0);
        assert_eq!(descriptor["hoty"], 0);
        assert_ne!(descriptor["curdata"], "");
    }

    #[test]
    fn oversized_cursor_is_downscaled() {
        let image = solid_image(128, 64);
        let descriptor = cursor_to_descriptor(&image, 32);
        assert_eq!(descriptor["width"], 32);
        assert_eq!(descriptor["height"], 16);
    }
}
