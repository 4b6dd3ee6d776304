//! Configuration for selkies-stream
//!
//! Parses the CLI/env option surface into typed settings. Range options
//! accept "lo-hi" or a fixed value; boolean options accept a "|locked"
//! suffix that pins the value against client changes.

use crate::args::Args;
use log::warn;
use std::fmt;
use std::path::PathBuf;

/// Video encoder selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    /// Striped H.264 with full-frame stripes
    X264enc,
    /// Striped H.264 with per-damage stripes
    X264encStriped,
    Jpeg,
}

impl Encoder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoder::X264enc => "x264enc",
            Encoder::X264encStriped => "x264enc-striped",
            Encoder::Jpeg => "jpeg",
        }
    }

    pub fn parse(value: &str) -> Option<Encoder> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x264enc" => Some(Encoder::X264enc),
            "x264enc-striped" => Some(Encoder::X264encStriped),
            "jpeg" => Some(Encoder::Jpeg),
            _ => None,
        }
    }

    pub fn is_h264(&self) -> bool {
        matches!(self, Encoder::X264enc | Encoder::X264encStriped)
    }

    /// The single flag distinguishing the two H.264 spellings.
    pub fn fullframe(&self) -> bool {
        matches!(self, Encoder::X264enc)
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean option that may carry a "|locked" suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lockable {
    pub value: bool,
    pub locked: bool,
}

impl Lockable {
    pub fn parse(raw: &str) -> Result<Lockable, String> {
        let lower = raw.trim().to_ascii_lowercase();
        let locked = lower.ends_with("|locked");
        let value_str = lower.trim_end_matches("|locked");
        let value = match value_str {
            "true" | "1" => true,
            "false" | "0" => false,
            other => return Err(format!("invalid boolean value: {}", other)),
        };
        Ok(Lockable { value, locked })
    }
}

/// Integer option expressed as "lo-hi" or a fixed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
    pub value: i64,
}

impl IntRange {
    pub fn parse(raw: &str, default_value: i64) -> Result<IntRange, String> {
        let trimmed = raw.trim();
        if let Some((lo, hi)) = trimmed.split_once('-') {
            let min: i64 = lo
                .trim()
                .parse()
                .map_err(|_| format!("invalid range: {}", raw))?;
            let max: i64 = hi
                .trim()
                .parse()
                .map_err(|_| format!("invalid range: {}", raw))?;
            if min > max {
                return Err(format!("range minimum exceeds maximum: {}", raw));
            }
            let value = default_value.clamp(min, max);
            Ok(IntRange { min, max, value })
        } else {
            let fixed: i64 = trimmed
                .parse()
                .map_err(|_| format!("invalid integer: {}", raw))?;
            Ok(IntRange {
                min: fixed,
                max: fixed,
                value: fixed,
            })
        }
    }

    pub fn clamp(&self, requested: i64) -> i64 {
        requested.clamp(self.min, self.max)
    }

    pub fn is_locked(&self) -> bool {
        self.min == self.max
    }
}

/// Parse a DRI node path like "/dev/dri/renderD128" into a VA-API render
/// node index (renderD128 -> 0). Returns -1 for anything unusable, which
/// disables VA-API in the capture library.
pub fn parse_dri_node_to_index(node_path: &str) -> i32 {
    if node_path.is_empty() {
        return -1;
    }
    let Some(num_str) = node_path.strip_prefix("/dev/dri/renderD") else {
        warn!(
            "Invalid DRI node format: '{}'. Expected '/dev/dri/renderD...'. VA-API disabled.",
            node_path
        );
        return -1;
    };
    match num_str.parse::<i32>() {
        Ok(render_num) if render_num >= 128 => render_num - 128,
        Ok(render_num) => {
            warn!(
                "DRI node number {} from '{}' is below 128. VA-API disabled.",
                render_num, node_path
            );
            -1
        }
        Err(_) => {
            warn!("Could not parse DRI node path '{}'. VA-API disabled.", node_path);
            -1
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Encoders the server advertises; first entry is the initial encoder.
    pub encoders: Vec<Encoder>,
    pub framerate: IntRange,
    pub h264_crf: IntRange,
    pub jpeg_quality: IntRange,
    pub paint_over_jpeg_quality: IntRange,
    pub h264_paintover_crf: IntRange,
    pub h264_paintover_burst_frames: IntRange,
    pub h264_fullcolor: Lockable,
    pub h264_streaming_mode: Lockable,
    pub use_cpu: Lockable,
    pub use_paint_over_quality: Lockable,
    pub enable_binary_clipboard: Lockable,
    pub enable_clipboard: bool,
    pub enable_commands: bool,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate: u32,
    pub audio_device_name: String,
    pub is_manual_resolution_mode: bool,
    pub manual_width: u32,
    pub manual_height: u32,
    pub scaling_dpi: u32,
    pub watermark_path: String,
    pub watermark_location: i32,
    pub vaapi_render_node_index: i32,
    pub allow_upload: bool,
    pub allow_download: bool,
    pub upload_dir: String,
    pub js_socket_prefix: PathBuf,
    pub debug: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Config, String> {
        let mut encoders = Vec::new();
        for entry in args.encoder.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match Encoder::parse(entry) {
                Some(enc) if !encoders.contains(&enc) => encoders.push(enc),
                Some(_) => {}
                None => return Err(format!("unknown encoder: {}", entry)),
            }
        }
        if encoders.is_empty() {
            return Err("encoder list is empty".to_string());
        }

        let mut allow_upload = false;
        let mut allow_download = false;
        for entry in args.file_transfers.split(',') {
            match entry.trim().to_ascii_lowercase().as_str() {
                "upload" => allow_upload = true,
                "download" => allow_download = true,
                "" | "none" => {}
                other => return Err(format!("invalid file_transfers entry: {}", other)),
            }
        }

        // Overriding a manual dimension forces manual resolution mode.
        let mut manual_width = args.manual_width;
        let mut manual_height = args.manual_height;
        let mut is_manual = args.is_manual_resolution_mode;
        if manual_width > 0 || manual_height > 0 {
            is_manual = true;
            if manual_width == 0 {
                manual_width = 1024;
            }
            if manual_height == 0 {
                manual_height = 768;
            }
        }

        let config = Config {
            port: args.port,
            encoders,
            framerate: IntRange::parse(&args.framerate, 60)?,
            h264_crf: IntRange::parse(&args.h264_crf, 25)?,
            jpeg_quality: IntRange::parse(&args.jpeg_quality, 40)?,
            paint_over_jpeg_quality: IntRange::parse(&args.paint_over_jpeg_quality, 90)?,
            h264_paintover_crf: IntRange::parse(&args.h264_paintover_crf, 18)?,
            h264_paintover_burst_frames: IntRange::parse(&args.h264_paintover_burst_frames, 5)?,
            h264_fullcolor: Lockable::parse(&args.h264_fullcolor)?,
            h264_streaming_mode: Lockable::parse(&args.h264_streaming_mode)?,
            use_cpu: Lockable::parse(&args.use_cpu)?,
            use_paint_over_quality: Lockable::parse(&args.use_paint_over_quality)?,
            enable_binary_clipboard: Lockable::parse(&args.enable_binary_clipboard)?,
            enable_clipboard: args.clipboard_enabled,
            enable_commands: args.command_enabled,
            video_bitrate_kbps: args.video_bitrate,
            audio_bitrate: args.audio_bitrate,
            audio_device_name: args.audio_device_name.clone(),
            is_manual_resolution_mode: is_manual,
            manual_width,
            manual_height,
            scaling_dpi: args.scaling_dpi,
            watermark_path: args.watermark_path.clone(),
            watermark_location: args.watermark_location,
            vaapi_render_node_index: parse_dri_node_to_index(&args.dri_node),
            allow_upload,
            allow_download,
            upload_dir: args.upload_dir.clone(),
            js_socket_prefix: PathBuf::from(&args.js_socket_path),
            debug: args.debug,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn initial_encoder(&self) -> Encoder {
        self.encoders[0]
    }

    fn validate(&self) -> Result<(), String> {
        if self.video_bitrate_kbps == 0 {
            return Err("video bitrate must be non-zero".to_string());
        }
        if self.audio_bitrate == 0 {
            return Err("audio bitrate must be non-zero".to_string());
        }
        if self.framerate.value <= 0 {
            return Err("framerate must be positive".to_string());
        }
        if self.is_manual_resolution_mode && (self.manual_width == 0 || self.manual_height == 0) {
            return Err("manual resolution mode requires width and height".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockable_parses_suffix() {
        let plain = Lockable::parse("true").expect("parse");
        assert!(plain.value);
        assert!(!plain.locked);

        let locked = Lockable::parse("false|locked").expect("parse");
        assert!(!locked.value);
        assert!(locked.locked);

        assert!(Lockable::parse("maybe").is_err());
    }

    #[test]
    fn int_range_parses_span_and_fixed() {
        let span = IntRange::parse("8-120", 60).expect("parse");
        assert_eq!(span.min, 8);
        assert_eq!(span.max, 120);
        assert_eq!(span.value, 60);
        assert!(!span.is_locked());
        assert_eq!(span.clamp(500), 120);

        let fixed = IntRange::parse("30", 60).expect("parse");
        assert_eq!(fixed.value, 30);
        assert!(fixed.is_locked());

        assert!(IntRange::parse("120-8", 60).is_err());
    }

    #[test]
    fn dri_node_index() {
        assert_eq!(parse_dri_node_to_index("/dev/dri/renderD128"), 0);
        assert_eq!(parse_dri_node_to_index("/dev/dri/renderD129"), 1);
        assert_eq!(parse_dri_node_to_index("/dev/dri/renderD100"), -1);
        assert_eq!(parse_dri_node_to_index("/dev/dri/card0"), -1);
        assert_eq!(parse_dri_node_to_index(""), -1);
    }

    #[test]
    fn encoder_tags_differ_only_in_fullframe() {
        let full = Encoder::parse("x264enc").expect("parse");
        let striped = Encoder::parse("x264enc-striped").expect("parse");
        assert!(full.is_h264() && striped.is_h264());
        assert!(full.fullframe());
        assert!(!striped.fullframe());
    }
}
