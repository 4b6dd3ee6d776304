//! Wire protocol for the data WebSocket
//!
//! One WebSocket per client carries text commands and tagged binary frames
//! in both directions. This module owns the client command grammar and the
//! server-side message builders; transport and side effects live elsewhere.

use crate::config::Encoder;
use base64::Engine;
use serde_json::json;

/// Server -> client binary stream tags (first byte) and sub-types (second).
pub const TAG_AUDIO: u8 = 0x01;
pub const SUBTYPE_OPUS: u8 = 0x00;
pub const TAG_JPEG: u8 = 0x03;
pub const SUBTYPE_JPEG: u8 = 0x00;

/// Client -> server binary frame tags.
pub const CLIENT_TAG_FILE_CHUNK: u8 = 0x01;
pub const CLIENT_TAG_MIC_PCM: u8 = 0x02;

/// Clipboard payloads at or above this size go out chunked.
pub const CLIPBOARD_CHUNK_SIZE: usize = 750 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Video,
    Audio,
}

/// A parsed client text message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Settings(serde_json::Value),
    FrameAck(u16),
    StartVideo,
    StopVideo,
    StartAudio,
    StopAudio,
    SetEncoder(String),
    SetFramerate(i64),
    SetCrf(i64),
    SetJpegQuality(i64),
    SetPaintOverJpegQuality(i64),
    SetUsePaintOverQuality(bool),
    SetH264Fullcolor(bool),
    SetH264StreamingMode(bool),
    SetH264PaintoverCrf(i64),
    SetH264PaintoverBurstFrames(i64),
    SetUseCpu(bool),
    SetNativeCursorRendering(bool),
    Resize { width: u32, height: u32 },
    SetDpi(u32),
    MouseMove {
        x: i32,
        y: i32,
        button_mask: u8,
        scroll_magnitude: u32,
        relative: bool,
    },
    KeyDown(u32),
    KeyUp(u32),
    KeyboardReset,
    TypeText(String),
    GamepadConnect {
        index: usize,
        name: String,
        num_axes: u32,
        num_btns: u32,
    },
    GamepadDisconnect { index: usize },
    GamepadButton { index: usize, button: u32, value: f64 },
    GamepadAxis { index: usize, axis: u32, value: f64 },
    ClipboardWrite { data_b64: String },
    ClipboardWriteBinary { mime: String, data_b64: String },
    ClipboardRead,
    ClipboardStartText { total_size: usize },
    ClipboardStartBinary { mime: String, total_size: usize },
    ClipboardChunk { data_b64: String },
    ClipboardFinish,
    Command(String),
    Pong,
    ArgFps(i64),
    ArgResize {
        enabled: bool,
        resolution: Option<(u32, u32)>,
    },
    ClientFps(f64),
    ClientLatency(i64),
    ClientStats { kind: StatsKind, payload: String },
    VideoBitrate(i64),
    AudioBitrate(i64),
    UploadStart { rel_path: String, size: u64 },
    UploadEnd,
    UploadError,
    /// Verb the grammar does not know; dropped downstream.
    Unknown(String),
}

/// Grammar violation in a known verb. The session logs these at WARN and
/// drops the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed message: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

fn malformed(msg: &str) -> ParseError {
    ParseError(msg.chars().take(120).collect())
}

fn parse_int<T: std::str::FromStr>(raw: &str, msg: &str) -> Result<T, ParseError> {
    raw.trim().parse::<T>().map_err(|_| malformed(msg))
}

fn parse_bool_token(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

/// Resolution strings must match `<digits>x<digits>`.
fn parse_resolution(raw: &str) -> Result<(u32, u32), ParseError> {
    let (w_str, h_str) = raw.split_once('x').ok_or_else(|| malformed(raw))?;
    if w_str.is_empty()
        || h_str.is_empty()
        || !w_str.bytes().all(|b| b.is_ascii_digit())
        || !h_str.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed(raw));
    }
    let width = parse_int::<u32>(w_str, raw)?;
    let height = parse_int::<u32>(h_str, raw)?;
    Ok((width, height))
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    if let Some(payload) = text.strip_prefix("SETTINGS,") {
        let value: serde_json::Value =
            serde_json::from_str(payload).map_err(|_| malformed(text))?;
        return Ok(ClientMessage::Settings(value));
    }
    if let Some(payload) = text.strip_prefix("CLIENT_FRAME_ACK") {
        let id: u32 = parse_int(payload.trim(), text)?;
        return Ok(ClientMessage::FrameAck((id % 65536) as u16));
    }
    if let Some(rest) = text.strip_prefix("FILE_UPLOAD_START:") {
        let mut parts = rest.splitn(2, ':');
        let rel_path = parts.next().unwrap_or_default().to_string();
        let size: u64 = parse_int(parts.next().ok_or_else(|| malformed(text))?, text)?;
        return Ok(ClientMessage::UploadStart { rel_path, size });
    }
    if text.starts_with("FILE_UPLOAD_END:") {
        return Ok(ClientMessage::UploadEnd);
    }
    if text.starts_with("FILE_UPLOAD_ERROR:") {
        return Ok(ClientMessage::UploadError);
    }

    match text {
        "START_VIDEO" => return Ok(ClientMessage::StartVideo),
        "STOP_VIDEO" => return Ok(ClientMessage::StopVideo),
        "START_AUDIO" => return Ok(ClientMessage::StartAudio),
        "STOP_AUDIO" => return Ok(ClientMessage::StopAudio),
        "kr" => return Ok(ClientMessage::KeyboardReset),
        "cr" => return Ok(ClientMessage::ClipboardRead),
        "cwe" | "cbe" => return Ok(ClientMessage::ClipboardFinish),
        "pong" => return Ok(ClientMessage::Pong),
        _ => {}
    }

    let (verb, rest) = match text.split_once(',') {
        Some((verb, rest)) => (verb, rest),
        None => return Ok(ClientMessage::Unknown(text.to_string())),
    };

    match verb {
        "SET_ENCODER" => Ok(ClientMessage::SetEncoder(
            rest.trim().to_ascii_lowercase(),
        )),
        "SET_FRAMERATE" => Ok(ClientMessage::SetFramerate(parse_int(rest, text)?)),
        "SET_CRF" => Ok(ClientMessage::SetCrf(parse_int(rest, text)?)),
        "SET_JPEG_QUALITY" => Ok(ClientMessage::SetJpegQuality(parse_int(rest, text)?)),
        "SET_PAINT_OVER_JPEG_QUALITY" => Ok(ClientMessage::SetPaintOverJpegQuality(
            parse_int(rest, text)?,
        )),
        "SET_USE_PAINT_OVER_QUALITY" => {
            Ok(ClientMessage::SetUsePaintOverQuality(parse_bool_token(rest)))
        }
        "SET_H264_FULLCOLOR" => Ok(ClientMessage::SetH264Fullcolor(parse_bool_token(rest))),
        "SET_H264_STREAMING_MODE" => {
            Ok(ClientMessage::SetH264StreamingMode(parse_bool_token(rest)))
        }
        "SET_H264_PAINTOVER_CRF" => {
            Ok(ClientMessage::SetH264PaintoverCrf(parse_int(rest, text)?))
        }
        "SET_H264_PAINTOVER_BURST_FRAMES" => Ok(ClientMessage::SetH264PaintoverBurstFrames(
            parse_int(rest, text)?,
        )),
        "SET_USE_CPU" => Ok(ClientMessage::SetUseCpu(parse_bool_token(rest))),
        "SET_NATIVE_CURSOR_RENDERING" => {
            Ok(ClientMessage::SetNativeCursorRendering(parse_bool_token(rest)))
        }
        "r" => {
            let (width, height) = parse_resolution(rest)?;
            Ok(ClientMessage::Resize { width, height })
        }
        "s" => Ok(ClientMessage::SetDpi(parse_int(rest, text)?)),
        "m" | "m2" => {
            let parts: Vec<&str> = rest.split(',').collect();
            if parts.len() < 4 {
                return Err(malformed(text));
            }
            Ok(ClientMessage::MouseMove {
                x: parse_int(parts[0], text)?,
                y: parse_int(parts[1], text)?,
                button_mask: (parse_int::<u32>(parts[2], text)? & 0xFF) as u8,
                scroll_magnitude: parse_int(parts[3], text)?,
                relative: verb == "m2",
            })
        }
        "kd" => Ok(ClientMessage::KeyDown(parse_int(rest, text)?)),
        "ku" => Ok(ClientMessage::KeyUp(parse_int(rest, text)?)),
        "co" => {
            // co,end,<text> -- text may itself contain commas
            let payload = rest
                .strip_prefix("end,")
                .ok_or_else(|| malformed(text))?;
            Ok(ClientMessage::TypeText(payload.to_string()))
        }
        "js" => parse_gamepad(rest, text),
        "cw" => Ok(ClientMessage::ClipboardWrite {
            data_b64: rest.to_string(),
        }),
        "cb" => {
            let (mime, data_b64) = rest.split_once(',').ok_or_else(|| malformed(text))?;
            Ok(ClientMessage::ClipboardWriteBinary {
                mime: mime.to_string(),
                data_b64: data_b64.to_string(),
            })
        }
        "cws" => Ok(ClientMessage::ClipboardStartText {
            total_size: parse_int(rest, text)?,
        }),
        "cbs" => {
            let (mime, size_str) = rest.split_once(',').ok_or_else(|| malformed(text))?;
            Ok(ClientMessage::ClipboardStartBinary {
                mime: mime.to_string(),
                total_size: parse_int(size_str, text)?,
            })
        }
        "cwd" | "cbd" => Ok(ClientMessage::ClipboardChunk {
            data_b64: rest.to_string(),
        }),
        "cmd" => Ok(ClientMessage::Command(rest.to_string())),
        "_arg_fps" => Ok(ClientMessage::ArgFps(parse_int(rest, text)?)),
        "_arg_resize" => {
            let (enabled_str, res_str) = rest.split_once(',').ok_or_else(|| malformed(text))?;
            let resolution = if res_str.is_empty() {
                None
            } else {
                Some(parse_resolution(res_str)?)
            };
            Ok(ClientMessage::ArgResize {
                enabled: parse_bool_token(enabled_str),
                resolution,
            })
        }
        "_f" => Ok(ClientMessage::ClientFps(
            rest.trim().parse::<f64>().map_err(|_| malformed(text))?,
        )),
        "_l" => Ok(ClientMessage::ClientLatency(parse_int(rest, text)?)),
        "_stats_video" => Ok(ClientMessage::ClientStats {
            kind: StatsKind::Video,
            payload: rest.to_string(),
        }),
        "_stats_audio" => Ok(ClientMessage::ClientStats {
            kind: StatsKind::Audio,
            payload: rest.to_string(),
        }),
        "vb" => Ok(ClientMessage::VideoBitrate(parse_int(rest, text)?)),
        "ab" => Ok(ClientMessage::AudioBitrate(parse_int(rest, text)?)),
        _ => Ok(ClientMessage::Unknown(text.to_string())),
    }
}

fn parse_gamepad(rest: &str, text: &str) -> Result<ClientMessage, ParseError> {
    let parts: Vec<&str> = rest.split(',').collect();
    if parts.len() < 2 {
        return Err(malformed(text));
    }
    let index: usize = parse_int(parts[1], text)?;
    match parts[0] {
        "c" => {
            if parts.len() < 5 {
                return Err(malformed(text));
            }
            let name = base64::engine::general_purpose::STANDARD
                .decode(parts[2])
                .ok()
                .map(|bytes| {
                    bytes
                        .iter()
                        .map(|&b| b as char)
                        .take(255)
                        .collect::<String>()
                })
                .unwrap_or_else(|| format!("ClientGamepad{}", index));
            Ok(ClientMessage::GamepadConnect {
                index,
                name,
                num_axes: parse_int(parts[3], text)?,
                num_btns: parse_int(parts[4], text)?,
            })
        }
        "d" => Ok(ClientMessage::GamepadDisconnect { index }),
        "b" => {
            if parts.len() < 4 {
                return Err(malformed(text));
            }
            Ok(ClientMessage::GamepadButton {
                index,
                button: parse_int(parts[2], text)?,
                value: parts[3].trim().parse().map_err(|_| malformed(text))?,
            })
        }
        "a" => {
            if parts.len() < 4 {
                return Err(malformed(text));
            }
            Ok(ClientMessage::GamepadAxis {
                index,
                axis: parse_int(parts[2], text)?,
                value: parts[3].trim().parse().map_err(|_| malformed(text))?,
            })
        }
        _ => Err(malformed(text)),
    }
}

// --- Server message builders ---

pub fn mode_message() -> String {
    "MODE websockets".to_string()
}

pub fn pipeline_resetting_message() -> String {
    "PIPELINE_RESETTING 0".to_string()
}

pub fn stream_resolution_message(width: u32, height: u32) -> String {
    json!({
        "type": "stream_resolution",
        "width": width,
        "height": height,
    })
    .to_string()
}

pub fn server_settings_message(encoders: &[Encoder]) -> String {
    let names: Vec<&str> = encoders.iter().map(|e| e.as_str()).collect();
    json!({
        "type": "server_settings",
        "encoders": names,
    })
    .to_string()
}

/// Prefix an encoded Opus packet for the wire.
pub fn audio_frame(opus: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + opus.len());
    payload.push(TAG_AUDIO);
    payload.push(SUBTYPE_OPUS);
    payload.extend_from_slice(opus);
    payload
}

/// Prefix a JPEG stripe for the wire. The stripe already carries its own
/// frame id as emitted by the capture library.
pub fn jpeg_frame(stripe: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + stripe.len());
    payload.push(TAG_JPEG);
    payload.push(SUBTYPE_JPEG);
    payload.extend_from_slice(stripe);
    payload
}

/// Build outbound clipboard messages, chunking payloads at the 750 KiB
/// threshold so browsers never see an oversized single frame.
pub fn clipboard_messages(data: &[u8], mime_type: &str) -> Vec<String> {
    let engine = &base64::engine::general_purpose::STANDARD;
    if data.len() < CLIPBOARD_CHUNK_SIZE {
        let encoded = engine.encode(data);
        let message = if mime_type == "text/plain" {
            format!("clipboard,{}", encoded)
        } else {
            format!("clipboard_binary,{},{}", mime_type, encoded)
        };
        return vec![message];
    }
    let mut messages = Vec::with_capacity(2 + data.len() / CLIPBOARD_CHUNK_SIZE);
    messages.push(format!("clipboard_start,{},{}", mime_type, data.len()));
    for chunk in data.chunks(CLIPBOARD_CHUNK_SIZE) {
        messages.push(format!("clipboard_data,{}", engine.encode(chunk)));
    }
    messages.push("clipboard_finish".to_string());
    messages
}

pub fn cursor_message(cursor_json: &serde_json::Value) -> String {
    format!("cursor,{}", cursor_json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mouse_move() {
        let msg = parse_client_message("m,100,200,1,0").expect("parse");
        assert_eq!(
            msg,
            ClientMessage::MouseMove {
                x: 100,
                y: 200,
                button_mask: 1,
                scroll_magnitude: 0,
                relative: false,
            }
        );
        let rel = parse_client_message("m2,-5,3,0,0").expect("parse");
        assert!(matches!(rel, ClientMessage::MouseMove { relative: true, .. }));
    }

    #[test]
    fn parse_frame_ack_wraps_to_u16() {
        assert_eq!(
            parse_client_message("CLIENT_FRAME_ACK 70000").expect("parse"),
            ClientMessage::FrameAck(4464)
        );
        assert!(parse_client_message("CLIENT_FRAME_ACK abc").is_err());
    }

    #[test]
    fn parse_resize_rejects_garbage() {
        assert_eq!(
            parse_client_message("r,1920x1080").expect("parse"),
            ClientMessage::Resize {
                width: 1920,
                height: 1080
            }
        );
        assert!(parse_client_message("r,1920x").is_err());
        assert!(parse_client_message("r,axb").is_err());
        assert!(parse_client_message("r,1920x1080x3").is_err());
    }

    #[test]
    fn parse_gamepad_events() {
        let btn = parse_client_message("js,b,0,3,1").expect("parse");
        assert_eq!(
            btn,
            ClientMessage::GamepadButton {
                index: 0,
                button: 3,
                value: 1.0
            }
        );
        let connect = parse_client_message("js,c,1,UGFk,4,17").expect("parse");
        match connect {
            ClientMessage::GamepadConnect {
                index,
                name,
                num_axes,
                num_btns,
            } => {
                assert_eq!(index, 1);
                assert_eq!(name, "Pad");
                assert_eq!(num_axes, 4);
                assert_eq!(num_btns, 17);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parse_type_text_keeps_commas() {
        let msg = parse_client_message("co,end,a,b,c").expect("parse");
        assert_eq!(msg, ClientMessage::TypeText("a,b,c".to_string()));
    }

    #[test]
    fn parse_upload_start() {
        let msg = parse_client_message("FILE_UPLOAD_START:docs/report.pdf:4096").expect("parse");
        assert_eq!(
            msg,
            ClientMessage::UploadStart {
                rel_path: "docs/report.pdf".to_string(),
                size: 4096
            }
        );
        assert!(parse_client_message("FILE_UPLOAD_START:file.bin:big").is_err());
    }

    #[test]
    fn unknown_verb_passes_through() {
        let msg = parse_client_message("zz,whatever").expect("parse");
        assert_eq!(msg, ClientMessage::Unknown("zz,whatever".to_string()));
    }

    #[test]
    fn clipboard_chunking_threshold() {
        let small = clipboard_messages(b"hello", "text/plain");
        assert_eq!(small.len(), 1);
        assert!(small[0].starts_with("clipboard,"));

        let binary = clipboard_messages(b"\x89PNG", "image/png");
        assert!(binary[0].starts_with("clipboard_binary,image/png,"));

        let large = vec![0u8; CLIPBOARD_CHUNK_SIZE];
        let chunked = clipboard_messages(&large, "image/png");
        assert_eq!(
            chunked[0],
            format!("clipboard_start,image/png,{}", CLIPBOARD_CHUNK_SIZE)
        );
        assert!(chunked[1].starts_with("clipboard_data,"));
        assert_eq!(chunked.last().unwrap(), "clipboard_finish");
    }

    #[test]
    fn binary_prefixes() {
        assert_eq!(&audio_frame(&[0xAA])[..], &[0x01, 0x00, 0xAA]);
        assert_eq!(&jpeg_frame(&[0xBB])[..], &[0x03, 0x00, 0xBB]);
    }
}
