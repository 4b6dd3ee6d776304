//! Video and audio pipeline adapters
//!
//! Thin wrappers around the native capture modules: build the settings
//! struct, start/stop the module off the executor, and pump owned frame
//! copies to the Broadcaster with the right wire prefix. The backpressure
//! gate is consulted per encoded frame, after the frame id advances, so a
//! gated client observes the id gap and resyncs.

use crate::backpressure::FlowController;
use crate::broadcaster::Broadcaster;
use crate::capture::{
    AudioCapture, AudioCaptureLib, AudioSettings, CaptureSettings, ScreenCapture,
    VideoCaptureLib, OUTPUT_MODE_H264_STRIPED, OUTPUT_MODE_JPEG,
};
use crate::config::Encoder;
use crate::protocol;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const NATIVE_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to (re)build the video capture settings.
#[derive(Debug, Clone)]
pub struct VideoParams {
    pub encoder: Encoder,
    pub width: u32,
    pub height: u32,
    pub framerate: i64,
    pub h264_crf: i64,
    pub h264_fullcolor: bool,
    pub h264_streaming_mode: bool,
    pub jpeg_quality: i64,
    pub paint_over_jpeg_quality: i64,
    pub use_paint_over_quality: bool,
    pub h264_paintover_crf: i64,
    pub h264_paintover_burst_frames: i64,
    pub use_cpu: bool,
    pub capture_cursor: bool,
    pub vaapi_render_node_index: i32,
    pub watermark_path: String,
    pub watermark_location: i32,
}

pub fn build_capture_settings(params: &VideoParams) -> CaptureSettings {
    let mut cs = CaptureSettings {
        capture_width: params.width as i32,
        capture_height: params.height as i32,
        capture_x: 0,
        capture_y: 0,
        target_fps: params.framerate as f64,
        capture_cursor: params.capture_cursor,
        use_paint_over_quality: params.use_paint_over_quality,
        ..CaptureSettings::default()
    };

    match params.encoder {
        Encoder::Jpeg => {
            cs.output_mode = OUTPUT_MODE_JPEG;
            cs.jpeg_quality = params.jpeg_quality as i32;
            cs.paint_over_jpeg_quality = params.paint_over_jpeg_quality as i32;
            cs.paint_over_trigger_frames = 15;
            cs.damage_block_threshold = 10;
            cs.damage_block_duration = 20;
        }
        Encoder::X264enc | Encoder::X264encStriped => {
            cs.output_mode = OUTPUT_MODE_H264_STRIPED;
            cs.h264_crf = params.h264_crf as i32;
            cs.h264_fullcolor = params.h264_fullcolor;
            cs.h264_fullframe = params.encoder.fullframe();
            cs.h264_streaming_mode = params.h264_streaming_mode;
            cs.h264_paintover_crf = params.h264_paintover_crf as i32;
            cs.h264_paintover_burst_frames = params.h264_paintover_burst_frames as i32;
            cs.paint_over_trigger_frames = 5;
            cs.damage_block_threshold = 10;
            cs.damage_block_duration = 20;
            cs.use_cpu = params.use_cpu;
            cs.vaapi_render_node_index = params.vaapi_render_node_index;
        }
    }

    if !params.watermark_path.is_empty() {
        if Path::new(&params.watermark_path).exists() {
            cs.set_watermark_path(&params.watermark_path);
            cs.watermark_location_enum = if (0..=6).contains(&params.watermark_location) {
                params.watermark_location
            } else {
                4
            };
        } else {
            warn!(
                "Watermark path set but file not found: {}",
                params.watermark_path
            );
        }
    }

    cs
}

/// A running video pipeline; at most one exists at a time.
pub struct VideoPipeline {
    pub encoder: Encoder,
    capture: Option<ScreenCapture>,
    pump: JoinHandle<()>,
}

impl VideoPipeline {
    pub async fn start(
        lib: Arc<VideoCaptureLib>,
        params: &VideoParams,
        flow: Arc<FlowController>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self, String> {
        let settings = build_capture_settings(params);
        let encoder = params.encoder;
        info!(
            "Starting {}: {}x{} @ {}fps (crf {}, jpeg_q {}, fullframe {})",
            encoder,
            params.width,
            params.height,
            params.framerate,
            params.h264_crf,
            params.jpeg_quality,
            settings.h264_fullframe
        );

        let (capture, mut frames) = tokio::task::spawn_blocking(move || {
            ScreenCapture::start(lib, &settings)
        })
        .await
        .map_err(|e| format!("capture start task failed: {}", e))??;

        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                // The counter advances even for gated frames so the client
                // can observe the gap and resync on the next keyframe.
                flow.record_sent(frame.frame_id);
                if !flow.send_enabled() {
                    continue;
                }
                match encoder {
                    Encoder::Jpeg => {
                        broadcaster.broadcast_binary(&protocol::jpeg_frame(&frame.data));
                    }
                    Encoder::X264enc | Encoder::X264encStriped => {
                        // H.264 stripes come self-framed from the library.
                        broadcaster.broadcast_binary(&frame.data);
                    }
                }
            }
        });

        Ok(Self {
            encoder,
            capture: Some(capture),
            pump,
        })
    }

    /// Stop the native module with the standard 2 s cap.
    pub async fn stop(mut self) {
        info!("Stopping {} capture...", self.encoder);
        if let Some(capture) = self.capture.take() {
            let stop_task = tokio::task::spawn_blocking(move || capture.stop());
            if tokio::time::timeout(NATIVE_STOP_TIMEOUT, stop_task)
                .await
                .is_err()
            {
                error!("Timed out stopping {} capture module", self.encoder);
            }
        }
        self.pump.abort();
    }
}

/// A running audio pipeline.
pub struct AudioPipeline {
    capture: Option<AudioCapture>,
    pump: JoinHandle<()>,
}

impl AudioPipeline {
    pub async fn start(
        lib: Arc<AudioCaptureLib>,
        device_name: &str,
        channels: u32,
        opus_bitrate: u32,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self, String> {
        let mut settings = AudioSettings::default();
        settings.set_device_name(device_name);
        settings.channels = channels as i32;
        settings.opus_bitrate = opus_bitrate as i32;
        info!(
            "Starting audio capture: device='{}', bitrate={}, channels={}",
            device_name, opus_bitrate, channels
        );

        let (capture, mut packets) = tokio::task::spawn_blocking(move || {
            AudioCapture::start(lib, &settings)
        })
        .await
        .map_err(|e| format!("audio start task failed: {}", e))??;

        let pump = tokio::spawn(async move {
            while let Some(packet) = packets.recv().await {
                broadcaster.broadcast_binary(&protocol::audio_frame(&packet.data));
            }
        });

        Ok(Self {
            capture: Some(capture),
            pump,
        })
    }

    pub async fn stop(mut self) {
        info!("Stopping audio capture...");
        if let Some(capture) = self.capture.take() {
            let stop_task = tokio::task::spawn_blocking(move || capture.stop());
            if tokio::time::timeout(NATIVE_STOP_TIMEOUT, stop_task)
                .await
                .is_err()
            {
                error!("Timed out stopping audio capture module");
            }
        }
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_params(encoder: Encoder) -> VideoParams {
        VideoParams {
            encoder,
            width: 1920,
            height: 1080,
            framerate: 60,
            h264_crf: 25,
            h264_fullcolor: true,
            h264_streaming_mode: false,
            jpeg_quality: 40,
            paint_over_jpeg_quality: 90,
            use_paint_over_quality: true,
            h264_paintover_crf: 18,
            h264_paintover_burst_frames: 5,
            use_cpu: false,
            capture_cursor: true,
            vaapi_render_node_index: 0,
            watermark_path: String::new(),
            watermark_location: -1,
        }
    }

    #[test]
    fn h264_spellings_differ_only_in_fullframe() {
        let full = build_capture_settings(&h264_params(Encoder::X264enc));
        let striped = build_capture_settings(&h264_params(Encoder::X264encStriped));
        assert!(full.h264_fullframe);
        assert!(!striped.h264_fullframe);
        assert_eq!(full.h264_crf, striped.h264_crf);
        assert_eq!(full.output_mode, OUTPUT_MODE_H264_STRIPED);
        assert_eq!(striped.output_mode, OUTPUT_MODE_H264_STRIPED);
        assert_eq!(full.paint_over_trigger_frames, 5);
    }

    #[test]
    fn jpeg_settings_carry_quality_knobs() {
        let mut params = h264_params(Encoder::Jpeg);
        params.jpeg_quality = 55;
        params.paint_over_jpeg_quality = 95;
        let cs = build_capture_settings(&params);
        assert_eq!(cs.output_mode, OUTPUT_MODE_JPEG);
        assert_eq!(cs.jpeg_quality, 55);
        assert_eq!(cs.paint_over_jpeg_quality, 95);
        assert_eq!(cs.paint_over_trigger_frames, 15);
        // JPEG mode ignores the VA-API node.
        assert_eq!(cs.vaapi_render_node_index, -1);
    }

    #[test]
    fn missing_watermark_file_is_ignored() {
        let mut params = h264_params(Encoder::X264enc);
        params.watermark_path = "/nonexistent/mark.png".to_string();
        params.watermark_location = 2;
        let cs = build_capture_settings(&params);
        assert_eq!(cs.watermark_path[0], 0);
        assert_eq!(cs.watermark_location_enum, -1);
    }
}
