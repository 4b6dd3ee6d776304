//! Session control for the data WebSocket
//!
//! One session per accepted connection. The capture pipelines themselves
//! are process-global and reference-counted by connected clients: the last
//! session to leave stops them. Every pipeline transition happens under the
//! core's pipeline mutex so concurrent SETTINGS / SET_* / resize / START /
//! STOP messages serialize cleanly.

use crate::backpressure::{FlowController, BACKPRESSURE_CHECK_INTERVAL};
use crate::broadcaster::{Broadcaster, ClientHandle};
use crate::capture::CaptureLibs;
use crate::clipboard::{self, ClipboardReceiver, ClipboardSync};
use crate::config::{Config, Encoder};
use crate::gamepad::GamepadHub;
use crate::input::{self, InputRouter};
use crate::mic::MicrophoneSink;
use crate::pipeline::{AudioPipeline, VideoPipeline, VideoParams};
use crate::protocol::{self, ClientMessage, StatsKind};
use crate::stats::{self, SharedStats};
use crate::upload::{UploadHandler, UploadSettings};
use crate::x11::{self, X11Input};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const PEER_PING_TIMEOUT: Duration = Duration::from_secs(3);
const TASK_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);
const BASE_CURSOR_SIZE: f64 = 32.0;

/// Effective stream parameters, mutated by client settings.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub encoder: Encoder,
    pub display_width: u32,
    pub display_height: u32,
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
    pub video_bitrate_kbps: u32,
    pub audio_bitrate: u32,
    pub resize_enabled: bool,
    pub is_manual_resolution_mode: bool,
    pub manual_width: u32,
    pub manual_height: u32,
    pub last_resize_success: bool,
}

impl StreamParams {
    pub fn from_config(config: &Config) -> Self {
        let (width, height) = if config.is_manual_resolution_mode {
            (config.manual_width, config.manual_height)
        } else {
            (1024, 768)
        };
        Self {
            encoder: config.initial_encoder(),
            display_width: width,
            display_height: height,
            framerate: config.framerate.value,
            h264_crf: config.h264_crf.value,
            h264_fullcolor: config.h264_fullcolor.value,
            h264_streaming_mode: config.h264_streaming_mode.value,
            jpeg_quality: config.jpeg_quality.value,
            paint_over_jpeg_quality: config.paint_over_jpeg_quality.value,
            use_paint_over_quality: config.use_paint_over_quality.value,
            h264_paintover_crf: config.h264_paintover_crf.value,
            h264_paintover_burst_frames: config.h264_paintover_burst_frames.value,
            use_cpu: config.use_cpu.value,
            capture_cursor: false,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate: config.audio_bitrate,
            resize_enabled: true,
            is_manual_resolution_mode: config.is_manual_resolution_mode,
            manual_width: config.manual_width,
            manual_height: config.manual_height,
            last_resize_success: true,
        }
    }

    fn video_params(&self, config: &Config) -> VideoParams {
        VideoParams {
            encoder: self.encoder,
            width: self.display_width,
            height: self.display_height,
            framerate: self.framerate,
            h264_crf: self.h264_crf,
            h264_fullcolor: self.h264_fullcolor,
            h264_streaming_mode: self.h264_streaming_mode,
            jpeg_quality: self.jpeg_quality,
            paint_over_jpeg_quality: self.paint_over_jpeg_quality,
            use_paint_over_quality: self.use_paint_over_quality,
            h264_paintover_crf: self.h264_paintover_crf,
            h264_paintover_burst_frames: self.h264_paintover_burst_frames,
            use_cpu: self.use_cpu,
            capture_cursor: self.capture_cursor,
            vaapi_render_node_index: config.vaapi_render_node_index,
            watermark_path: config.watermark_path.clone(),
            watermark_location: config.watermark_location,
        }
    }
}

/// Pipeline state guarded by the core mutex.
pub struct Pipelines {
    pub params: StreamParams,
    video: Option<VideoPipeline>,
    audio: Option<AudioPipeline>,
    backpressure: Option<JoinHandle<()>>,
}

/// Process-global streaming state shared by all sessions.
pub struct StreamingCore {
    pub config: Config,
    pub libs: CaptureLibs,
    pub broadcaster: Arc<Broadcaster>,
    pub flow: Arc<FlowController>,
    pub gamepads: Arc<GamepadHub>,
    pub clipboard_sync: Arc<ClipboardSync>,
    pub x11: Option<Arc<X11Input>>,
    pub upload_settings: UploadSettings,
    pipelines: Mutex<Pipelines>,
    configured_fps: Arc<AtomicU32>,
    video_active: Arc<AtomicBool>,
}

impl StreamingCore {
    pub fn new(
        config: Config,
        libs: CaptureLibs,
        broadcaster: Arc<Broadcaster>,
        gamepads: Arc<GamepadHub>,
        clipboard_sync: Arc<ClipboardSync>,
        x11: Option<Arc<X11Input>>,
    ) -> Arc<Self> {
        let params = StreamParams::from_config(&config);
        let upload_settings = UploadSettings::new(config.allow_upload, &config.upload_dir);
        let fps = params.framerate.max(1) as u32;
        Arc::new(Self {
            config,
            libs,
            broadcaster,
            flow: Arc::new(FlowController::new()),
            gamepads,
            clipboard_sync,
            x11,
            upload_settings,
            pipelines: Mutex::new(Pipelines {
                params,
                video: None,
                audio: None,
                backpressure: None,
            }),
            configured_fps: Arc::new(AtomicU32::new(fps)),
            video_active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Encoders usable in this process: the configured list, minus the
    /// striped modes when the video capture library is absent.
    pub fn available_encoders(&self) -> Vec<Encoder> {
        if self.libs.video_available() {
            self.config.encoders.clone()
        } else {
            Vec::new()
        }
    }

    fn set_configured_fps(&self, fps: i64) {
        self.configured_fps.store(fps.max(1) as u32, Ordering::Relaxed);
    }

    /// Zero both frame counters and tell every client before new frames.
    fn reset_frame_ids_and_notify(&self) {
        info!("Resetting frame IDs");
        self.flow.reset();
        self.broadcaster
            .broadcast_text(&protocol::pipeline_resetting_message());
    }

    async fn start_video_locked(&self, pipelines: &mut Pipelines) -> bool {
        if pipelines.video.is_some() {
            debug!("{} pipeline is already capturing", pipelines.params.encoder);
            return true;
        }
        let Some(lib) = self.libs.video.clone() else {
            error!("Cannot start video: capture library not available");
            return false;
        };
        let params = pipelines.params.video_params(&self.config);
        match VideoPipeline::start(
            lib,
            &params,
            self.flow.clone(),
            self.broadcaster.clone(),
        )
        .await
        {
            Ok(pipeline) => {
                pipelines.video = Some(pipeline);
                self.video_active.store(true, Ordering::Relaxed);
                if pipelines.backpressure.is_none() {
                    pipelines.backpressure = Some(self.spawn_backpressure_loop());
                }
                true
            }
            Err(err) => {
                error!("Failed to start {}: {}", params.encoder, err);
                false
            }
        }
    }

    /// Stop the active video pipeline. Every stop of a running pipeline
    /// resets frame ids and notifies clients, so both same-encoder restarts
    /// and encoder swaps broadcast `PIPELINE_RESETTING 0` before new frames.
    async fn stop_video_locked(&self, pipelines: &mut Pipelines) {
        if let Some(pipeline) = pipelines.video.take() {
            self.video_active.store(false, Ordering::Relaxed);
            pipeline.stop().await;
            if let Some(task) = pipelines.backpressure.take() {
                task.abort();
            }
            self.reset_frame_ids_and_notify();
        }
    }

    async fn start_audio_locked(&self, pipelines: &mut Pipelines) -> bool {
        if pipelines.audio.is_some() {
            debug!("Audio pipeline is already capturing");
            return true;
        }
        let Some(lib) = self.libs.audio.clone() else {
            warn!("Cannot start audio: capture library not available");
            return false;
        };
        match AudioPipeline::start(
            lib,
            &self.config.audio_device_name,
            2,
            pipelines.params.audio_bitrate,
            self.broadcaster.clone(),
        )
        .await
        {
            Ok(pipeline) => {
                pipelines.audio = Some(pipeline);
                true
            }
            Err(err) => {
                error!("Failed to start audio pipeline: {}", err);
                false
            }
        }
    }

    async fn stop_audio_locked(&self, pipelines: &mut Pipelines) {
        if let Some(pipeline) = pipelines.audio.take() {
            pipeline.stop().await;
        }
    }

    async fn restart_video_locked(&self, pipelines: &mut Pipelines) -> bool {
        self.stop_video_locked(pipelines).await;
        self.start_video_locked(pipelines).await
    }

    /// Unified stop for shutdown paths.
    pub async fn shutdown_pipelines(&self) {
        info!("Initiating unified pipeline shutdown...");
        let mut pipelines = self.pipelines.lock().await;
        if let Some(pipeline) = pipelines.video.take() {
            self.video_active.store(false, Ordering::Relaxed);
            pipeline.stop().await;
        }
        if let Some(task) = pipelines.backpressure.take() {
            task.abort();
        }
        self.flow.reset();
        if let Some(pipeline) = pipelines.audio.take() {
            pipeline.stop().await;
        }
        pipelines.params.capture_cursor = false;
        info!("Unified pipeline shutdown complete");
    }

    fn spawn_backpressure_loop(&self) -> JoinHandle<()> {
        let flow = self.flow.clone();
        let broadcaster = self.broadcaster.clone();
        let video_active = self.video_active.clone();
        let configured_fps = self.configured_fps.clone();
        info!("Starting frame backpressure task");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL).await;
                if !video_active.load(Ordering::Relaxed) {
                    flow.open_gate();
                    continue;
                }
                if broadcaster.is_empty() {
                    flow.open_gate();
                    continue;
                }
                let fps = configured_fps.load(Ordering::Relaxed) as f64;
                flow.evaluate(fps, std::time::Instant::now());
            }
        })
    }

    fn broadcast_stream_resolution(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            warn!(
                "Skipping stream resolution broadcast for invalid dimensions {}x{}",
                width, height
            );
            return;
        }
        let message = protocol::stream_resolution_message(width, height);
        info!("Broadcasting stream resolution: {}", message);
        self.broadcaster.set_resolution_message(message.clone());
        self.broadcaster.broadcast_text(&message);
    }

    /// Resize the X display, restarting video around the mode switch when
    /// it was running. On tool failure video stays stopped and
    /// `last_resize_success` records the failure.
    async fn handle_resize(&self, width: u32, height: u32) {
        let (mut w, mut h) = x11::clamp_resize_request(width, height);
        w -= w % 2;
        h -= h % 2;
        let mut pipelines = self.pipelines.lock().await;
        if w == 0 || h == 0 {
            warn!("Rejecting resize to invalid dimensions {}x{}", width, height);
            pipelines.params.last_resize_success = false;
            return;
        }
        if (w, h) == (pipelines.params.display_width, pipelines.params.display_height) {
            info!("Ignoring redundant resize request for {}x{}", w, h);
            return;
        }
        info!("Handling resize request to {}x{}", w, h);

        let video_was_running = pipelines.video.is_some();
        if video_was_running {
            self.stop_video_locked(&mut pipelines).await;
        }

        let res_str = format!("{}x{}", w, h);
        if x11::resize_display(&res_str).await {
            pipelines.params.display_width = w;
            pipelines.params.display_height = h;
            pipelines.params.last_resize_success = true;
            self.broadcast_stream_resolution(w, h);
            if video_was_running {
                self.start_video_locked(&mut pipelines).await;
            }
        } else {
            error!("Resize to {} failed; video not restarted", res_str);
            pipelines.params.last_resize_success = false;
        }
    }

    /// Apply a SETTINGS payload. Restarts pipelines when any effective
    /// encoder parameter diffs from the previous value.
    async fn apply_settings(&self, settings: &Value, is_initial: bool) {
        info!("Applying client settings (initial={})", is_initial);
        let mut pipelines = self.pipelines.lock().await;
        let old = pipelines.params.clone();
        let config = &self.config;

        // Resolution first: it decides the target dimensions before any
        // restart decision.
        let is_manual = get_bool(settings, "webrtc_isManualResolutionMode")
            .unwrap_or(old.is_manual_resolution_mode);
        let mut target_w = old.display_width;
        let mut target_h = old.display_height;
        if is_manual {
            target_w = get_int(settings, "webrtc_manualWidth").unwrap_or(target_w as i64) as u32;
            target_h = get_int(settings, "webrtc_manualHeight").unwrap_or(target_h as i64) as u32;
        } else if is_initial {
            target_w =
                get_int(settings, "webrtc_initialClientWidth").unwrap_or(target_w as i64) as u32;
            target_h =
                get_int(settings, "webrtc_initialClientHeight").unwrap_or(target_h as i64) as u32;
        }
        if target_w == 0 {
            target_w = old.display_width;
        }
        if target_h == 0 {
            target_h = old.display_height;
        }
        target_w -= target_w % 2;
        target_h -= target_h % 2;
        if target_w == 0 {
            target_w = old.display_width;
        }
        if target_h == 0 {
            target_h = old.display_height;
        }

        pipelines.params.is_manual_resolution_mode = is_manual;
        if is_manual {
            pipelines.params.manual_width = target_w;
            pipelines.params.manual_height = target_h;
        }
        pipelines.params.resize_enabled =
            get_bool(settings, "webrtc_resizeRemote").unwrap_or(old.resize_enabled);

        if (target_w, target_h) != (old.display_width, old.display_height) {
            pipelines.params.display_width = target_w;
            pipelines.params.display_height = target_h;
            if pipelines.params.resize_enabled {
                let res_str = format!("{}x{}", target_w, target_h);
                info!("Settings request display resize to {}", res_str);
                if x11::resize_display(&res_str).await {
                    pipelines.params.last_resize_success = true;
                    self.broadcast_stream_resolution(target_w, target_h);
                } else {
                    pipelines.params.last_resize_success = false;
                }
            }
        }

        if let Some(enabled) = get_bool(settings, "enableBinaryClipboard") {
            if !config.enable_binary_clipboard.locked {
                self.clipboard_sync.set_binary_enabled(enabled);
            }
        }

        let mut encoder_changed = false;
        if let Some(requested) = get_str(settings, "webrtc_encoder") {
            match Encoder::parse(&requested) {
                Some(encoder)
                    if config.encoders.contains(&encoder) && self.libs.video_available() =>
                {
                    if encoder != old.encoder {
                        info!("Encoder changed from '{}' to '{}'", old.encoder, encoder);
                        pipelines.params.encoder = encoder;
                        encoder_changed = true;
                    }
                }
                _ => warn!(
                    "Requested encoder '{}' is not available; keeping '{}'",
                    requested, old.encoder
                ),
            }
        }
        let encoder = pipelines.params.encoder;
        let is_h264 = encoder.is_h264();
        let is_jpeg = encoder == Encoder::Jpeg;

        if let Some(bitrate_bps) = get_int(settings, "webrtc_videoBitRate") {
            pipelines.params.video_bitrate_kbps = (bitrate_bps / 1000).max(1) as u32;
        }
        if let Some(fps) = get_int(settings, "webrtc_videoFramerate") {
            pipelines.params.framerate = config.framerate.clamp(fps);
            self.set_configured_fps(pipelines.params.framerate);
        }
        if is_h264 {
            if let Some(crf) = get_int(settings, "webrtc_videoCRF") {
                pipelines.params.h264_crf = config.h264_crf.clamp(crf);
            }
            if let Some(v) = get_bool(settings, "webrtc_h264_fullcolor") {
                if !config.h264_fullcolor.locked {
                    pipelines.params.h264_fullcolor = v;
                }
            }
            if let Some(v) = get_bool(settings, "webrtc_h264_streaming_mode") {
                if !config.h264_streaming_mode.locked {
                    pipelines.params.h264_streaming_mode = v;
                }
            }
            if let Some(v) = get_int(settings, "pixelflux_h264_paintover_crf") {
                pipelines.params.h264_paintover_crf = config.h264_paintover_crf.clamp(v);
            }
            if let Some(v) = get_int(settings, "pixelflux_h264_paintover_burst_frames") {
                pipelines.params.h264_paintover_burst_frames =
                    config.h264_paintover_burst_frames.clamp(v);
            }
            if let Some(v) = get_bool(settings, "pixelflux_use_cpu") {
                if !config.use_cpu.locked {
                    pipelines.params.use_cpu = v;
                }
            }
        }
        if is_jpeg {
            if let Some(v) = get_int(settings, "pixelflux_jpeg_quality") {
                pipelines.params.jpeg_quality = config.jpeg_quality.clamp(v);
            }
            if let Some(v) = get_int(settings, "pixelflux_paint_over_jpeg_quality") {
                pipelines.params.paint_over_jpeg_quality =
                    config.paint_over_jpeg_quality.clamp(v);
            }
        }
        if let Some(v) = get_bool(settings, "pixelflux_use_paint_over_quality") {
            if !config.use_paint_over_quality.locked {
                pipelines.params.use_paint_over_quality = v;
            }
        }
        if let Some(bitrate) = get_int(settings, "webrtc_audioBitRate") {
            pipelines.params.audio_bitrate = bitrate.max(1) as u32;
        }

        if let Some(dpi) = get_int(settings, "webrtc_SCALING_DPI") {
            if dpi > 0 {
                self.apply_dpi(dpi as u32).await;
            }
        }

        // Restart decision.
        let params = &pipelines.params;
        let resolution_changed = params.display_width != old.display_width
            || params.display_height != old.display_height;
        let mut restart_video = encoder_changed || resolution_changed;
        if params.framerate != old.framerate {
            restart_video = true;
        }
        if is_h264
            && (params.h264_crf != old.h264_crf
                || params.h264_fullcolor != old.h264_fullcolor
                || params.h264_streaming_mode != old.h264_streaming_mode
                || params.use_cpu != old.use_cpu
                || params.h264_paintover_crf != old.h264_paintover_crf
                || params.h264_paintover_burst_frames != old.h264_paintover_burst_frames
                || params.use_paint_over_quality != old.use_paint_over_quality)
        {
            restart_video = true;
        }
        if is_jpeg
            && (params.jpeg_quality != old.jpeg_quality
                || params.paint_over_jpeg_quality != old.paint_over_jpeg_quality
                || params.use_paint_over_quality != old.use_paint_over_quality)
        {
            restart_video = true;
        }
        let video_active = pipelines.video.is_some();
        if is_initial && !video_active {
            info!("Pipeline inactive for the initial client; forcing a start");
            restart_video = true;
        }
        let restart_audio = pipelines.params.audio_bitrate != old.audio_bitrate;

        if restart_video && self.libs.video_available() && (video_active || is_initial) {
            self.restart_video_locked(&mut pipelines).await;
        }
        if restart_audio && pipelines.audio.is_some() {
            info!("Restarting audio pipeline due to settings update");
            self.stop_audio_locked(&mut pipelines).await;
            self.start_audio_locked(&mut pipelines).await;
        }
        if is_initial && pipelines.audio.is_none() && self.libs.audio_available() {
            info!("Initial setup: starting audio pipeline");
            self.start_audio_locked(&mut pipelines).await;
        }
    }

    async fn apply_dpi(&self, dpi: u32) {
        if x11::set_dpi(dpi).await {
            info!("Successfully set DPI to {}", dpi);
        } else {
            error!("Failed to set DPI to {}", dpi);
        }
        let cursor_size = ((dpi as f64 / 96.0 * BASE_CURSOR_SIZE).round() as i64).max(1);
        if x11::set_cursor_size(cursor_size).await {
            info!("Successfully set cursor size to {}", cursor_size);
        } else {
            error!("Failed to set cursor size to {}", cursor_size);
        }
    }
}

fn get_int(settings: &Value, key: &str) -> Option<i64> {
    match settings.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_bool(settings: &Value, key: &str) -> Option<bool> {
    match settings.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.trim().eq_ignore_ascii_case("true")),
        _ => None,
    }
}

fn get_str(settings: &Value, key: &str) -> Option<String> {
    settings.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Bind the data WebSocket listener and serve sessions forever. A failed
/// bind is fatal; later accept errors retry after a short pause.
pub async fn run_server(core: Arc<StreamingCore>) -> Result<(), std::io::Error> {
    let addr = format!("0.0.0.0:{}", core.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Data WebSocket server listening on port {}", core.config.port);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(err) = run_session(stream, peer, core).await {
                        debug!("Session for {} ended: {}", peer, err);
                    }
                });
            }
            Err(err) => {
                error!("Accept error on data WebSocket listener: {}", err);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Drive one client connection from handshake to teardown.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    core: Arc<StreamingCore>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("Data WebSocket connected from {}", peer);

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let client = ClientHandle::new(outbound_tx);
    let client_id = client.id;
    core.broadcaster.add(client.clone());

    // Per-connection flow state starts clean (new RTT history, fresh ids).
    core.flow.reset();

    // Handshake: MODE, current resolution, cached cursor, capabilities.
    client.send_text(protocol::mode_message());
    match core.broadcaster.last_resolution_message() {
        Some(message) => client.send_text(message),
        None => {
            let pipelines = core.pipelines.lock().await;
            let (w, h) = (
                pipelines.params.display_width,
                pipelines.params.display_height,
            );
            drop(pipelines);
            core.broadcast_stream_resolution(w, h);
        }
    }
    core.broadcaster.replay_cursor(&client);
    client.send_text(protocol::server_settings_message(&core.available_encoders()));

    // Per-session collaborators.
    let mut router = InputRouter::new(core.x11.clone());
    let mut clipboard_rx =
        ClipboardReceiver::new(core.clipboard_sync.clone(), core.config.enable_clipboard);
    let mut uploads = UploadHandler::new(core.upload_settings.clone());
    let mut mic = MicrophoneSink::new();
    let mut initial_settings_processed = false;

    let shared_stats = Arc::new(SharedStats::new());
    let mut aux_tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(stats::collect_system_stats(shared_stats.clone())),
        tokio::spawn(stats::collect_gpu_stats(shared_stats.clone(), 0)),
        tokio::spawn(stats::collect_network_stats(
            shared_stats.clone(),
            core.broadcaster.clone(),
        )),
        tokio::spawn(stats::send_stats_periodically(
            client.clone(),
            shared_stats.clone(),
        )),
    ];

    // WebSocket keepalive: ping every 20 s, give up after two misses.
    {
        let client = client.clone();
        aux_tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                if client.pong_age() > KEEPALIVE_INTERVAL * 2 {
                    warn!("Keepalive expired for client {}; closing", client.id);
                    client.send_close();
                    break;
                }
                client.send_ping();
            }
        }));
    }

    while let Some(message) = read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!("Data WS closed with error from {}: {}", peer, err);
                break;
            }
        };
        match message {
            Message::Binary(data) => {
                if data.is_empty() {
                    continue;
                }
                match data[0] {
                    protocol::CLIENT_TAG_FILE_CHUNK => uploads.write_chunk(&data[1..]),
                    protocol::CLIENT_TAG_MIC_PCM => mic.write(&data[1..]),
                    other => debug!("Unknown binary frame tag 0x{:02x}", other),
                }
            }
            Message::Text(text) => {
                let parsed = match protocol::parse_client_message(&text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!("{}", err);
                        continue;
                    }
                };
                handle_client_message(
                    &core,
                    &client,
                    parsed,
                    &mut router,
                    &mut clipboard_rx,
                    &mut uploads,
                    &mut initial_settings_processed,
                )
                .await;
            }
            Message::Ping(payload) => {
                client.record_pong();
                client.send_pong(payload);
            }
            Message::Pong(_) => client.record_pong(),
            Message::Close(_) => break,
            Message::Frame(_) => {}
        }
    }

    // --- Teardown ---
    info!("Cleaning up data WS handler for {}...", peer);
    core.broadcaster.remove(&client_id);

    for task in &aux_tasks {
        task.abort();
    }
    for task in aux_tasks {
        let _ = tokio::time::timeout(TASK_CANCEL_TIMEOUT, task).await;
    }

    mic.close();
    if uploads.is_active() {
        uploads.abort();
    }

    // Reference counting: probe the remaining clients; unresponsive peers
    // are dropped, and with no live peers the global pipelines stop.
    let peers = core.broadcaster.peers_of(&client_id);
    let stop_pipelines = if peers.is_empty() {
        info!("No other clients after {} disconnected; stopping pipelines", peer);
        true
    } else {
        for other in &peers {
            other.send_ping();
        }
        tokio::time::sleep(PEER_PING_TIMEOUT).await;
        let mut any_responsive = false;
        for other in peers {
            if other.pong_age() <= PEER_PING_TIMEOUT + Duration::from_secs(1) {
                any_responsive = true;
            } else {
                warn!("Remaining client {} unresponsive; removing", other.id);
                core.broadcaster.remove(&other.id);
            }
        }
        if !any_responsive {
            info!("No responsive clients remain; stopping pipelines");
        }
        !any_responsive
    };

    if stop_pipelines {
        core.shutdown_pipelines().await;
    }

    drop(writer_task);
    info!("Data WS handler for {} finished all cleanup", peer);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_message(
    core: &Arc<StreamingCore>,
    client: &ClientHandle,
    message: ClientMessage,
    router: &mut InputRouter,
    clipboard_rx: &mut ClipboardReceiver,
    uploads: &mut UploadHandler,
    initial_settings_processed: &mut bool,
) {
    match message {
        ClientMessage::Settings(settings) => {
            let is_initial = !*initial_settings_processed;
            core.apply_settings(&settings, is_initial).await;
            if is_initial {
                *initial_settings_processed = true;
                info!("Initial client settings processed");
            }
        }
        ClientMessage::FrameAck(id) => core.flow.record_ack(id),
        ClientMessage::StartVideo => {
            let mut pipelines = core.pipelines.lock().await;
            info!("Received START_VIDEO for encoder: {}", pipelines.params.encoder);
            if core.start_video_locked(&mut pipelines).await {
                core.broadcaster.broadcast_text("VIDEO_STARTED");
            } else {
                warn!("START_VIDEO: failed to start pipeline");
            }
        }
        ClientMessage::StopVideo => {
            let mut pipelines = core.pipelines.lock().await;
            info!("Received STOP_VIDEO");
            core.stop_video_locked(&mut pipelines).await;
            core.broadcaster.broadcast_text("VIDEO_STOPPED");
        }
        ClientMessage::StartAudio => {
            let mut pipelines = core.pipelines.lock().await;
            info!("Received START_AUDIO");
            core.start_audio_locked(&mut pipelines).await;
            core.broadcaster.broadcast_text("AUDIO_STARTED");
        }
        ClientMessage::StopAudio => {
            let mut pipelines = core.pipelines.lock().await;
            info!("Received STOP_AUDIO");
            core.stop_audio_locked(&mut pipelines).await;
            core.broadcaster.broadcast_text("AUDIO_STOPPED");
        }
        ClientMessage::SetEncoder(name) => {
            let Some(encoder) = Encoder::parse(&name) else {
                warn!("SET_ENCODER: '{}' is not a known encoder", name);
                return;
            };
            if !core.config.encoders.contains(&encoder) || !core.libs.video_available() {
                warn!("SET_ENCODER: '{}' is not available; no change", name);
                return;
            }
            let mut pipelines = core.pipelines.lock().await;
            if pipelines.params.encoder == encoder {
                info!("SET_ENCODER: encoder '{}' is already active", encoder);
                return;
            }
            info!("Received SET_ENCODER: {}", encoder);
            let was_running = pipelines.video.is_some();
            core.stop_video_locked(&mut pipelines).await;
            pipelines.params.encoder = encoder;
            if was_running {
                core.start_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetFramerate(fps) => {
            let mut pipelines = core.pipelines.lock().await;
            let clamped = core.config.framerate.clamp(fps);
            if pipelines.params.framerate == clamped {
                return;
            }
            info!("Received SET_FRAMERATE: {}", clamped);
            pipelines.params.framerate = clamped;
            core.set_configured_fps(clamped);
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetCrf(crf) => {
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() {
                warn!(
                    "SET_CRF received but current encoder '{}' does not use CRF",
                    pipelines.params.encoder
                );
                return;
            }
            let clamped = core.config.h264_crf.clamp(crf);
            if pipelines.params.h264_crf == clamped {
                return;
            }
            info!("Received SET_CRF: {}", clamped);
            pipelines.params.h264_crf = clamped;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetJpegQuality(quality) => {
            let mut pipelines = core.pipelines.lock().await;
            if pipelines.params.encoder != Encoder::Jpeg {
                warn!(
                    "SET_JPEG_QUALITY received but current encoder is '{}', not 'jpeg'",
                    pipelines.params.encoder
                );
                return;
            }
            let clamped = core.config.jpeg_quality.clamp(quality);
            if pipelines.params.jpeg_quality == clamped {
                return;
            }
            info!("Received SET_JPEG_QUALITY: {}", clamped);
            pipelines.params.jpeg_quality = clamped;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetPaintOverJpegQuality(quality) => {
            let mut pipelines = core.pipelines.lock().await;
            if pipelines.params.encoder != Encoder::Jpeg {
                warn!(
                    "SET_PAINT_OVER_JPEG_QUALITY received but current encoder is '{}'",
                    pipelines.params.encoder
                );
                return;
            }
            let clamped = core.config.paint_over_jpeg_quality.clamp(quality);
            if pipelines.params.paint_over_jpeg_quality == clamped {
                return;
            }
            info!("Received SET_PAINT_OVER_JPEG_QUALITY: {}", clamped);
            pipelines.params.paint_over_jpeg_quality = clamped;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetUsePaintOverQuality(value) => {
            if core.config.use_paint_over_quality.locked {
                return;
            }
            let mut pipelines = core.pipelines.lock().await;
            if pipelines.params.use_paint_over_quality == value {
                return;
            }
            info!("Received SET_USE_PAINT_OVER_QUALITY: {}", value);
            pipelines.params.use_paint_over_quality = value;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetH264Fullcolor(value) => {
            if core.config.h264_fullcolor.locked {
                return;
            }
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() || pipelines.params.h264_fullcolor == value {
                return;
            }
            info!("Received SET_H264_FULLCOLOR: {}", value);
            pipelines.params.h264_fullcolor = value;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetH264StreamingMode(value) => {
            if core.config.h264_streaming_mode.locked {
                return;
            }
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() || pipelines.params.h264_streaming_mode == value
            {
                return;
            }
            info!("Received SET_H264_STREAMING_MODE: {}", value);
            pipelines.params.h264_streaming_mode = value;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetH264PaintoverCrf(crf) => {
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() {
                return;
            }
            let clamped = core.config.h264_paintover_crf.clamp(crf);
            if pipelines.params.h264_paintover_crf == clamped {
                return;
            }
            info!("Received SET_H264_PAINTOVER_CRF: {}", clamped);
            pipelines.params.h264_paintover_crf = clamped;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetH264PaintoverBurstFrames(frames) => {
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() {
                return;
            }
            let clamped = core.config.h264_paintover_burst_frames.clamp(frames);
            if pipelines.params.h264_paintover_burst_frames == clamped {
                return;
            }
            info!("Received SET_H264_PAINTOVER_BURST_FRAMES: {}", clamped);
            pipelines.params.h264_paintover_burst_frames = clamped;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetUseCpu(value) => {
            if core.config.use_cpu.locked {
                return;
            }
            let mut pipelines = core.pipelines.lock().await;
            if !pipelines.params.encoder.is_h264() || pipelines.params.use_cpu == value {
                return;
            }
            info!("Received SET_USE_CPU: {}", value);
            pipelines.params.use_cpu = value;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::SetNativeCursorRendering(value) => {
            let mut pipelines = core.pipelines.lock().await;
            if pipelines.params.capture_cursor == value {
                return;
            }
            info!("Received SET_NATIVE_CURSOR_RENDERING: {}", value);
            pipelines.params.capture_cursor = value;
            if pipelines.video.is_some() {
                core.restart_video_locked(&mut pipelines).await;
            }
        }
        ClientMessage::Resize { width, height } => {
            core.handle_resize(width, height).await;
        }
        ClientMessage::SetDpi(dpi) => {
            info!("Received DPI setting from client: {}", dpi);
            core.apply_dpi(dpi).await;
        }
        ClientMessage::MouseMove {
            x,
            y,
            button_mask,
            scroll_magnitude,
            relative,
        } => {
            router.mouse(x, y, button_mask, scroll_magnitude, relative).await;
        }
        ClientMessage::KeyDown(keysym) => router.key_down(keysym).await,
        ClientMessage::KeyUp(keysym) => router.key_up(keysym).await,
        ClientMessage::KeyboardReset => router.reset_keyboard().await,
        ClientMessage::TypeText(text) => router.type_text(&text).await,
        ClientMessage::GamepadConnect {
            index,
            name,
            num_axes,
            num_btns,
        } => core.gamepads.connect(index, &name, num_btns, num_axes),
        ClientMessage::GamepadDisconnect { index } => core.gamepads.disconnect(index),
        ClientMessage::GamepadButton {
            index,
            button,
            value,
        } => core.gamepads.send_event(index, button, value, true),
        ClientMessage::GamepadAxis { index, axis, value } => {
            core.gamepads.send_event(index, axis, value, false)
        }
        ClientMessage::ClipboardWrite { data_b64 } => {
            clipboard_rx.write_single_text(&data_b64).await
        }
        ClientMessage::ClipboardWriteBinary { mime, data_b64 } => {
            clipboard_rx.write_single_binary(&mime, &data_b64).await
        }
        ClientMessage::ClipboardRead => {
            if core.config.enable_clipboard {
                clipboard::broadcast_clipboard(&core.clipboard_sync, &core.broadcaster).await
            } else {
                warn!("Rejecting clipboard read: outbound clipboard disabled");
            }
        }
        ClientMessage::ClipboardStartText { total_size } => {
            clipboard_rx.start("text/plain", total_size)
        }
        ClientMessage::ClipboardStartBinary { mime, total_size } => {
            clipboard_rx.start(&mime, total_size)
        }
        ClientMessage::ClipboardChunk { data_b64 } => clipboard_rx.chunk(&data_b64),
        ClientMessage::ClipboardFinish => clipboard_rx.finish().await,
        ClientMessage::Command(command) => {
            input::run_client_command(&command, core.config.enable_commands)
        }
        ClientMessage::Pong => debug!("Text pong from client {}", client.id),
        ClientMessage::ArgFps(fps) => {
            let mut pipelines = core.pipelines.lock().await;
            pipelines.params.framerate = core.config.framerate.clamp(fps);
            core.set_configured_fps(pipelines.params.framerate);
        }
        ClientMessage::ArgResize {
            enabled,
            resolution,
        } => {
            {
                let mut pipelines = core.pipelines.lock().await;
                pipelines.params.resize_enabled = enabled;
            }
            if enabled {
                if let Some((width, height)) = resolution {
                    core.handle_resize(width, height).await;
                }
            }
        }
        ClientMessage::ClientFps(fps) => core.flow.set_client_fps(fps),
        ClientMessage::ClientLatency(latency) => {
            debug!("Client {} reports latency {} ms", client.id, latency)
        }
        ClientMessage::ClientStats { kind, payload } => {
            let label = match kind {
                StatsKind::Video => "video",
                StatsKind::Audio => "audio",
            };
            debug!("Client {} {} stats: {:.120}", client.id, label, payload);
        }
        ClientMessage::VideoBitrate(kbps) => {
            let mut pipelines = core.pipelines.lock().await;
            pipelines.params.video_bitrate_kbps = kbps.max(1) as u32;
        }
        ClientMessage::AudioBitrate(bps) => {
            let mut pipelines = core.pipelines.lock().await;
            pipelines.params.audio_bitrate = bps.max(1) as u32;
            if pipelines.audio.is_some() {
                info!("Restarting audio pipeline for new bitrate {}", bps);
                core.stop_audio_locked(&mut pipelines).await;
                core.start_audio_locked(&mut pipelines).await;
            }
        }
        ClientMessage::UploadStart { rel_path, size } => uploads.start(&rel_path, size),
        ClientMessage::UploadEnd => uploads.finish(),
        ClientMessage::UploadError => {
            error!("Client reported upload error");
            uploads.abort();
        }
        ClientMessage::Unknown(text) => router.unknown(&text),
    }
}

#[cfg(test)]
impl StreamingCore {
    async fn params_snapshot(&self) -> StreamParams {
        self.pipelines.lock().await.params.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Args;
    use clap::Parser;

    fn test_config() -> Config {
        let args = Args::parse_from(["selkies-stream"]);
        Config::from_args(&args).expect("config")
    }

    async fn test_core() -> (Arc<StreamingCore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let gamepads = Arc::new(GamepadHub::start(dir.path()).await.expect("hub"));
        let core = StreamingCore::new(
            test_config(),
            CaptureLibs {
                video: None,
                audio: None,
            },
            Arc::new(Broadcaster::new()),
            gamepads,
            Arc::new(ClipboardSync::new(false)),
            None,
        );
        (core, dir)
    }

    #[tokio::test]
    async fn resize_to_1x1_is_rejected() {
        let (core, _dir) = test_core().await;
        // 1x1 becomes 0x0 after the even adjustment and must be refused.
        core.handle_resize(1, 1).await;
        let params = core.params_snapshot().await;
        assert!(!params.last_resize_success);
        assert_eq!(params.display_width, 1024);
        assert_eq!(params.display_height, 768);
    }

    #[tokio::test]
    async fn settings_mutate_params_with_range_clamping() {
        let (core, _dir) = test_core().await;
        let settings: Value = serde_json::from_str(
            r#"{"webrtc_videoFramerate": 500, "webrtc_videoCRF": 30,
                "pixelflux_use_cpu": true, "webrtc_resizeRemote": false,
                "webrtc_audioBitRate": 128000}"#,
        )
        .unwrap();
        core.apply_settings(&settings, true).await;
        let params = core.params_snapshot().await;
        // 500 fps clamps to the configured 8-120 range.
        assert_eq!(params.framerate, 120);
        assert_eq!(params.h264_crf, 30);
        assert!(params.use_cpu);
        assert!(!params.resize_enabled);
        assert_eq!(params.audio_bitrate, 128_000);
    }

    #[test]
    fn params_default_to_initial_encoder_and_resolution() {
        let config = test_config();
        let params = StreamParams::from_config(&config);
        assert_eq!(params.encoder, Encoder::X264enc);
        assert_eq!(params.display_width, 1024);
        assert_eq!(params.display_height, 768);
        assert_eq!(params.framerate, 60);
        assert!(params.last_resize_success);
    }

    #[test]
    fn manual_resolution_overrides_defaults() {
        let args = Args::parse_from([
            "selkies-stream",
            "--manual-width",
            "2560",
            "--manual-height",
            "1440",
        ]);
        let config = Config::from_args(&args).expect("config");
        assert!(config.is_manual_resolution_mode);
        let params = StreamParams::from_config(&config);
        assert_eq!(params.display_width, 2560);
        assert_eq!(params.display_height, 1440);
    }

    #[test]
    fn settings_value_coercion() {
        let settings: Value = serde_json::from_str(
            r#"{"webrtc_videoFramerate": 45, "webrtc_videoCRF": "30",
                "webrtc_h264_fullcolor": "true", "webrtc_resizeRemote": false}"#,
        )
        .unwrap();
        assert_eq!(get_int(&settings, "webrtc_videoFramerate"), Some(45));
        assert_eq!(get_int(&settings, "webrtc_videoCRF"), Some(30));
        assert_eq!(get_bool(&settings, "webrtc_h264_fullcolor"), Some(true));
        assert_eq!(get_bool(&settings, "webrtc_resizeRemote"), Some(false));
        assert_eq!(get_int(&settings, "missing"), None);
    }

    #[test]
    fn video_params_follow_encoder() {
        let config = test_config();
        let mut params = StreamParams::from_config(&config);
        params.encoder = Encoder::Jpeg;
        let vp = params.video_params(&config);
        assert_eq!(vp.encoder, Encoder::Jpeg);
        assert_eq!(vp.width, 1024);
        params.encoder = Encoder::X264encStriped;
        let vp = params.video_params(&config);
        assert!(!vp.encoder.fullframe());
    }
}
