use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "selkies-stream")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Selkies WebSocket streaming server", long_about = None)]
pub struct Args {
    /// Port for the data websocket server
    #[arg(long, env = "SELKIES_PORT", default_value_t = 8082)]
    pub port: u16,

    /// Video encoder list (comma-separated; first entry is the default)
    #[arg(long, env = "SELKIES_ENCODER", default_value = "x264enc,x264enc-striped,jpeg")]
    pub encoder: String,

    /// Allowed framerate range (e.g. "8-120") or a fixed value (e.g. "60")
    #[arg(long, env = "SELKIES_FRAMERATE", default_value = "8-120")]
    pub framerate: String,

    /// Allowed H.264 CRF range or a fixed value
    #[arg(long, env = "SELKIES_H264_CRF", default_value = "5-50")]
    pub h264_crf: String,

    /// Allowed JPEG quality range or a fixed value
    #[arg(long, env = "SELKIES_JPEG_QUALITY", default_value = "1-100")]
    pub jpeg_quality: String,

    /// Allowed JPEG paint-over quality range or a fixed value
    #[arg(long, env = "SELKIES_PAINT_OVER_JPEG_QUALITY", default_value = "1-100")]
    pub paint_over_jpeg_quality: String,

    /// Allowed H.264 paint-over CRF range or a fixed value
    #[arg(long, env = "SELKIES_H264_PAINTOVER_CRF", default_value = "5-50")]
    pub h264_paintover_crf: String,

    /// Allowed H.264 paint-over burst frames range or a fixed value
    #[arg(long, env = "SELKIES_H264_PAINTOVER_BURST_FRAMES", default_value = "1-30")]
    pub h264_paintover_burst_frames: String,

    /// Enable H.264 full color range ("true", optionally "true|locked")
    #[arg(long, env = "SELKIES_H264_FULLCOLOR", default_value = "false")]
    pub h264_fullcolor: String,

    /// Enable H.264 streaming mode ("true", optionally "true|locked")
    #[arg(long, env = "SELKIES_H264_STREAMING_MODE", default_value = "false")]
    pub h264_streaming_mode: String,

    /// Force CPU-based encoding ("true", optionally "true|locked")
    #[arg(long, env = "SELKIES_USE_CPU", default_value = "false")]
    pub use_cpu: String,

    /// Enable high-quality paint-over for static scenes
    #[arg(long, env = "SELKIES_USE_PAINT_OVER_QUALITY", default_value = "true")]
    pub use_paint_over_quality: String,

    /// Allow binary data (e.g. images) on the clipboard
    #[arg(long, env = "SELKIES_ENABLE_BINARY_CLIPBOARD", default_value = "false")]
    pub enable_binary_clipboard: String,

    /// Enable clipboard synchronization
    #[arg(long, env = "SELKIES_CLIPBOARD_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub clipboard_enabled: bool,

    /// Enable parsing of command websocket messages
    #[arg(long, env = "SELKIES_COMMAND_ENABLED", default_value_t = false, action = clap::ArgAction::Set)]
    pub command_enabled: bool,

    /// Target video bitrate in kbps
    #[arg(long, env = "SELKIES_VIDEO_BITRATE", default_value_t = 16000)]
    pub video_bitrate: u32,

    /// Audio bitrate in bps
    #[arg(long, env = "SELKIES_AUDIO_BITRATE", default_value_t = 320000)]
    pub audio_bitrate: u32,

    /// PulseAudio source name for audio capture
    #[arg(long, env = "SELKIES_AUDIO_DEVICE_NAME", default_value = "output.monitor")]
    pub audio_device_name: String,

    /// Lock the resolution to the manual width/height values
    #[arg(long, env = "SELKIES_IS_MANUAL_RESOLUTION_MODE", default_value_t = false, action = clap::ArgAction::Set)]
    pub is_manual_resolution_mode: bool,

    /// Lock width to a fixed value (forces manual resolution mode)
    #[arg(long, env = "SELKIES_MANUAL_WIDTH", default_value_t = 0)]
    pub manual_width: u32,

    /// Lock height to a fixed value (forces manual resolution mode)
    #[arg(long, env = "SELKIES_MANUAL_HEIGHT", default_value_t = 0)]
    pub manual_height: u32,

    /// Default DPI for UI scaling
    #[arg(long, env = "SELKIES_SCALING_DPI", default_value_t = 96)]
    pub scaling_dpi: u32,

    /// Absolute path to a watermark PNG passed to the capture library
    #[arg(long, env = "WATERMARK_PNG", default_value = "")]
    pub watermark_path: String,

    /// Watermark location enum (0-6)
    #[arg(long, env = "WATERMARK_LOCATION", default_value_t = -1, allow_hyphen_values = true)]
    pub watermark_location: i32,

    /// Path to the DRI render node (e.g. /dev/dri/renderD128) for VA-API
    #[arg(long, env = "DRI_NODE", default_value = "")]
    pub dri_node: String,

    /// Allowed file transfer directions (comma-separated: "upload,download")
    #[arg(long, env = "SELKIES_FILE_TRANSFERS", default_value = "upload,download")]
    pub file_transfers: String,

    /// Directory to store uploaded files
    #[arg(long, env = "SELKIES_UPLOAD_DIR", default_value = "~/Desktop")]
    pub upload_dir: String,

    /// Directory for the virtual gamepad interposer sockets
    #[arg(long, env = "SELKIES_JS_SOCKET_PATH", default_value = "/tmp")]
    pub js_socket_path: String,

    /// Enable debug logging
    #[arg(long, env = "SELKIES_DEBUG", action)]
    pub debug: bool,
}
