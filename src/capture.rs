//! Native capture library bindings
//!
//! Video capture (libpixelflux.so) and audio capture (libpcmflux.so) are
//! C libraries loaded at runtime with dlopen. When a library is missing the
//! matching encoders are simply not advertised to clients.
//!
//! The libraries invoke their callbacks on threads they own. The
//! trampolines here copy the buffer into owned memory and push it onto a
//! channel; no capture-owned pointer survives past the callback return and
//! nothing on that thread touches session state.

use libc::{c_char, c_int, c_void};
use log::{info, warn};
use std::ffi::CString;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const OUTPUT_MODE_JPEG: c_int = 0;
pub const OUTPUT_MODE_H264_STRIPED: c_int = 1;

const WATERMARK_PATH_MAX: usize = 256;
const AUDIO_DEVICE_NAME_MAX: usize = 256;

/// Settings handed to the video capture library. Field meanings follow the
/// library's own header; everything is plain C data.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CaptureSettings {
    pub capture_width: c_int,
    pub capture_height: c_int,
    pub capture_x: c_int,
    pub capture_y: c_int,
    pub target_fps: f64,
    pub output_mode: c_int,
    pub jpeg_quality: c_int,
    pub paint_over_jpeg_quality: c_int,
    pub use_paint_over_quality: bool,
    pub paint_over_trigger_frames: c_int,
    pub damage_block_threshold: c_int,
    pub damage_block_duration: c_int,
    pub h264_crf: c_int,
    pub h264_fullcolor: bool,
    pub h264_fullframe: bool,
    pub h264_streaming_mode: bool,
    pub h264_paintover_crf: c_int,
    pub h264_paintover_burst_frames: c_int,
    pub capture_cursor: bool,
    pub use_cpu: bool,
    pub vaapi_render_node_index: c_int,
    pub watermark_path: [c_char; WATERMARK_PATH_MAX],
    pub watermark_location_enum: c_int,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture_width: 1024,
            capture_height: 768,
            capture_x: 0,
            capture_y: 0,
            target_fps: 60.0,
            output_mode: OUTPUT_MODE_JPEG,
            jpeg_quality: 40,
            paint_over_jpeg_quality: 90,
            use_paint_over_quality: true,
            paint_over_trigger_frames: 15,
            damage_block_threshold: 10,
            damage_block_duration: 20,
            h264_crf: 25,
            h264_fullcolor: false,
            h264_fullframe: false,
            h264_streaming_mode: false,
            h264_paintover_crf: 18,
            h264_paintover_burst_frames: 5,
            capture_cursor: false,
            use_cpu: false,
            vaapi_render_node_index: -1,
            watermark_path: [0; WATERMARK_PATH_MAX],
            watermark_location_enum: -1,
        }
    }
}

impl CaptureSettings {
    pub fn set_watermark_path(&mut self, path: &str) {
        let bytes = path.as_bytes();
        let len = bytes.len().min(WATERMARK_PATH_MAX - 1);
        for (i, &b) in bytes[..len].iter().enumerate() {
            self.watermark_path[i] = b as c_char;
        }
        self.watermark_path[len] = 0;
    }
}

/// Settings handed to the audio capture library.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioSettings {
    pub device_name: [c_char; AUDIO_DEVICE_NAME_MAX],
    pub sample_rate: c_int,
    pub channels: c_int,
    pub opus_bitrate: c_int,
    pub frame_duration_ms: c_int,
    pub use_vbr: bool,
    pub use_silence_gate: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            device_name: [0; AUDIO_DEVICE_NAME_MAX],
            sample_rate: 48_000,
            channels: 2,
            opus_bitrate: 320_000,
            frame_duration_ms: 20,
            use_vbr: true,
            use_silence_gate: false,
        }
    }
}

impl AudioSettings {
    pub fn set_device_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(AUDIO_DEVICE_NAME_MAX - 1);
        for (i, &b) in bytes[..len].iter().enumerate() {
            self.device_name[i] = b as c_char;
        }
        self.device_name[len] = 0;
    }
}

/// One encoded buffer as produced by a capture library callback.
#[repr(C)]
pub struct CaptureResult {
    pub data: *const u8,
    pub size: usize,
    pub frame_id: u16,
}

type CaptureCallback = unsafe extern "C" fn(*const CaptureResult, *mut c_void);

/// Owned copy of an encoded video frame (or stripe) with its frame id.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub frame_id: u16,
}

/// Owned copy of an encoded Opus packet.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Vec<u8>,
}

struct LibHandle(*mut c_void);

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl Drop for LibHandle {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.0);
        }
    }
}

fn dlopen(soname: &str) -> Option<LibHandle> {
    let cname = CString::new(soname).ok()?;
    let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        None
    } else {
        Some(LibHandle(handle))
    }
}

unsafe fn dlsym<T: Copy>(handle: &LibHandle, symbol: &str) -> Option<T> {
    let cname = CString::new(symbol).ok()?;
    let ptr = libc::dlsym(handle.0, cname.as_ptr());
    if ptr.is_null() {
        warn!("Missing symbol {} in capture library", symbol);
        return None;
    }
    Some(std::mem::transmute_copy(&ptr))
}

type ModuleNewFn = unsafe extern "C" fn() -> *mut c_void;
type ModuleFreeFn = unsafe extern "C" fn(*mut c_void);
type ModuleStopFn = unsafe extern "C" fn(*mut c_void);
type VideoStartFn =
    unsafe extern "C" fn(*mut c_void, *const CaptureSettings, CaptureCallback, *mut c_void) -> c_int;
type AudioStartFn =
    unsafe extern "C" fn(*mut c_void, *const AudioSettings, CaptureCallback, *mut c_void) -> c_int;

/// Resolved entry points of the video capture library.
pub struct VideoCaptureLib {
    _handle: LibHandle,
    new_fn: ModuleNewFn,
    start_fn: VideoStartFn,
    stop_fn: ModuleStopFn,
    free_fn: ModuleFreeFn,
}

impl VideoCaptureLib {
    pub fn load() -> Option<Arc<Self>> {
        let handle = match dlopen("libpixelflux.so") {
            Some(h) => h,
            None => {
                warn!("libpixelflux.so not found. Striped encoding modes unavailable.");
                return None;
            }
        };
        unsafe {
            let lib = VideoCaptureLib {
                new_fn: dlsym(&handle, "pixelflux_capture_new")?,
                start_fn: dlsym(&handle, "pixelflux_capture_start")?,
                stop_fn: dlsym(&handle, "pixelflux_capture_stop")?,
                free_fn: dlsym(&handle, "pixelflux_capture_free")?,
                _handle: handle,
            };
            info!("pixelflux library loaded. Striped encoding modes available.");
            Some(Arc::new(lib))
        }
    }
}

/// Resolved entry points of the audio capture library.
pub struct AudioCaptureLib {
    _handle: LibHandle,
    new_fn: ModuleNewFn,
    start_fn: AudioStartFn,
    stop_fn: ModuleStopFn,
    free_fn: ModuleFreeFn,
}

impl AudioCaptureLib {
    pub fn load() -> Option<Arc<Self>> {
        let handle = match dlopen("libpcmflux.so") {
            Some(h) => h,
            None => {
                warn!("libpcmflux.so not found. Audio capture unavailable.");
                return None;
            }
        };
        unsafe {
            let lib = AudioCaptureLib {
                new_fn: dlsym(&handle, "pcmflux_capture_new")?,
                start_fn: dlsym(&handle, "pcmflux_capture_start")?,
                stop_fn: dlsym(&handle, "pcmflux_capture_stop")?,
                free_fn: dlsym(&handle, "pcmflux_capture_free")?,
                _handle: handle,
            };
            info!("pcmflux library loaded. Audio capture available.");
            Some(Arc::new(lib))
        }
    }
}

struct VideoSink {
    sender: mpsc::UnboundedSender<EncodedFrame>,
}

unsafe extern "C" fn video_trampoline(result: *const CaptureResult, user_data: *mut c_void) {
    if result.is_null() || user_data.is_null() {
        return;
    }
    let sink = &*(user_data as *const VideoSink);
    let result = &*result;
    if result.data.is_null() || result.size == 0 {
        return;
    }
    let data = std::slice::from_raw_parts(result.data, result.size).to_vec();
    let _ = sink.sender.send(EncodedFrame {
        data,
        frame_id: result.frame_id,
    });
}

struct AudioSink {
    sender: mpsc::UnboundedSender<AudioPacket>,
}

unsafe extern "C" fn audio_trampoline(result: *const CaptureResult, user_data: *mut c_void) {
    if result.is_null() || user_data.is_null() {
        return;
    }
    let sink = &*(user_data as *const AudioSink);
    let result = &*result;
    if result.data.is_null() || result.size == 0 {
        return;
    }
    let data = std::slice::from_raw_parts(result.data, result.size).to_vec();
    let _ = sink.sender.send(AudioPacket { data });
}

/// A running screen-capture module instance.
pub struct ScreenCapture {
    lib: Arc<VideoCaptureLib>,
    module: *mut c_void,
    sink: *mut VideoSink,
}

unsafe impl Send for ScreenCapture {}

impl ScreenCapture {
    /// Start the native capture. The returned receiver yields owned frame
    /// copies; the callback never blocks on it.
    pub fn start(
        lib: Arc<VideoCaptureLib>,
        settings: &CaptureSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EncodedFrame>), String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Box::into_raw(Box::new(VideoSink { sender }));
        unsafe {
            let module = (lib.new_fn)();
            if module.is_null() {
                drop(Box::from_raw(sink));
                return Err("capture module allocation failed".to_string());
            }
            let rc = (lib.start_fn)(module, settings, video_trampoline, sink as *mut c_void);
            if rc != 0 {
                (lib.free_fn)(module);
                drop(Box::from_raw(sink));
                return Err(format!("start_capture failed with code {}", rc));
            }
            Ok((Self { lib, module, sink }, receiver))
        }
    }

    /// Stop the native capture. Blocks until the library's capture thread
    /// has quiesced; callers wrap this in spawn_blocking.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        unsafe {
            (self.lib.stop_fn)(self.module);
            (self.lib.free_fn)(self.module);
            // The library guarantees no callback runs past stop's return.
            drop(Box::from_raw(self.sink));
        }
    }
}

/// A running audio-capture module instance.
pub struct AudioCapture {
    lib: Arc<AudioCaptureLib>,
    module: *mut c_void,
    sink: *mut AudioSink,
}

unsafe impl Send for AudioCapture {}

impl AudioCapture {
    pub fn start(
        lib: Arc<AudioCaptureLib>,
        settings: &AudioSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AudioPacket>), String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Box::into_raw(Box::new(AudioSink { sender }));
        unsafe {
            let module = (lib.new_fn)();
            if module.is_null() {
                drop(Box::from_raw(sink));
                return Err("audio capture module allocation failed".to_string());
            }
            let rc = (lib.start_fn)(module, settings, audio_trampoline, sink as *mut c_void);
            if rc != 0 {
                (lib.free_fn)(module);
                drop(Box::from_raw(sink));
                return Err(format!("audio start_capture failed with code {}", rc));
            }
            Ok((Self { lib, module, sink }, receiver))
        }
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        unsafe {
            (self.lib.stop_fn)(self.module);
            (self.lib.free_fn)(self.module);
            drop(Box::from_raw(self.sink));
        }
    }
}

/// Capture libraries probed once at startup.
pub struct CaptureLibs {
    pub video: Option<Arc<VideoCaptureLib>>,
    pub audio: Option<Arc<AudioCaptureLib>>,
}

impl CaptureLibs {
    pub fn probe() -> Self {
        Self {
            video: VideoCaptureLib::load(),
            audio: AudioCaptureLib::load(),
        }
    }

    pub fn video_available(&self) -> bool {
        self.video.is_some()
    }

    pub fn audio_available(&self) -> bool {
        self.audio.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_path_is_nul_terminated_and_capped() {
        let mut settings = CaptureSettings::default();
        settings.set_watermark_path("/tmp/mark.png");
        let len = settings
            .watermark_path
            .iter()
            .position(|&c| c == 0)
            .expect("terminator");
        assert_eq!(len, "/tmp/mark.png".len());

        let long = "x".repeat(1000);
        settings.set_watermark_path(&long);
        assert_eq!(settings.watermark_path[255], 0);
    }

    #[test]
    fn audio_device_name_roundtrip() {
        let mut settings = AudioSettings::default();
        settings.set_device_name("output.monitor");
        let stored: Vec<u8> = settings
            .device_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        assert_eq!(stored, b"output.monitor");
    }
}
