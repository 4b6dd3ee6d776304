//! X11 display tools
//!
//! Pointer injection goes through XTest on our own connection; display
//! resizing and DPI changes shell out to the standard tools (xrandr, cvt,
//! gtf, xrdb, xfconf-query, gsettings) the way the desktop expects.

use log::{debug, error, info, warn};
use std::path::Path;
use tokio::process::Command;
use x11rb::connection::Connection;
use x11rb::protocol::xtest::ConnectionExt as XtestExt;
use x11rb::rust_connection::RustConnection;

const MOTION_NOTIFY: u8 = 6;
const BUTTON_PRESS: u8 = 4;
const BUTTON_RELEASE: u8 = 5;

const MAX_RESIZE_WIDTH: u32 = 7680;
const MAX_RESIZE_HEIGHT: u32 = 4320;

/// Check PATH for a binary, like shutil.which.
pub fn which(binary: &str) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    path.split(':')
        .any(|dir| !dir.is_empty() && Path::new(dir).join(binary).is_file())
}

/// XTest-based pointer injection on a dedicated connection.
pub struct X11Input {
    conn: RustConnection,
    root: u32,
    width_px: u16,
    height_px: u16,
    width_mm: u16,
    height_mm: u16,
}

impl X11Input {
    pub fn connect() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let (root, width_px, height_px, width_mm, height_mm) = {
            let screen = &conn.setup().roots[screen_num];
            (
                screen.root,
                screen.width_in_pixels,
                screen.height_in_pixels,
                screen.width_in_millimeters,
                screen.height_in_millimeters,
            )
        };
        Ok(Self {
            conn,
            root,
            width_px,
            height_px,
            width_mm,
            height_mm,
        })
    }

    /// Physical DPI reported by the X screen, 96 when unknown.
    pub fn system_dpi(&self) -> f64 {
        if self.width_mm == 0 || self.height_mm == 0 {
            return 96.0;
        }
        let dpi_x = self.width_px as f64 * 25.4 / self.width_mm as f64;
        let dpi_y = self.height_px as f64 * 25.4 / self.height_mm as f64;
        (dpi_x + dpi_y) / 2.0
    }

    pub fn move_pointer_absolute(&self, x: i16, y: i16) {
        if self
            .conn
            .xtest_fake_input(MOTION_NOTIFY, 0, 0, self.root, x, y, 0)
            .is_ok()
        {
            let _ = self.conn.flush();
        }
    }

    pub fn move_pointer_relative(&self, dx: i16, dy: i16) {
        if self
            .conn
            .xtest_fake_input(MOTION_NOTIFY, 1, 0, self.root, dx, dy, 0)
            .is_ok()
        {
            let _ = self.conn.flush();
        }
    }

    pub fn button(&self, button: u8, pressed: bool) {
        let kind = if pressed { BUTTON_PRESS } else { BUTTON_RELEASE };
        if self
            .conn
            .xtest_fake_input(kind, button, 0, self.root, 0, 0, 0)
            .is_ok()
        {
            let _ = self.conn.flush();
        }
    }

    /// X scroll semantics: press + release of buttons 4-7.
    pub fn scroll(&self, button: u8, times: u32) {
        for _ in 0..times.max(1) {
            self.button(button, true);
            self.button(button, false);
        }
    }
}

/// Fit a requested resolution into the global maximum, preserving aspect
/// ratio and even dimensions.
pub fn fit_res(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let aspect = w as f64 / h as f64;
    let mut w = w;
    let mut h = h;
    if w > max_w {
        w = max_w;
        h = (w as f64 / aspect) as u32;
    }
    if h > max_h {
        h = max_h;
        w = (h as f64 * aspect) as u32;
    }
    (w - w % 2, h - h % 2)
}

/// Parsed `xrandr` query output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScreenInfo {
    pub screen_name: Option<String>,
    pub current_resolution: Option<String>,
    pub resolutions: Vec<String>,
}

pub fn parse_xrandr_output(output: &str) -> ScreenInfo {
    let mut info = ScreenInfo::default();
    let mut in_connected_screen = false;
    for line in output.lines() {
        if let Some(rest) = line.split_once(' ').filter(|(_, r)| r.starts_with("connected")) {
            if info.screen_name.is_none() {
                info.screen_name = Some(rest.0.to_string());
            }
            in_connected_screen = info.screen_name.as_deref() == Some(rest.0);
            continue;
        }
        if line.contains("current") {
            if let Some(idx) = line.find("current ") {
                let tail = &line[idx + "current ".len()..];
                let res: String = tail
                    .chars()
                    .take_while(|&c| c != ',')
                    .filter(|c| !c.is_whitespace())
                    .collect();
                if res.contains('x') {
                    info.current_resolution = Some(res);
                }
            }
        }
        if in_connected_screen {
            let trimmed = line.trim_start();
            if let Some(res) = trimmed.split_whitespace().next() {
                let valid = res.split_once('x').is_some_and(|(w, h)| {
                    !w.is_empty()
                        && !h.is_empty()
                        && w.bytes().all(|b| b.is_ascii_digit())
                        && h.bytes().all(|b| b.is_ascii_digit())
                });
                if valid && !info.resolutions.contains(&res.to_string()) {
                    info.resolutions.push(res.to_string());
                }
            }
        }
    }
    info.resolutions.sort();
    info
}

async fn query_screen_info() -> ScreenInfo {
    let output = match Command::new("xrandr").output().await {
        Ok(output) => output,
        Err(err) => {
            error!("xrandr command failed: {}", err);
            return ScreenInfo::default();
        }
    };
    parse_xrandr_output(&String::from_utf8_lossy(&output.stdout))
}

/// Generate an xrandr modeline via cvt, falling back to gtf.
async fn generate_modeline(res_str: &str) -> Result<String, String> {
    let (w, h) = res_str
        .split_once('x')
        .ok_or_else(|| format!("invalid resolution: {}", res_str))?;
    for tool in ["cvt", "gtf"] {
        let output = match Command::new(tool).args([w, h, "60"]).output().await {
            Ok(output) if output.status.success() => output,
            Ok(_) | Err(_) => {
                debug!("{} failed for {}, trying next tool", tool, res_str);
                continue;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(idx) = line.find("Modeline") {
                let rest = &line[idx + "Modeline".len()..];
                // Skip the quoted mode name; keep the timing parameters.
                if let Some(close) = rest.rfind('"') {
                    return Ok(rest[close + 1..].trim().to_string());
                }
            }
        }
    }
    Err(format!("could not generate modeline for {}", res_str))
}

async fn run_tool(cmd: &str, args: &[&str]) -> bool {
    match Command::new(cmd).args(args).output().await {
        Ok(output) => {
            if !output.status.success() {
                warn!(
                    "{} {:?} failed: {}",
                    cmd,
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            output.status.success()
        }
        Err(err) => {
            warn!("failed to run {}: {}", cmd, err);
            false
        }
    }
}

/// Set the X display mode, adding the mode first when xrandr does not know
/// it yet. Returns false on any tool failure.
pub async fn resize_display(res_str: &str) -> bool {
    let info = query_screen_info().await;
    let Some(screen_name) = info.screen_name else {
        error!("Cannot resize display, no connected screen identified");
        return false;
    };

    if !info.resolutions.iter().any(|r| r == res_str) {
        info!(
            "Mode {} not known to xrandr; adding it for screen '{}'",
            res_str, screen_name
        );
        let modeline = match generate_modeline(res_str).await {
            Ok(m) => m,
            Err(err) => {
                error!("Failed to generate modeline for {}: {}", res_str, err);
                return false;
            }
        };
        let mut newmode_args = vec!["--newmode", res_str];
        let params: Vec<&str> = modeline.split_whitespace().collect();
        newmode_args.extend(params);
        if !run_tool("xrandr", &newmode_args).await {
            return false;
        }
        if !run_tool("xrandr", &["--addmode", &screen_name, res_str]).await {
            // Clean up the orphaned mode.
            run_tool("xrandr", &["--delmode", &screen_name, res_str]).await;
            run_tool("xrandr", &["--rmmode", res_str]).await;
            return false;
        }
    }

    if !run_tool("xrandr", &["--output", &screen_name, "--mode", res_str]).await {
        error!("Failed to set mode '{}' on screen '{}'", res_str, screen_name);
        return false;
    }
    info!("Applied xrandr mode '{}'", res_str);
    true
}

/// Cap the requested resolution at 7680x4320 with even dimensions.
pub fn clamp_resize_request(w: u32, h: u32) -> (u32, u32) {
    fit_res(w, h, MAX_RESIZE_WIDTH, MAX_RESIZE_HEIGHT)
}

async fn apply_xrdb(dpi: u32) -> bool {
    if !which("xrdb") {
        debug!("xrdb not found; skipping Xresources DPI");
        return false;
    }
    let Some(home) = std::env::var_os("HOME") else {
        return false;
    };
    let home = std::path::PathBuf::from(home);
    let xresources = home.join(".Xresources");
    if let Err(err) = std::fs::write(&xresources, format!("Xft.dpi:   {}\n", dpi)) {
        error!("Failed to write {:?}: {}", xresources, err);
        return false;
    }
    let loaded = run_tool("xrdb", &[&xresources.to_string_lossy()]).await;

    // xsettingsd picks up Xft/DPI in 1024ths.
    let xsettingsd = home.join(".xsettingsd");
    let content = format!(
        "Xft/Antialias 1\nXft/Hinting 1\nXft/HintStyle \"hintfull\"\nXft/RGBA \"rgb\"\nXft/DPI {}\n",
        dpi * 1024
    );
    if std::fs::write(&xsettingsd, content).is_ok() && which("pgrep") && which("kill") {
        if let Ok(output) = Command::new("pgrep").arg("xsettingsd").output().await {
            if output.status.success() {
                if let Some(pid) = String::from_utf8_lossy(&output.stdout).lines().next() {
                    run_tool("kill", &["-1", pid.trim()]).await;
                }
            }
        }
    }
    loaded
}

async fn apply_xfconf(dpi: u32) -> bool {
    if !which("xfconf-query") {
        debug!("xfconf-query not found; skipping XFCE DPI");
        return false;
    }
    let dpi_str = dpi.to_string();
    if !run_tool(
        "xfconf-query",
        &[
            "-c", "xsettings", "-p", "/Xft/DPI", "-s", &dpi_str, "--create", "-t", "int",
        ],
    )
    .await
    {
        return false;
    }
    let cursor = ((dpi as f64 / 96.0 * 32.0).round() as i64).to_string();
    run_tool(
        "xfconf-query",
        &[
            "-c",
            "xsettings",
            "-p",
            "/Gtk/CursorThemeSize",
            "-s",
            &cursor,
            "--create",
            "-t",
            "int",
        ],
    )
    .await
}

async fn apply_mate_gsettings(dpi: u32) -> bool {
    if !which("gsettings") {
        return false;
    }
    // Integer scales become the window-scaling-factor; fractional scales
    // stay at 1 and rely on the font DPI.
    let scale = dpi as f64 / 96.0;
    let window_scale = if scale.fract() == 0.0 {
        (scale as i64).max(1)
    } else {
        1
    };
    let a = run_tool(
        "gsettings",
        &[
            "set",
            "org.mate.interface",
            "window-scaling-factor",
            &window_scale.to_string(),
        ],
    )
    .await;
    let b = run_tool(
        "gsettings",
        &["set", "org.mate.font-rendering", "dpi", &dpi.to_string()],
    )
    .await;
    a || b
}

/// Apply the DPI through the desktop environment's own mechanism.
/// Detection order: KDE, XFCE, MATE, i3, Openbox, then a generic xrdb
/// fallback.
pub async fn set_dpi(dpi: u32) -> bool {
    if dpi == 0 {
        error!("Invalid DPI value: {}", dpi);
        return false;
    }
    let ok = if which("startplasma-x11") {
        info!("KDE detected; applying xrdb for DPI {}", dpi);
        apply_xrdb(dpi).await
    } else if which("xfce4-session") {
        // Only xfconf-query here, to avoid double scaling.
        info!("XFCE detected; applying xfconf-query for DPI {}", dpi);
        apply_xfconf(dpi).await
    } else if which("mate-session") {
        info!("MATE detected; applying gsettings and xrdb for DPI {}", dpi);
        let gsettings = apply_mate_gsettings(dpi).await;
        let xrdb = apply_xrdb(dpi).await;
        gsettings || xrdb
    } else if which("i3") {
        info!("i3 detected; applying xrdb for DPI {}", dpi);
        apply_xrdb(dpi).await
    } else if which("openbox-session") || which("openbox") {
        info!("Openbox detected; applying xrdb for DPI {}", dpi);
        apply_xrdb(dpi).await
    } else {
        info!("No known DE session found; generic xrdb fallback for DPI {}", dpi);
        apply_xrdb(dpi).await
    };
    if !ok {
        warn!("No DPI setting method succeeded for {}", dpi);
    }
    ok
}

pub async fn set_cursor_size(size: i64) -> bool {
    if size <= 0 {
        error!("Invalid cursor size: {}", size);
        return false;
    }
    let size_str = size.to_string();
    if which("xfconf-query")
        && run_tool(
            "xfconf-query",
            &[
                "-c",
                "xsettings",
                "-p",
                "/Gtk/CursorThemeSize",
                "-s",
                &size_str,
                "--create",
                "-t",
                "int",
            ],
        )
        .await
    {
        return true;
    }
    if which("gsettings")
        && run_tool(
            "gsettings",
            &[
                "set",
                "org.gnome.desktop.interface",
                "cursor-size",
                &size_str,
            ],
        )
        .await
    {
        info!("Set GNOME cursor-size to {}", size);
        return true;
    }
    warn!("No supported tool found/worked to set cursor size");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_res_preserves_aspect_and_evenness() {
        assert_eq!(fit_res(1920, 1080, 7680, 4320), (1920, 1080));
        let (w, h) = fit_res(10000, 5000, 7680, 4320);
        assert!(w <= 7680 && h <= 4320);
        assert_eq!(w % 2, 0);
        assert_eq!(h % 2, 0);
        // Aspect stays close to 2:1
        let aspect = w as f64 / h as f64;
        assert!((aspect - 2.0).abs() < 0.01);
    }

    #[test]
    fn parse_xrandr_finds_screen_and_modes() {
        let output = "\
Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 16384 x 16384
DP-1 connected primary 1920x1080+0+0 (normal left inverted) 509mm x 286mm
   1920x1080     60.00*+  59.94
   1280x720      60.00    59.94
   640x480       60.00
HDMI-1 disconnected (normal left inverted)
";
        let info = parse_xrandr_output(output);
        assert_eq!(info.screen_name.as_deref(), Some("DP-1"));
        assert_eq!(info.current_resolution.as_deref(), Some("1920x1080"));
        assert!(info.resolutions.contains(&"1280x720".to_string()));
        assert!(info.resolutions.contains(&"640x480".to_string()));
    }

    #[test]
    fn clamp_resize_caps_at_8k() {
        assert_eq!(clamp_resize_request(1920, 1080), (1920, 1080));
        let (w, h) = clamp_resize_request(9000, 9000);
        assert!(w <= 7680 && h <= 4320);
    }
}
