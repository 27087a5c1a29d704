// Diagnostic overlay
//
// The renderer opens the overlay render pass on top of the blitted image and
// hands it to an `Overlay`. The built-in one only reports through the window
// title and records no draws.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use crate::stats::FrameStats;

/// What the overlay asks of the renderer after drawing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayResponse {
    /// Recreate the swapchain at the end of this frame
    pub resize_requested: bool,
    /// New vsync setting, applied on that recreation
    pub vsync: Option<bool>,
}

pub trait Overlay {
    /// Record draws into the open overlay render pass
    fn record(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        stats: &FrameStats,
    ) -> Result<OverlayResponse>;
}

/// Shows frame statistics in the window title
pub struct TitleOverlay {
    window: Arc<Window>,
    base_title: String,
    shown: String,
    vsync_toggle_pending: bool,
}

impl TitleOverlay {
    pub fn new(window: Arc<Window>, base_title: &str) -> Self {
        Self {
            window,
            base_title: base_title.to_string(),
            shown: String::new(),
            vsync_toggle_pending: false,
        }
    }

    /// Flip vsync on the next recorded frame
    pub fn toggle_vsync(&mut self) {
        self.vsync_toggle_pending = true;
    }
}

pub fn title_text(base: &str, stats: &FrameStats) -> String {
    format!(
        "{} - {:.0} FPS ({:.2}ms) [{}] vsync {}",
        base,
        stats.fps,
        stats.frame_time_ms,
        stats.device_name,
        if stats.vsync { "on" } else { "off" }
    )
}

impl Overlay for TitleOverlay {
    fn record(
        &mut self,
        _device: &ash::Device,
        _cmd: vk::CommandBuffer,
        stats: &FrameStats,
    ) -> Result<OverlayResponse> {
        let title = title_text(&self.base_title, stats);
        if title != self.shown {
            self.window.set_title(&title);
            self.shown = title;
        }

        if std::mem::take(&mut self.vsync_toggle_pending) {
            let vsync = !stats.vsync;
            log::info!("VSync {}", if vsync { "enabled" } else { "disabled" });
            return Ok(OverlayResponse {
                resize_requested: true,
                vsync: Some(vsync),
            });
        }

        Ok(OverlayResponse::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_includes_rates_and_device() {
        let stats = FrameStats {
            fps: 59.6,
            frame_time_ms: 16.777,
            device_name: "Test GPU".to_string(),
            vsync: true,
        };
        assert_eq!(
            title_text("vkrt", &stats),
            "vkrt - 60 FPS (16.78ms) [Test GPU] vsync on"
        );
    }

    #[test]
    fn default_response_requests_nothing() {
        let response = OverlayResponse::default();
        assert!(!response.resize_requested);
        assert_eq!(response.vsync, None);
    }
}
