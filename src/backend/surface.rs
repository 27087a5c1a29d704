// Surface creation from raw window handles
//
// The instance must be created with the extensions returned by
// `required_extensions` for the same display before `create_surface` is called.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

/// Instance extensions needed to present on this display
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let platform = match display {
        #[cfg(target_os = "windows")]
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => anyhow::bail!("Unsupported display handle: {:?}", other),
    };

    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

/// Create a presentation surface for the window
///
/// # Safety
/// The handles must stay valid for the lifetime of the returned surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (display, window) {
        #[cfg(target_os = "windows")]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = khr::Win32Surface::new(entry, instance);
            loader
                .create_win32_surface(&create_info, None)
                .context("Failed to create Win32 surface")
        }

        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no display")?
                .as_ptr();
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(window.window);
            let loader = khr::XlibSurface::new(entry, instance);
            loader
                .create_xlib_surface(&create_info, None)
                .context("Failed to create Xlib surface")
        }

        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .context("Xcb display handle has no connection")?
                .as_ptr();
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection as *mut _)
                .window(window.window.get());
            let loader = khr::XcbSurface::new(entry, instance);
            loader
                .create_xcb_surface(&create_info, None)
                .context("Failed to create Xcb surface")
        }

        #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut _)
                .surface(window.surface.as_ptr() as *mut _);
            let loader = khr::WaylandSurface::new(entry, instance);
            loader
                .create_wayland_surface(&create_info, None)
                .context("Failed to create Wayland surface")
        }

        _ => anyhow::bail!("Unsupported window handle type"),
    }
}
