// Window capability consumed by the device context and swapchain
//
// Anything that can hand out native window/display handles and report its
// size in pixels can host the renderer.

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A presentable window: native handles plus current pixel dimensions
pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle {
    /// Drawable size in physical pixels as `(width, height)`
    fn pixel_size(&self) -> (u32, u32);
}

impl SurfaceProvider for winit::window::Window {
    fn pixel_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}
