// Surface provider - the window side of the presentation contract
//
// The backend never owns a window. Whatever does must hand over raw native
// handles, the instance extensions it needs, and its drawable size.

use super::error::{GpuResult, VkResultExt};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};

pub trait SurfaceProvider {
    /// Native display connection the surface is created on.
    fn display_handle(&self) -> GpuResult<RawDisplayHandle>;

    /// Native drawable the surface presents into.
    fn window_handle(&self) -> GpuResult<RawWindowHandle>;

    /// Instance extensions required to create a surface for this display.
    fn required_extensions(&self) -> GpuResult<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.display_handle()?)
            .during("enumerate the surface extensions")?;
        Ok(names
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect())
    }

    /// Current drawable size in pixels.
    fn drawable_size(&self) -> (u32, u32);

    fn is_open(&self) -> bool;
}
