//! Still Water - a Vulkan triangle-mesh renderer
//!
//! The `backend` module owns every GPU object: device context, shaders,
//! vertex buffers and the render pipeline with its one-frame-in-flight
//! scheduler. `config` loads the runtime settings from `config.toml`.

pub mod backend;
pub mod config;
