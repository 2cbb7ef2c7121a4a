//! renderforge: generate, validate, sandbox-render and repair Manim scenes.
//!
//! The binary in `main.rs` is a thin clap front end; everything it runs
//! lives here so tests and other binaries can reuse it.

pub mod config;
pub mod errors;
pub mod logging;
pub mod render;
