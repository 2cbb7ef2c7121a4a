//! Render pipeline — validate, render and repair generated Manim scenes.
//!
//! ## Overview
//!
//! A client submits scene code (or asks for code to be generated from a
//! topic). The code is statically validated, rendered inside an isolated
//! sandbox, and on failure handed back to the LLM for repair until it
//! renders or the retry budget runs out. Job state is persisted at every
//! transition so clients can poll it.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘  polling │         │                                        │
//!                       │         │ RenderPipeline::submit()               │
//!                       │         v                                        │
//!                       │  worker.rs  (Dispatcher, WorkerPool)             │
//!                       │         │                                        │
//!                       │         │ RenderPipeline::process()              │
//!                       │         v                                        │
//!                       │  pipeline.rs  (attempt loop, retry budget)       │
//!                       │    ├─ validator/  (CodeValidator)                │
//!                       │    ├─ sandbox.rs  (SceneRenderer trait)          │
//!                       │    └─ llm.rs      (CodeAssistant / CodeRepair)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                              |
//! |------------|-------------------------------------------------------------|
//! | `models`   | Shared types: `Job`, `JobStatus`, `JobUpdate`, `Quality`    |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `jobs`     | `JobStore` trait, SQLite and in-memory implementations      |
//! | `cache`    | `ResultCache` over a `KeyValueStore`, request fingerprints  |
//! | `storage`  | `ArtifactStore` — one `<job_id>.mp4` per finished job       |
//! | `prompt`   | Generation request presets and prompt builders              |
//! | `services` | Wiring from `Settings`, with in-memory fallback stores      |
//!
//! ## Typical Request Flow (`POST /render`)
//!
//! 1. `api::render()` validates the code up front when retries are
//!    disabled, then calls `RenderPipeline::submit()`.
//! 2. `submit()` fingerprints `(quality, code)` and consults the render
//!    cache: a finished hit is cloned into a new `done` job, an in-flight hit
//!    is returned as-is, anything else creates a fresh job.
//! 3. Fresh jobs are handed to the `Dispatcher`, which either spawns a
//!    background task or pushes onto the worker queue.
//! 4. `RenderPipeline::process()` runs the attempt loop and records every
//!    transition in the `JobStore`; the finished video is moved into the
//!    `ArtifactStore`.

pub mod api;
pub mod cache;
pub mod db;
pub mod jobs;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod sandbox;
pub mod server;
pub mod services;
pub mod storage;
pub mod validator;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures {
    /// Smallest scene that satisfies every validator rule.
    pub const VALID_SCENE: &str = "\
from manim import *


class GeneratedScene(Scene):
    def construct(self):
        title = Text(\"Pythagorean theorem\")
        square = Square(side_length=2)
        self.play(Write(title))
        self.play(title.animate.to_edge(UP), Create(square))
        self.wait(1)
";
}
