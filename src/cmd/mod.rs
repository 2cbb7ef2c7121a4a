//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `validate` | `Validate`       |
//! | `render`   | `Render`         |
//! | `config`   | `Config`         |

pub mod config;
pub mod render;
pub mod serve;
pub mod validate;

pub use config::cmd_config;
pub use render::cmd_render;
pub use serve::cmd_serve;
pub use validate::cmd_validate;
