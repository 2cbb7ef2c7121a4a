//! HTTP server command — `renderforge serve`.

use anyhow::Result;
use renderforge::config::Settings;

pub async fn cmd_serve(settings: Settings) -> Result<()> {
    renderforge::render::server::start_server(settings).await
}
