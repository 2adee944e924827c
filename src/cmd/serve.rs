//! Job control HTTP API: `forgeline serve`.

use anyhow::Result;
use std::path::Path;

use forgeline::config::{ForgelineToml, ProjectPaths};
use forgeline::jobs::server::{ServerConfig, start_server};

pub async fn cmd_serve(project_dir: &Path, port: u16, dev: bool) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let config = ForgelineToml::resolve(&paths)?;

    start_server(ServerConfig {
        port,
        jobs_dir: paths.jobs_dir(),
        heartbeat: config.heartbeat_interval(),
        dev_mode: dev,
    })
    .await
}
