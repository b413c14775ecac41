use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub fn run(config_path: &Path, port: Option<u16>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let pipeline = Arc::new(super::open_pipeline_on(config_path, rt.handle().clone())?);
    let port = port.unwrap_or(pipeline.config.server.port);

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let actual_port = listener.local_addr()?.port();
        println!("tally server → http://localhost:{actual_port}  (PID {})", std::process::id());
        tally_server::serve_on(pipeline, listener).await
    })
}
