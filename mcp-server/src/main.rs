use std::io::Result as IoResult;

#[tokio::main]
async fn main() -> IoResult<()> {
    warden_mcp_server::run_main().await
}
