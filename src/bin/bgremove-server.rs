//! Background removal inference server
//!
//! HTTP front end for the bgremove-serve model registry and dispatch service.

use bgremove_serve::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
