//! video-dl CLI - download videos with progress bars.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use env_logger::Env;

#[tokio::main]
async fn main() -> video_dl::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    video_dl::cli::run().await
}
