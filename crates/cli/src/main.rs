#![deny(rust_2018_idioms)]

use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
	redis_launcher_cli::run().await
}
