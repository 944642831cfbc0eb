#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    thinking_cli::run().await
}
