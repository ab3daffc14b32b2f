#[tokio::main]
async fn main() -> anyhow::Result<()> {
    recsched::run().await
}
