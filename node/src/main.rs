mod capture;
mod host;
mod system;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
