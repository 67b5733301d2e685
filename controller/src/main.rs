mod cache;
mod host;
mod room;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
