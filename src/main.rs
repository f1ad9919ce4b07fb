#[tokio::main]
async fn main() -> anyhow::Result<()> {
    doc_sequencer::server::run().await
}
