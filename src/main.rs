use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    aistudio_proxy::init_tracing();

    // `worker` is the subcommand the bridge launches; everything else runs
    // the server.
    if std::env::args().nth(1).as_deref() == Some("worker") {
        return aistudio_proxy::agent::run_from_env().await;
    }

    aistudio_proxy::run().await
}
