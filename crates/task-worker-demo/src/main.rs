//! Task worker demo - entry point.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    task_worker_demo::run().await
}
