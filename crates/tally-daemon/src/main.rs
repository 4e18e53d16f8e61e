use anyhow::Result;

use tally_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("tally-daemon")?;
    tally_daemon::server::run().await
}
