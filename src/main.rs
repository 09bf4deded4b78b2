use cnclink::{
    init_logging, Controller, LinesSource, PartialPosition, SimConfig, SimController,
};

/// Demo: bring up a virtual controller, home it, run a small job, probe, and
/// print the resulting status snapshot.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    tracing::info!(version = cnclink::VERSION, built = cnclink::BUILD_DATE, "cnclink demo");

    let controller = SimController::new(SimConfig::default());
    controller.init_connection(true).await?;

    tracing::info!("homing all axes");
    controller.home(None).await?;

    tracing::info!("streaming a small square");
    let mut job = LinesSource::new([
        "G21",
        "G90",
        "M3 S8000",
        "G1 X20 F600",
        "G1 Y20",
        "G1 X0",
        "G1 Y0",
        "M5",
    ]);
    controller.send_stream(&mut job).await?;
    controller.wait_sync().await?;

    tracing::info!("probing toward Z-5");
    match controller
        .probe(PartialPosition::xyz(None, None, Some(-5.0)), Some(60.0))
        .await
    {
        Ok(position) => tracing::info!(?position, "probe tripped"),
        Err(err) => tracing::warn!(kind = %err.kind(), "probe did not trip: {}", err),
    }

    let status = controller.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
