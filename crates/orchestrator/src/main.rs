use waypoint_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    waypoint_observability::init_with(settings.log_format);

    if let Err(e) = waypoint_orchestrator::run(settings, waypoint_orchestrator::shutdown_signal()).await {
        tracing::error!(error = %format!("{e:#}"), "orchestrator failed");
        return Err(e);
    }
    Ok(())
}
