use bookingprocessor_infra::config::ConsumerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bookingprocessor_observability::init();

    let config = ConsumerConfig::from_env()?;
    bookingprocessor::app::run(config).await?;
    Ok(())
}
