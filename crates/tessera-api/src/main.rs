use tessera_core::Config;

// mimalloc keeps fragmentation low for the long-lived chunk buffers and image work.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    // Initialize the application (metadata store, services, routes)
    let (state, router) = tessera_api::setup::initialize_app(config.clone()).await?;

    tessera_api::setup::server::start_server(&config, router, state).await?;

    Ok(())
}
