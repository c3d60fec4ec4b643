// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod pander;
mod spawner;

pub use initialization::BindError;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Bind the listener and build the shared services.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Start the main connection acceptance loop. This function will
    //    run until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
