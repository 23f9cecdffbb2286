use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use softphone_control::{Engine, EngineConfig, LoggingHandler};
use tracing::info;

use super::READY_TIMEOUT;

/// Place one call, keep it up for `hold`, hang up and quit.
///
/// Prints the final engine state as JSON.
pub async fn dial_command(config: EngineConfig, number: &str, hold: Duration) -> Result<()> {
    let engine = Engine::spawn(config, vec![Arc::new(LoggingHandler)])?;

    if !engine.wait_ready(READY_TIMEOUT).await {
        engine.quit().await;
        bail!("Softphone did not start within {:?}", READY_TIMEOUT);
    }

    engine.call(number)?;
    tokio::time::sleep(hold).await;

    let phase = engine.current_state().call.phase;
    if phase.in_call() {
        info!("Hanging up ({:?})", phase);
        engine.bye()?;
        tokio::time::sleep(hold).await;
    } else {
        info!("Call to {} already over", number);
    }

    engine.quit().await;
    println!("{}", serde_json::to_string_pretty(&engine.current_state())?);
    Ok(())
}
