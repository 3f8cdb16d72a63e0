// Local demo: two participants share an in-memory directory and call each other over WebRTC.
// Usage: meshcall [config.json]

use anyhow::Context;
use meshcall_lib::{
    logger, CallConfig, CallEvent, CallState, MemoryDirectory, Participant, PeerId,
    WebRtcTransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            CallConfig::from_json(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => CallConfig::default(),
    };

    let directory = Arc::new(MemoryDirectory::new());
    let transports = Arc::new(WebRtcTransportFactory::new(&config));

    let callee = Participant::spawn(
        PeerId::generate(),
        config.clone(),
        directory.clone(),
        transports.clone(),
    )
    .await;
    let caller = Participant::spawn(PeerId::local(), config.clone(), directory, transports).await;
    info!("caller {} / callee {}", caller.id(), callee.id());

    let mut events = caller.subscribe();
    caller.start_call().await?;

    let budget = config.selection_deadline + config.answer_timeout.unwrap_or(Duration::from_secs(30));
    let outcome = timeout(budget, async {
        while let Ok(event) = events.recv().await {
            println!("{event:?}");
            match event {
                CallEvent::StateChanged { to, .. } if to == CallState::Connected => return Ok(()),
                CallEvent::Failed { reason, .. } => return Err(anyhow::anyhow!(reason)),
                _ => {}
            }
        }
        Err(anyhow::anyhow!("event stream closed"))
    })
    .await
    .context("call did not settle in time")?;

    match outcome {
        Ok(()) => println!("connected: {} <-> {}", caller.id(), callee.id()),
        Err(e) => println!("call failed: {e}"),
    }

    caller.shutdown().await?;
    callee.shutdown().await?;
    Ok(())
}
