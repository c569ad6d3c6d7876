#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use doorkeep_adapter::{init_tracing, load_dotenv};
use doorkeep_node::config::ReaderSettings;
use doorkeep_node::reader::{
    HttpCardSubmitter, LineTransceiver, ReaderLoop, READER_SUBMIT_TIMEOUT_MS,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    init_tracing();

    let settings = ReaderSettings::from_env();
    let transceiver = LineTransceiver::open(&settings.device)?;
    let submitter = HttpCardSubmitter::new(settings.intake_url.clone(), READER_SUBMIT_TIMEOUT_MS);
    info!(
        device = %settings.device,
        intake_url = %settings.intake_url,
        "rfid reader ready, present a card"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let reader = ReaderLoop::new(transceiver, submitter, settings.reader);
    let flag = shutdown.clone();
    let mut reader_task = tokio::task::spawn_blocking(move || reader.run(&flag));

    let summary = tokio::select! {
        joined = &mut reader_task => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, stopping reader");
            shutdown.store(true, Ordering::SeqCst);
            reader_task.await?
        }
    };
    info!(submitted = summary.submitted, "rfid reader stopped");
    Ok(())
}
