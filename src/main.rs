mod analysis;
mod audio;
mod config;
mod protocol;
mod session;
mod transcript;

use std::sync::{Arc, Mutex};

use analysis::AnalysisClient;
use config::Config;
use session::{SessionEvent, SessionOptions, VoiceSession};
use tokio::signal;
use tokio::sync::mpsc;
use transcript::TranscriptLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::load();
    let mut options = SessionOptions::from_config(&config);

    // Optional image argument: analyze it first so the voice session can
    // discuss the findings instead of starting cold.
    if let Some(path) = std::env::args().nth(1) {
        let path = std::path::PathBuf::from(path);
        if !config.has_credential() {
            anyhow::bail!("no API credential configured (set GEMINI_API_KEY)");
        }
        let image = std::fs::read(&path)
            .map_err(|e| anyhow::anyhow!("cannot read image {}: {e}", path.display()))?;
        println!("Analyzing {}...", path.display());

        let client = AnalysisClient::new(&config);
        let report = client
            .analyze_image(&image, analysis::mime_for_path(&path))
            .await?;
        println!("\n{}", report.summary);
        for insight in &report.key_insights {
            println!("  - {insight}");
        }
        for d in &report.diagnoses {
            println!(
                "  {} ({} confidence, {} severity): {}",
                d.condition, d.confidence, d.severity, d.suggestion
            );
        }
        println!();
        options.analysis = Some(report);
    }

    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(100);
    let transcript = Arc::new(Mutex::new(TranscriptLog::new()));
    let mut session = VoiceSession::new(config, events_tx, transcript.clone());

    if let Err(e) = session.connect(options).await {
        anyhow::bail!("{e}");
    }
    println!("Voice session open. Speak into the microphone; Ctrl+C to end.");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }

            Some(event) = events_rx.recv() => match event {
                SessionEvent::Transcript(entry) => {
                    println!("{}: {}", entry.role, entry.text);
                }
                SessionEvent::Interrupted => {
                    log::debug!("playback interrupted by the far end");
                }
                SessionEvent::TurnComplete => {}
                SessionEvent::StateChanged(state) => {
                    log::info!("session state: {state:?}");
                }
                SessionEvent::TransportError(e) => {
                    eprintln!("Connection failed: {e}. Reconnect to continue.");
                    break;
                }
                SessionEvent::Closed => {
                    println!("Session closed by the server.");
                    break;
                }
            },
        }
    }

    session.disconnect().await;
    Ok(())
}
