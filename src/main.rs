use anyhow::Result;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

use podcast_forge::core::config::Config;
use podcast_forge::core::io::{NativeStorage, Storage};
use podcast_forge::core::state::Artifact;
use podcast_forge::services::capability::{self, CapabilityRegistry};
use podcast_forge::services::engine::PipelineEngine;
use podcast_forge::services::llm::create_llm;
use podcast_forge::services::tts::create_tts_provider;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load and validate config
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and episode settings.");
            return Err(e);
        }
    };
    config.validate()?;
    config.ensure_directories()?;

    // 2. Provider capabilities
    let registry = match &config.capabilities_file {
        Some(path) => CapabilityRegistry::load(Path::new(path))?,
        None => CapabilityRegistry::builtin(),
    };
    let registry = capability::install(registry);
    let cap = registry.capabilities_for(&config.audio.tts.provider)?;
    if !cap.supports_language(&config.episode.language) {
        warn!(
            "TTS provider '{}' does not list language '{}'",
            cap.provider_id, config.episode.language
        );
    }

    // 3. Clients
    let llm = create_llm(&config.llm)?;
    let tts = if config.audio.enabled {
        Some(create_tts_provider(&config.audio.tts)?)
    } else {
        None
    };
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    // 4. Run, Ctrl-C cancels in-flight work
    let engine = PipelineEngine::new(config, llm, tts, registry, storage);
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let state = engine.run_episode().await?;
    match state.artifact {
        Some(Artifact::Audio(episode)) => {
            println!("Episode audio: {}", episode.path);
            println!("Manifest: {}", episode.manifest_path);
        }
        Some(Artifact::TextOnly { transcript_path }) => {
            println!("Transcript: {}", transcript_path);
        }
        None => println!("Run finished without an artifact"),
    }
    Ok(())
}
