//! CLI interface for parley

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Real-time spoken dialogue assistant server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default when no command is given)
    Serve {
        /// Override server.ip from the config
        #[arg(long)]
        ip: Option<String>,
        /// Override server.port from the config
        #[arg(long)]
        port: Option<u16>,
    },
    /// Parse and validate the configuration, then exit
    CheckConfig,
    /// Opus-encode a WAV file and report the frame count (codec smoke test)
    EncodeCheck {
        /// WAV file to encode
        file: PathBuf,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        None | Some(Commands::Serve { ip: None, port: None }) => {
            crate::server::start(config).await
        }
        Some(Commands::Serve { ip, port }) => {
            if let Some(ip) = ip {
                config.server.ip = ip;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::start(config).await
        }
        Some(Commands::CheckConfig) => {
            println!("config ok: {}", cli.config.display());
            println!(
                "  server    {}:{}",
                config.server.ip, config.server.port
            );
            println!(
                "  modules   asr={} llm={} tts={} vad={}",
                config.selected_module.asr,
                config.selected_module.llm,
                config.selected_module.tts,
                config.selected_module.vad
            );
            println!(
                "  webrtc    enabled={} port={}",
                config.webrtc.enabled, config.webrtc.port
            );
            Ok(())
        }
        Some(Commands::EncodeCheck { file }) => {
            let (frames, duration) = crate::audio::codec::encode_wav_file(&file)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "{}: {} frames of 20 ms ({duration:.2}s)",
                file.display(),
                frames.len()
            );
            Ok(())
        }
    }
}
