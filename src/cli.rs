use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rivet", about = "Minimal CLI DSSI/LADSPA instrument host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Describe a plugin (ports, parameters, programs, capabilities)
    Describe {
        /// Path to the plugin binary (.so)
        plugin: String,

        /// Descriptor label (default: first descriptor in the binary)
        #[arg(long)]
        label: Option<String>,
    },
    /// Load a session and play via MIDI input
    Play(PlayArgs),
}

#[derive(clap::Args)]
pub struct PlayArgs {
    /// Path to session file (.toml)
    pub session: String,

    /// Audio output device name (default: system default)
    #[arg(long)]
    pub audio_device: Option<String>,

    /// MIDI input device name filter (default: open all)
    #[arg(long)]
    pub midi_device: Option<String>,

    /// Audio buffer size in frames
    #[arg(long, default_value = "512")]
    pub buffer_size: u32,

    /// Sample rate in Hz
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,
}
