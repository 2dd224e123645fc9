use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::plugin::Options;

#[derive(Deserialize)]
pub struct SessionConfig {
    pub plugin: PluginSection,
}

#[derive(Deserialize)]
pub struct PluginSection {
    /// Path to the plugin binary, absolute or relative to the session file.
    pub path: String,
    /// Descriptor label; the first descriptor is used when omitted.
    pub label: Option<String>,
    #[serde(default)]
    pub control_channel: u8,
    /// Program index to select after load.
    pub program: Option<i32>,
    #[serde(default)]
    pub options: OptionFlags,
    /// Initial parameter overrides, by port name.
    #[serde(default)]
    pub params: HashMap<String, f32>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct OptionFlags {
    pub force_stereo: bool,
    pub fixed_buffer: bool,
    pub use_chunks: bool,
}

impl OptionFlags {
    pub fn to_options(&self) -> Options {
        let mut opts = Options::NONE;
        if self.force_stereo {
            opts.insert(Options::FORCE_STEREO);
        }
        if self.fixed_buffer {
            opts.insert(Options::FIXED_BUFFER);
        }
        if self.use_chunks {
            opts.insert(Options::USE_CHUNKS);
        }
        opts
    }
}

pub fn load(path: &str) -> anyhow::Result<SessionConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Resolve the plugin binary path relative to the session file's directory.
pub fn resolve_plugin_path(plugin_path: &str, session_dir: &Path) -> PathBuf {
    let p = Path::new(plugin_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        session_dir.join(p)
    }
}
