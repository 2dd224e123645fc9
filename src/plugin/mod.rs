pub mod adapter;
pub mod descriptor;
pub mod events;
pub mod instance;
pub mod library;
pub mod model;
mod process;
pub mod programs;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicU32, Ordering};

pub use adapter::{DssiPlugin, HostConfig};
pub use descriptor::{PluginHandle, SynthDescriptor};
pub use events::{CtrlEvent, HostEvent, HostEventKind, HostEventQueue, NativeEventBuffer};
pub use instance::ExclusiveRegistry;
pub use process::ProcessStatus;

/// Host-togglable behaviour flags for a loaded plugin.
///
/// Which flags are honoured depends on the plugin: `Options::available_for`
/// computes the mask a given descriptor supports, and the adapter clears
/// anything outside it at construction time.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Options(u32);

impl Options {
    pub const NONE: Options = Options(0);
    pub const MAP_PROGRAM_CHANGES: Options = Options(1 << 0);
    pub const USE_CHUNKS: Options = Options(1 << 1);
    pub const FORCE_STEREO: Options = Options(1 << 2);
    pub const FIXED_BUFFER: Options = Options(1 << 3);
    pub const SEND_CONTROL_CHANGES: Options = Options(1 << 4);
    pub const SEND_CHANNEL_PRESSURE: Options = Options(1 << 5);
    pub const SEND_NOTE_AFTERTOUCH: Options = Options(1 << 6);
    pub const SEND_PITCHBEND: Options = Options(1 << 7);
    pub const SEND_ALL_SOUND_OFF: Options = Options(1 << 8);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Options {
        Options(bits)
    }

    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Options) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Options) {
        self.0 &= !other.0;
    }

    pub fn intersect(self, other: Options) -> Options {
        Options(self.0 & other.0)
    }

    /// The option mask a given descriptor can honour.
    ///
    /// Program mapping and fixed-size buffering are always selectable.
    /// Stereo forcing needs a mono-ish plugin (at most one port per side,
    /// at least one audio port). The send-* flags only make sense for
    /// plugins with a synth entry point; chunks need both custom-data
    /// accessors.
    pub fn available_for(
        desc: &dyn descriptor::SynthDescriptor,
        audio_ins: usize,
        audio_outs: usize,
    ) -> Options {
        let mut avail = Options::MAP_PROGRAM_CHANGES;
        avail.insert(Options::FIXED_BUFFER);

        if audio_ins <= 1 && audio_outs <= 1 && (audio_ins != 0 || audio_outs != 0) {
            avail.insert(Options::FORCE_STEREO);
        }

        if desc.supports_chunks() {
            avail.insert(Options::USE_CHUNKS);
        }

        if desc.supports_run_synth() || desc.supports_run_multiple() {
            avail.insert(Options::SEND_CONTROL_CHANGES);
            avail.insert(Options::SEND_CHANNEL_PRESSURE);
            avail.insert(Options::SEND_NOTE_AFTERTOUCH);
            avail.insert(Options::SEND_PITCHBEND);
            avail.insert(Options::SEND_ALL_SOUND_OFF);
        }

        avail
    }
}

impl std::ops::BitOr for Options {
    type Output = Options;

    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Options {
    fn bitor_assign(&mut self, rhs: Options) {
        self.0 |= rhs.0;
    }
}

/// Non-real-time notification delivered to the host's control thread.
///
/// Audio-thread originated changes (CC-driven parameter edits, mapped
/// program changes, note activity) surface here after `dispatch_deferred`
/// drains the deferred queue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Notification {
    ParameterChanged { index: u32, value: f32 },
    DryWetChanged(f32),
    VolumeChanged(f32),
    BalanceChanged { left: f32, right: f32 },
    ProgramChanged(i32),
    ProgramsReloaded,
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
}

/// f32 stored as atomic bits. Relaxed ordering: these are independent
/// scalars (dry/wet, volume, balance) with no ordering relationship to
/// other memory.
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_bit_ops() {
        let mut opts = Options::MAP_PROGRAM_CHANGES | Options::FORCE_STEREO;
        assert!(opts.contains(Options::FORCE_STEREO));
        assert!(!opts.contains(Options::USE_CHUNKS));

        opts.remove(Options::FORCE_STEREO);
        assert!(!opts.contains(Options::FORCE_STEREO));
        assert!(opts.contains(Options::MAP_PROGRAM_CHANGES));

        opts.insert(Options::SEND_PITCHBEND);
        assert_eq!(
            opts.intersect(Options::SEND_PITCHBEND),
            Options::SEND_PITCHBEND
        );
    }

    #[test]
    fn atomic_f32_round_trips() {
        let a = AtomicF32::new(0.25);
        assert_eq!(a.load(), 0.25);
        a.store(-1.5);
        assert_eq!(a.load(), -1.5);
    }
}
