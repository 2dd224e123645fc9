//! The capability interface the adapter consumes instead of the plugin's raw
//! descriptor table.
//!
//! The native API hands out a struct of nullable function pointers; callers
//! are expected to null-check before every call. Here each optional entry
//! point is paired with an explicit `supports_*` query (or returns `Option`),
//! so the adapter's call sites carry the contract in the type system. The
//! production implementation lives in [`crate::plugin::library`].

use std::ffi::c_void;

use crate::plugin::events::NativeEvent;

/// Opaque per-instance token returned by [`SynthDescriptor::instantiate`].
///
/// The token is only meaningful to the descriptor that produced it; every
/// operation on the underlying instance goes back through that descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PluginHandle(pub(crate) *mut c_void);

// SAFETY: the handle is an opaque token. All dereferencing happens inside
// the plugin's own code via SynthDescriptor calls, and the adapter
// serializes those behind its engine lock.
unsafe impl Send for PluginHandle {}
unsafe impl Sync for PluginHandle {}

impl PluginHandle {
    pub fn raw(self) -> *mut c_void {
        self.0
    }
}

/// What a descriptor port carries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RawPortKind {
    Audio,
    Control,
    /// Malformed descriptor entry: neither audio nor control.
    Other,
}

/// Which way a descriptor port flows.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RawPortDirection {
    Input,
    Output,
    /// Malformed descriptor entry: neither input nor output.
    Unknown,
}

/// Default-value policy a port's range hint declares.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DefaultHint {
    #[default]
    None,
    Minimum,
    Low,
    Middle,
    High,
    Maximum,
    Zero,
    One,
    Hundred,
    FourForty,
}

/// Decoded range hint for a control port.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeHint {
    pub bounded_below: bool,
    pub bounded_above: bool,
    pub lower: f32,
    pub upper: f32,
    pub toggled: bool,
    pub sample_rate: bool,
    pub logarithmic: bool,
    pub integer: bool,
    pub default: DefaultHint,
}

impl RangeHint {
    /// Resolve the hinted default inside `[min, max]`.
    pub fn default_value(&self, min: f32, max: f32) -> f32 {
        let def = match self.default {
            DefaultHint::Minimum => min,
            DefaultHint::Maximum => max,
            DefaultHint::Zero => 0.0,
            DefaultHint::One => 1.0,
            DefaultHint::Hundred => 100.0,
            DefaultHint::FourForty => 440.0,
            DefaultHint::Low => {
                if self.logarithmic {
                    (min.ln() * 0.75 + max.ln() * 0.25).exp()
                } else {
                    min * 0.75 + max * 0.25
                }
            }
            DefaultHint::Middle => {
                if self.logarithmic {
                    (min * max).sqrt()
                } else {
                    (min + max) / 2.0
                }
            }
            DefaultHint::High => {
                if self.logarithmic {
                    (min.ln() * 0.25 + max.ln() * 0.75).exp()
                } else {
                    min * 0.25 + max * 0.75
                }
            }
            DefaultHint::None => min,
        };
        def.clamp(min, max)
    }
}

/// One entry of the descriptor's port table.
#[derive(Clone, Debug)]
pub struct PortInfo {
    pub name: String,
    pub kind: RawPortKind,
    pub direction: RawPortDirection,
    pub hint: RangeHint,
}

/// One entry of the plugin's built-in program list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramInfo {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

/// Capability interface over a loaded plugin descriptor.
///
/// Mandatory operations (`instantiate`, `connect_port`, `run`, `cleanup`)
/// are plain methods. Optional entry points come with a `supports_*` query;
/// calling an unsupported operation is a no-op, never undefined behaviour.
pub trait SynthDescriptor: Send + Sync {
    fn label(&self) -> &str;
    fn name(&self) -> &str;
    fn maker(&self) -> &str;
    fn is_hard_rt_capable(&self) -> bool;

    /// True when the plugin cannot handle sample-accurate sub-blocks and
    /// must receive whole, fixed-size buffers.
    fn requires_fixed_buffers(&self) -> bool {
        false
    }

    fn port_count(&self) -> usize;
    fn port(&self, index: usize) -> PortInfo;

    fn instantiate(&self, sample_rate: u32) -> Option<PluginHandle>;

    /// Bind `data` as the storage for `port` on `handle`.
    ///
    /// # Safety
    /// `data` must stay valid (and writable) until the port is rebound or
    /// the handle is cleaned up; the plugin reads and writes through it from
    /// every subsequent run call.
    unsafe fn connect_port(&self, handle: PluginHandle, port: usize, data: *mut f32);

    fn supports_activation(&self) -> bool;
    fn activate(&self, handle: PluginHandle);
    fn deactivate(&self, handle: PluginHandle);
    fn cleanup(&self, handle: PluginHandle);

    /// Generic run entry for effect plugins (no event delivery).
    fn run(&self, handle: PluginHandle, frames: u32);

    fn supports_run_synth(&self) -> bool;
    fn run_synth(&self, handle: PluginHandle, frames: u32, events: &mut [NativeEvent]);

    /// True when the plugin only exposes the batched multi-instance entry.
    /// Such plugins keep process-global state and may be loaded at most once
    /// per label (see [`crate::plugin::instance::ExclusiveRegistry`]).
    fn supports_run_multiple(&self) -> bool;
    fn run_multiple(&self, handles: &[PluginHandle], frames: u32, events: &mut [NativeEvent]);

    /// CC number the plugin wants bound to `port`, if any. Non-CC bindings
    /// (NRPNs) resolve to `None`.
    fn midi_controller_for_port(&self, handle: PluginHandle, port: usize) -> Option<u8>;

    fn supports_programs(&self) -> bool;
    fn program(&self, handle: PluginHandle, index: u32) -> Option<ProgramInfo>;
    fn select_program(&self, handle: PluginHandle, bank: u32, program: u32);

    fn supports_configure(&self) -> bool;
    fn configure(&self, handle: PluginHandle, key: &str, value: &str);

    fn supports_chunks(&self) -> bool;
    fn chunk(&self, handle: PluginHandle) -> Option<Vec<u8>>;
    fn set_chunk(&self, handle: PluginHandle, data: &[u8]) -> bool;
}
