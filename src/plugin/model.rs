//! Port and parameter model, rebuilt wholesale on every reload.
//!
//! The audio thread reads a [`Model`] snapshot through an atomic `Arc` swap,
//! so classification here runs entirely on the control thread and nothing in
//! the model mutates afterwards. Current parameter values live separately in
//! [`ParamValues`], whose storage addresses are handed to the plugin via
//! `connect_port` and therefore must outlive every run call.

use std::cell::UnsafeCell;

use crate::plugin::descriptor::{
    PluginHandle, RawPortDirection, RawPortKind, SynthDescriptor,
};
use crate::plugin::events::MIDI_CC_BANK_SELECT;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParameterKind {
    Input,
    Output,
    /// Output port reporting the plugin's latency in frames; tracked
    /// internally, never exposed for automation.
    Latency,
    /// Output port mirroring the host sample rate; tracked internally.
    SampleRate,
    /// Malformed control port kept only so indices stay dense.
    Unknown,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ParamHints {
    pub boolean: bool,
    pub integer: bool,
    pub logarithmic: bool,
    pub uses_sample_rate: bool,
    pub enabled: bool,
    pub automable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
    pub def: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

impl ParamRange {
    pub fn fix(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    pub fn normalized(&self, value: f32) -> f32 {
        if self.max <= self.min {
            return 0.0;
        }
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }

    pub fn unnormalized(&self, norm: f32) -> f32 {
        self.min + norm * (self.max - self.min)
    }
}

#[derive(Clone, Debug)]
pub struct ParameterSlot {
    pub index: u32,
    /// Index into the descriptor's port table.
    pub raw_index: usize,
    pub kind: ParameterKind,
    pub hints: ParamHints,
    pub range: ParamRange,
    pub midi_channel: u8,
    /// `None` = unbound (the original encodes this as -1).
    pub midi_cc: Option<u8>,
}

#[derive(Clone, Copy, Debug)]
pub struct AudioPort {
    pub raw_index: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilityHints {
    pub is_synth: bool,
    pub can_dry_wet: bool,
    pub can_volume: bool,
    pub can_balance: bool,
    pub has_gui: bool,
    pub is_rt_safe: bool,
}

/// Immutable snapshot of everything the block processor needs to know about
/// the plugin's shape. Replaced as a whole by the reload engine.
#[derive(Clone, Default)]
pub struct Model {
    pub audio_in: Vec<AudioPort>,
    pub audio_out: Vec<AudioPort>,
    pub params: Vec<ParameterSlot>,
    pub hints: CapabilityHints,
    pub has_event_in: bool,
    pub has_event_out: bool,
    pub forced_stereo_in: bool,
    pub forced_stereo_out: bool,
}

impl Model {
    pub fn latency_slot(&self) -> Option<usize> {
        self.params
            .iter()
            .position(|p| p.kind == ParameterKind::Latency)
    }
}

/// Plain audio/control × input/output port counts, before stereo forcing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortCounts {
    pub audio_in: usize,
    pub audio_out: usize,
    pub control: usize,
}

pub fn count_ports(desc: &dyn SynthDescriptor) -> PortCounts {
    let mut counts = PortCounts::default();
    for i in 0..desc.port_count() {
        let port = desc.port(i);
        match port.kind {
            RawPortKind::Audio => match port.direction {
                RawPortDirection::Input => counts.audio_in += 1,
                RawPortDirection::Output => counts.audio_out += 1,
                RawPortDirection::Unknown => {}
            },
            RawPortKind::Control => counts.control += 1,
            RawPortKind::Other => {}
        }
    }
    counts
}

/// Classified port table plus the per-slot default values the parameter
/// buffer starts from.
pub struct BuiltModel {
    pub audio_in: Vec<AudioPort>,
    pub audio_out: Vec<AudioPort>,
    pub params: Vec<ParameterSlot>,
    pub defaults: Vec<f32>,
    pub needs_ctrl_in: bool,
    pub needs_ctrl_out: bool,
}

/// Walk the descriptor's port table and classify every port.
///
/// `handle` is only used for the per-port MIDI controller query; forced
/// stereo duplicates the single mono port entry so downstream code sees two
/// bindable ports per side.
pub fn build(
    desc: &dyn SynthDescriptor,
    handle: PluginHandle,
    sample_rate: f32,
    forced_stereo_in: bool,
    forced_stereo_out: bool,
) -> BuiltModel {
    let mut audio_in = Vec::new();
    let mut audio_out = Vec::new();
    let mut params = Vec::new();
    let mut defaults = Vec::new();
    let mut needs_ctrl_in = false;
    let mut needs_ctrl_out = false;

    for i in 0..desc.port_count() {
        let port = desc.port(i);
        match port.kind {
            RawPortKind::Audio => match port.direction {
                RawPortDirection::Input => {
                    audio_in.push(AudioPort { raw_index: i });
                    if forced_stereo_in {
                        audio_in.push(AudioPort { raw_index: i });
                    }
                }
                RawPortDirection::Output => {
                    audio_out.push(AudioPort { raw_index: i });
                    if forced_stereo_out {
                        audio_out.push(AudioPort { raw_index: i });
                    }
                }
                RawPortDirection::Unknown => {
                    log::warn!("broken port {i} ({}): audio, but neither input nor output", port.name);
                }
            },
            RawPortKind::Control => {
                let slot = classify_control_port(desc, handle, i, &port, sample_rate, params.len());
                match slot.kind {
                    ParameterKind::Input => needs_ctrl_in = true,
                    ParameterKind::Output => needs_ctrl_out = true,
                    _ => {}
                }
                defaults.push(slot.range.def);
                params.push(slot);
            }
            RawPortKind::Other => {
                log::warn!("broken port {i} ({}): neither audio nor control", port.name);
            }
        }
    }

    BuiltModel {
        audio_in,
        audio_out,
        params,
        defaults,
        needs_ctrl_in,
        needs_ctrl_out,
    }
}

fn classify_control_port(
    desc: &dyn SynthDescriptor,
    handle: PluginHandle,
    raw_index: usize,
    port: &crate::plugin::descriptor::PortInfo,
    sample_rate: f32,
    slot_index: usize,
) -> ParameterSlot {
    let hint = port.hint;
    let mut hints = ParamHints::default();

    let mut min = if hint.bounded_below { hint.lower } else { 0.0 };
    let mut max = if hint.bounded_above { hint.upper } else { 1.0 };

    if min > max {
        max = min;
    }
    if max - min == 0.0 {
        log::warn!("broken parameter '{}': max - min == 0.0", port.name);
        max = min + 0.1;
    }

    let mut def = hint.default_value(min, max);

    if hint.sample_rate {
        min *= sample_rate;
        max *= sample_rate;
        def *= sample_rate;
        hints.uses_sample_rate = true;
    }

    let (step, step_small, step_large) = if hint.toggled {
        hints.boolean = true;
        let s = max - min;
        (s, s, s)
    } else if hint.integer {
        hints.integer = true;
        (1.0, 1.0, 10.0)
    } else {
        let range = max - min;
        (range / 100.0, range / 1000.0, range / 10.0)
    };
    let mut range = ParamRange {
        min,
        max,
        def,
        step,
        step_small,
        step_large,
    };

    let mut midi_cc = None;
    let kind = match port.direction {
        RawPortDirection::Input => {
            hints.enabled = true;
            hints.automable = true;
            // Auto-bind the plugin's preferred controller; bank select stays
            // reserved for program mapping.
            if let Some(cc) = desc.midi_controller_for_port(handle, raw_index) {
                if cc != MIDI_CC_BANK_SELECT {
                    midi_cc = Some(cc);
                }
            }
            ParameterKind::Input
        }
        RawPortDirection::Output => {
            if port.name == "latency" || port.name == "_latency" {
                range = ParamRange {
                    min: 0.0,
                    max: sample_rate,
                    def: 0.0,
                    step: 1.0,
                    step_small: 1.0,
                    step_large: 1.0,
                };
                hints = ParamHints::default();
                ParameterKind::Latency
            } else if port.name == "_sample-rate" {
                range.def = sample_rate;
                range.step = 1.0;
                range.step_small = 1.0;
                range.step_large = 1.0;
                hints = ParamHints::default();
                ParameterKind::SampleRate
            } else {
                hints.enabled = true;
                hints.automable = true;
                ParameterKind::Output
            }
        }
        RawPortDirection::Unknown => {
            log::warn!("broken port {raw_index} ({}): control, but neither input nor output", port.name);
            ParameterKind::Unknown
        }
    };

    if hint.logarithmic {
        hints.logarithmic = true;
    }

    ParameterSlot {
        index: slot_index as u32,
        raw_index,
        kind,
        hints,
        range,
        midi_channel: 0,
        midi_cc,
    }
}

/// Derive the post-processing/automation capabilities from the reloaded
/// shape. `midi_in` is true when the plugin takes native events at all.
pub fn derive_hints(
    desc: &dyn SynthDescriptor,
    midi_in: bool,
    audio_ins: usize,
    audio_outs: usize,
    has_gui: bool,
) -> CapabilityHints {
    CapabilityHints {
        is_synth: midi_in && audio_ins == 0 && audio_outs > 0,
        can_dry_wet: audio_outs > 0 && (audio_ins == audio_outs || audio_ins == 1),
        can_volume: audio_outs > 0,
        can_balance: audio_outs >= 2 && audio_outs % 2 == 0,
        has_gui,
        is_rt_safe: desc.is_hard_rt_capable(),
    }
}

// ---------------------------------------------------------------------------
// Shared parameter storage
// ---------------------------------------------------------------------------

/// Flat per-slot value buffer whose element addresses are bound into the
/// plugin through `connect_port`. Both stereo twins share the same storage,
/// so one write reaches both instances.
pub struct ParamValues {
    cells: Box<[UnsafeCell<f32>]>,
}

// SAFETY: the cells are shared with the plugin's C code by address; the
// adapter's own accesses are single word-sized loads/stores that cannot
// tear on supported targets, matching the contract the native API already
// imposes on every host.
unsafe impl Send for ParamValues {}
unsafe impl Sync for ParamValues {}

impl ParamValues {
    pub fn new(defaults: &[f32]) -> Self {
        ParamValues {
            cells: defaults.iter().map(|&v| UnsafeCell::new(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> f32 {
        // SAFETY: in-bounds word read, see type-level comment.
        unsafe { self.cells[index].get().read() }
    }

    pub fn set(&self, index: usize, value: f32) {
        // SAFETY: in-bounds word write, see type-level comment.
        unsafe { self.cells[index].get().write(value) }
    }

    pub fn ptr(&self, index: usize) -> *mut f32 {
        self.cells[index].get()
    }
}
