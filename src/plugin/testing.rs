//! Synthetic descriptors for exercising the adapter without a real plugin
//! binary. The mock honours the same contract the FFI layer does: ports are
//! bound by raw address and only touched inside run calls.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Mutex;

use crate::plugin::adapter::lock;
use crate::plugin::descriptor::{
    PluginHandle, PortInfo, ProgramInfo, RangeHint, RawPortDirection, RawPortKind,
    SynthDescriptor,
};
use crate::plugin::events::NativeEvent;

pub struct MockPort {
    pub name: String,
    pub kind: RawPortKind,
    pub direction: RawPortDirection,
    pub hint: RangeHint,
}

pub fn audio_in(name: &str) -> MockPort {
    MockPort {
        name: name.into(),
        kind: RawPortKind::Audio,
        direction: RawPortDirection::Input,
        hint: RangeHint::default(),
    }
}

pub fn audio_out(name: &str) -> MockPort {
    MockPort {
        name: name.into(),
        kind: RawPortKind::Audio,
        direction: RawPortDirection::Output,
        hint: RangeHint::default(),
    }
}

pub fn control_in(name: &str, hint: RangeHint) -> MockPort {
    MockPort {
        name: name.into(),
        kind: RawPortKind::Control,
        direction: RawPortDirection::Input,
        hint,
    }
}

pub fn control_out(name: &str, hint: RangeHint) -> MockPort {
    MockPort {
        name: name.into(),
        kind: RawPortKind::Control,
        direction: RawPortDirection::Output,
        hint,
    }
}

struct InstanceState {
    connections: Vec<*mut f32>,
    active: bool,
}

/// One native event as the mock saw it delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: u8,
    pub tick: u32,
    pub channel: u8,
    /// Note number or controller param, depending on kind.
    pub data1: u32,
    /// Velocity, controller value, or bend amount.
    pub data2: i32,
}

/// One run invocation as the mock saw it.
#[derive(Clone, Debug)]
pub struct RunRecord {
    pub instance: usize,
    pub frames: u32,
    pub events: Vec<RecordedEvent>,
}

pub struct MockDescriptor {
    pub label: String,
    pub ports: Vec<MockPort>,
    pub has_run_synth: bool,
    pub has_run_multiple: bool,
    pub with_activation: bool,
    pub fixed_buffers: bool,
    pub rt_capable: bool,
    pub chunks: bool,
    pub max_instances: Option<usize>,
    /// Effect transfer: out[k] = in[k] * gain when an input is connected.
    pub gain: f32,
    /// Synth output level for out port `p`: synth_level * (p + 1).
    pub synth_level: f32,
    /// Written into a connected `latency`/`_latency` port on every run.
    pub latency_report: Option<f32>,
    pub cc_map: HashMap<usize, u8>,

    programs: Mutex<Vec<ProgramInfo>>,
    instances: Mutex<Vec<Option<InstanceState>>>,
    pub run_log: Mutex<Vec<RunRecord>>,
    pub select_log: Mutex<Vec<(usize, u32, u32)>>,
    pub configure_log: Mutex<Vec<(String, String)>>,
    pub chunk_data: Mutex<Vec<u8>>,
}

// SAFETY: test-only. The raw connection pointers are only dereferenced
// inside run calls, which the adapter serializes behind its engine lock.
unsafe impl Send for MockDescriptor {}
unsafe impl Sync for MockDescriptor {}

impl MockDescriptor {
    fn new(ports: Vec<MockPort>) -> Self {
        MockDescriptor {
            label: "mock".into(),
            ports,
            has_run_synth: false,
            has_run_multiple: false,
            with_activation: true,
            fixed_buffers: false,
            rt_capable: true,
            chunks: false,
            max_instances: None,
            gain: 0.5,
            synth_level: 0.25,
            latency_report: None,
            cc_map: HashMap::new(),
            programs: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
            run_log: Mutex::new(Vec::new()),
            select_log: Mutex::new(Vec::new()),
            configure_log: Mutex::new(Vec::new()),
            chunk_data: Mutex::new(Vec::new()),
        }
    }

    /// Plain effect: generic run entry only.
    pub fn effect(ports: Vec<MockPort>) -> Self {
        Self::new(ports)
    }

    /// Instrument with the per-instance synth entry.
    pub fn synth(ports: Vec<MockPort>) -> Self {
        let mut desc = Self::new(ports);
        desc.has_run_synth = true;
        desc
    }

    /// Instrument exposing only the batched multi-instance entry.
    pub fn multi_only(ports: Vec<MockPort>) -> Self {
        let mut desc = Self::new(ports);
        desc.has_run_multiple = true;
        desc
    }

    pub fn set_programs(&self, programs: Vec<ProgramInfo>) {
        *lock(&self.programs) = programs;
    }

    pub fn live_instances(&self) -> usize {
        lock(&self.instances)
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub fn take_run_log(&self) -> Vec<RunRecord> {
        std::mem::take(&mut lock(&self.run_log))
    }

    pub fn instance_active(&self, instance: usize) -> bool {
        lock(&self.instances)
            .get(instance)
            .and_then(|s| s.as_ref())
            .is_some_and(|s| s.active)
    }

    /// The buffer address currently bound to `port` on `instance`.
    pub fn connection_of(&self, instance: usize, port: usize) -> *mut f32 {
        lock(&self.instances)
            .get(instance)
            .and_then(|s| s.as_ref())
            .map(|s| s.connections[port])
            .unwrap_or(std::ptr::null_mut())
    }

    fn handle_id(handle: PluginHandle) -> usize {
        handle.raw() as usize - 1
    }

    /// Deterministic audio transfer applied by every run entry.
    fn run_audio(&self, id: usize, frames: u32) {
        let connections = {
            let instances = lock(&self.instances);
            match instances.get(id).and_then(|s| s.as_ref()) {
                Some(state) => state.connections.clone(),
                None => return,
            }
        };
        let n = frames as usize;

        let input = self
            .ports
            .iter()
            .enumerate()
            .find(|(_, p)| {
                p.kind == RawPortKind::Audio && p.direction == RawPortDirection::Input
            })
            .map(|(i, _)| connections[i])
            .filter(|ptr| !ptr.is_null());

        let mut out_ordinal = 0usize;
        for (i, port) in self.ports.iter().enumerate() {
            match (port.kind, port.direction) {
                (RawPortKind::Audio, RawPortDirection::Output) => {
                    let ptr = connections[i];
                    if !ptr.is_null() {
                        // SAFETY: the adapter bound a buffer of at least
                        // `frames` samples and holds its engine lock.
                        let out = unsafe { std::slice::from_raw_parts_mut(ptr, n) };
                        match input {
                            Some(src) => {
                                // SAFETY: as above.
                                let src = unsafe { std::slice::from_raw_parts(src, n) };
                                for k in 0..n {
                                    out[k] = src[k] * self.gain;
                                }
                            }
                            None => {
                                out.fill(self.synth_level * (out_ordinal as f32 + 1.0));
                            }
                        }
                    }
                    out_ordinal += 1;
                }
                (RawPortKind::Control, RawPortDirection::Output) => {
                    if let Some(latency) = self.latency_report {
                        if (port.name == "latency" || port.name == "_latency")
                            && !connections[i].is_null()
                        {
                            // SAFETY: bound control storage, single word.
                            unsafe { connections[i].write(latency) };
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn record_run(&self, id: usize, frames: u32, events: &[NativeEvent]) {
        use crate::plugin::events::seq;
        let events = events
            .iter()
            .map(|e| match e.r#type {
                seq::NOTE_ON | seq::NOTE_OFF | seq::KEY_PRESSURE => {
                    let note = e.note();
                    RecordedEvent {
                        kind: e.r#type,
                        tick: e.tick(),
                        channel: note.channel,
                        data1: note.note as u32,
                        data2: note.velocity as i32,
                    }
                }
                _ => {
                    let ctrl = e.control();
                    RecordedEvent {
                        kind: e.r#type,
                        tick: e.tick(),
                        channel: ctrl.channel,
                        data1: ctrl.param,
                        data2: ctrl.value,
                    }
                }
            })
            .collect();
        lock(&self.run_log).push(RunRecord {
            instance: id,
            frames,
            events,
        });
    }
}

impl SynthDescriptor for MockDescriptor {
    fn label(&self) -> &str {
        &self.label
    }

    fn name(&self) -> &str {
        "Mock Plugin"
    }

    fn maker(&self) -> &str {
        "rivet tests"
    }

    fn is_hard_rt_capable(&self) -> bool {
        self.rt_capable
    }

    fn requires_fixed_buffers(&self) -> bool {
        self.fixed_buffers
    }

    fn port_count(&self) -> usize {
        self.ports.len()
    }

    fn port(&self, index: usize) -> PortInfo {
        let p = &self.ports[index];
        PortInfo {
            name: p.name.clone(),
            kind: p.kind,
            direction: p.direction,
            hint: p.hint,
        }
    }

    fn instantiate(&self, _sample_rate: u32) -> Option<PluginHandle> {
        let mut instances = lock(&self.instances);
        if let Some(max) = self.max_instances {
            let live = instances.iter().filter(|s| s.is_some()).count();
            if live >= max {
                return None;
            }
        }
        instances.push(Some(InstanceState {
            connections: vec![std::ptr::null_mut(); self.ports.len()],
            active: false,
        }));
        Some(PluginHandle(instances.len() as *mut c_void))
    }

    unsafe fn connect_port(&self, handle: PluginHandle, port: usize, data: *mut f32) {
        let mut instances = lock(&self.instances);
        if let Some(Some(state)) = instances.get_mut(Self::handle_id(handle)) {
            state.connections[port] = data;
        }
    }

    fn supports_activation(&self) -> bool {
        self.with_activation
    }

    fn activate(&self, handle: PluginHandle) {
        let mut instances = lock(&self.instances);
        if let Some(Some(state)) = instances.get_mut(Self::handle_id(handle)) {
            state.active = true;
        }
    }

    fn deactivate(&self, handle: PluginHandle) {
        let mut instances = lock(&self.instances);
        if let Some(Some(state)) = instances.get_mut(Self::handle_id(handle)) {
            state.active = false;
        }
    }

    fn cleanup(&self, handle: PluginHandle) {
        let mut instances = lock(&self.instances);
        if let Some(slot) = instances.get_mut(Self::handle_id(handle)) {
            *slot = None;
        }
    }

    fn run(&self, handle: PluginHandle, frames: u32) {
        let id = Self::handle_id(handle);
        self.record_run(id, frames, &[]);
        self.run_audio(id, frames);
    }

    fn supports_run_synth(&self) -> bool {
        self.has_run_synth
    }

    fn run_synth(&self, handle: PluginHandle, frames: u32, events: &mut [NativeEvent]) {
        let id = Self::handle_id(handle);
        self.record_run(id, frames, events);
        self.run_audio(id, frames);
    }

    fn supports_run_multiple(&self) -> bool {
        self.has_run_multiple
    }

    fn run_multiple(&self, handles: &[PluginHandle], frames: u32, events: &mut [NativeEvent]) {
        for &handle in handles {
            let id = Self::handle_id(handle);
            self.record_run(id, frames, events);
            self.run_audio(id, frames);
        }
    }

    fn midi_controller_for_port(&self, _handle: PluginHandle, port: usize) -> Option<u8> {
        self.cc_map.get(&port).copied()
    }

    fn supports_programs(&self) -> bool {
        !lock(&self.programs).is_empty()
    }

    fn program(&self, _handle: PluginHandle, index: u32) -> Option<ProgramInfo> {
        lock(&self.programs).get(index as usize).cloned()
    }

    fn select_program(&self, handle: PluginHandle, bank: u32, program: u32) {
        lock(&self.select_log).push((Self::handle_id(handle), bank, program));
        // Selecting a program rewrites parameter values through the bound
        // control storage, like a real plugin would.
        let instances = lock(&self.instances);
        if let Some(Some(state)) = instances.get(Self::handle_id(handle)) {
            for (i, port) in self.ports.iter().enumerate() {
                if port.kind == RawPortKind::Control
                    && port.direction == RawPortDirection::Input
                    && !state.connections[i].is_null()
                {
                    // SAFETY: bound control storage, single word.
                    unsafe { state.connections[i].write((bank * 100 + program) as f32) };
                    break;
                }
            }
        }
    }

    fn supports_configure(&self) -> bool {
        true
    }

    fn configure(&self, _handle: PluginHandle, key: &str, value: &str) {
        lock(&self.configure_log).push((key.to_string(), value.to_string()));
    }

    fn supports_chunks(&self) -> bool {
        self.chunks
    }

    fn chunk(&self, _handle: PluginHandle) -> Option<Vec<u8>> {
        if !self.chunks {
            return None;
        }
        Some(lock(&self.chunk_data).clone())
    }

    fn set_chunk(&self, _handle: PluginHandle, data: &[u8]) -> bool {
        if !self.chunks {
            return false;
        }
        *lock(&self.chunk_data) = data.to_vec();
        true
    }
}
