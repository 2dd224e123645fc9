//! The host-side adapter around one loaded DSSI/LADSPA plugin.
//!
//! `DssiPlugin` is shared between two roles: a control thread (construction,
//! reload, parameter edits, program selection, custom data) and a real-time
//! audio thread calling [`DssiPlugin::process`] once per block (see
//! `process.rs`). The engine mutex guards one sub-block's worth of plugin
//! invocation and every control-thread poke at the instances; the outer
//! master mutex serializes reconfiguration against teardown.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crossbeam_channel::Sender;
use ringbuf::{HeapCons, HeapProd};

use crate::plugin::descriptor::{RawPortKind, SynthDescriptor};
use crate::plugin::events::{self, DeferredEvent};
use crate::plugin::instance::{ExclusiveRegistry, ExclusivePermit, Instances};
use crate::plugin::model::{self, Model, ParamValues, ParameterSlot};
use crate::plugin::programs::{self, ProgramEntry};
use crate::plugin::{AtomicF32, Notification, Options};

/// Poison-agnostic lock: a panicked writer never wedges the adapter.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

const EXT_NOTE_CAPACITY: usize = 128;

/// Note queued from outside the host event stream (UI keyboards, test
/// injection). Drained by the block processor with a try-lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExternalNote {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
}

/// Everything the block path mutates, behind the single engine lock:
/// the live instance handles, private audio buffers, and latency state.
pub(crate) struct Engine {
    pub instances: Instances,
    pub audio_in: Vec<Box<[f32]>>,
    pub audio_out: Vec<Box<[f32]>>,
    /// Balance post-processing scratch, sized to the block budget.
    pub bal_scratch: Box<[f32]>,
    pub latency_bufs: Vec<Box<[f32]>>,
    pub latency: u32,
    /// Keeps the storage the plugin's control ports point at alive.
    pub values: Arc<ParamValues>,
}

/// Host-chosen construction settings.
pub struct HostConfig {
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub options: Options,
    /// MIDI channel the backend macros (dry/wet, volume, balance) and
    /// program mapping listen on.
    pub ctrl_channel: u8,
    /// External UI binary, if the plugin ships one. Only feeds the has-gui
    /// capability hint; spawning it is not this crate's job.
    pub ui_binary: Option<PathBuf>,
    pub notifications: Option<Sender<Notification>>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            sample_rate: 48_000,
            buffer_size: 512,
            options: Options::NONE,
            ctrl_channel: 0,
            ui_binary: None,
            notifications: None,
        }
    }
}

impl std::fmt::Debug for DssiPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssiPlugin").field("label", &self.label).finish_non_exhaustive()
    }
}

pub struct DssiPlugin {
    pub(crate) desc: Arc<dyn SynthDescriptor>,
    name: String,
    label: String,
    ui_binary: Option<PathBuf>,
    _permit: Option<ExclusivePermit>,

    pub(crate) options: AtomicU32,
    available_options: AtomicU32,
    pub(crate) ctrl_channel: AtomicI8,
    pub(crate) active: AtomicBool,
    /// One-shot disable while a reconfiguration is in flight.
    pub(crate) disabled: AtomicBool,
    pub(crate) needs_reset: AtomicBool,
    pub(crate) offline: AtomicBool,
    initialized: AtomicBool,
    sample_rate: AtomicU32,
    buffer_size: AtomicU32,

    pub(crate) dry_wet: AtomicF32,
    pub(crate) volume: AtomicF32,
    pub(crate) balance_left: AtomicF32,
    pub(crate) balance_right: AtomicF32,

    pub(crate) model: ArcSwap<Model>,
    pub(crate) values: ArcSwap<ParamValues>,
    pub(crate) programs: ArcSwap<Vec<ProgramEntry>>,
    pub(crate) current_program: AtomicI32,
    /// Program switch resolved on the audio thread, applied by
    /// [`DssiPlugin::dispatch_deferred`]. -1 = none pending.
    pub(crate) pending_program: AtomicI32,

    master: Mutex<()>,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) ext_notes: Mutex<VecDeque<ExternalNote>>,
    pub(crate) post_prod: Mutex<HeapProd<DeferredEvent>>,
    post_cons: Mutex<HeapCons<DeferredEvent>>,
    notifications: Option<Sender<Notification>>,
}

impl DssiPlugin {
    /// Load the adapter around an already-resolved descriptor.
    ///
    /// Fails when the label needs (and cannot get) process-wide exclusivity
    /// or the plugin refuses to instantiate. No partial state survives a
    /// failure. The returned adapter has been reloaded once and is inactive.
    pub fn new(
        desc: Arc<dyn SynthDescriptor>,
        registry: &Arc<ExclusiveRegistry>,
        config: HostConfig,
    ) -> anyhow::Result<DssiPlugin> {
        let label = desc.label().to_string();
        let name = desc.name().to_string();

        // Plugins with only the batched run entry keep process-global state.
        let permit = if !desc.supports_run_synth() && desc.supports_run_multiple() {
            log::warn!("plugin '{label}' can ONLY use the multi-instance run entry");
            Some(registry.acquire(&label)?)
        } else {
            None
        };

        let handle = desc
            .instantiate(config.sample_rate)
            .ok_or_else(|| anyhow::anyhow!("plugin '{label}' failed to initialize"))?;

        let counts = model::count_ports(&*desc);
        let is_synth_api = desc.supports_run_synth() || desc.supports_run_multiple();

        let mut options = config.options | Options::MAP_PROGRAM_CHANGES;
        if is_synth_api {
            options.insert(Options::SEND_CONTROL_CHANGES);
            options.insert(Options::SEND_CHANNEL_PRESSURE);
            options.insert(Options::SEND_NOTE_AFTERTOUCH);
            options.insert(Options::SEND_PITCHBEND);
            options.insert(Options::SEND_ALL_SOUND_OFF);
        }
        let available = Options::available_for(&*desc, counts.audio_in, counts.audio_out);
        options = options.intersect(available);
        // Not negotiable when the plugin can't split buffers.
        if desc.requires_fixed_buffers() {
            options.insert(Options::FIXED_BUFFER);
        }

        let (post_prod, post_cons) = events::deferred_queue();

        let plugin = DssiPlugin {
            desc,
            name,
            label,
            ui_binary: config.ui_binary,
            _permit: permit,
            options: AtomicU32::new(options.bits()),
            available_options: AtomicU32::new(available.bits()),
            ctrl_channel: AtomicI8::new(config.ctrl_channel as i8),
            active: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            needs_reset: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            sample_rate: AtomicU32::new(config.sample_rate),
            buffer_size: AtomicU32::new(config.buffer_size),
            dry_wet: AtomicF32::new(1.0),
            volume: AtomicF32::new(1.0),
            balance_left: AtomicF32::new(-1.0),
            balance_right: AtomicF32::new(1.0),
            model: ArcSwap::from_pointee(Model::default()),
            values: ArcSwap::from_pointee(ParamValues::new(&[])),
            programs: ArcSwap::from_pointee(Vec::new()),
            current_program: AtomicI32::new(-1),
            pending_program: AtomicI32::new(-1),
            master: Mutex::new(()),
            engine: Mutex::new(Engine {
                instances: Instances::Mono(handle),
                audio_in: Vec::new(),
                audio_out: Vec::new(),
                bal_scratch: Box::new([]),
                latency_bufs: Vec::new(),
                latency: 0,
                values: Arc::new(ParamValues::new(&[])),
            }),
            ext_notes: Mutex::new(VecDeque::with_capacity(EXT_NOTE_CAPACITY)),
            post_prod: Mutex::new(post_prod),
            post_cons: Mutex::new(post_cons),
            notifications: config.notifications,
        };

        plugin.reload()?;
        Ok(plugin)
    }

    // -----------------------------------------------------------------------
    // Information
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn maker(&self) -> String {
        self.desc.maker().to_string()
    }

    pub fn options(&self) -> Options {
        Options::from_bits(self.options.load(Ordering::Relaxed))
    }

    pub fn available_options(&self) -> Options {
        Options::from_bits(self.available_options.load(Ordering::Relaxed))
    }

    /// Toggle one option at runtime, subject to the plugin's capability
    /// gating. Flipping FORCE_STEREO only takes effect on the next reload.
    pub fn set_option(&self, option: Options, enabled: bool) {
        if enabled && !self.available_options().contains(option) {
            log::warn!(
                "option {option:?} not available for '{}', ignoring",
                self.name
            );
            return;
        }
        if !enabled && option == Options::FIXED_BUFFER && self.desc.requires_fixed_buffers() {
            return;
        }
        let mut opts = self.options();
        if enabled {
            opts.insert(option);
        } else {
            opts.remove(option);
        }
        self.options.store(opts.bits(), Ordering::Relaxed);
    }

    pub fn hints(&self) -> crate::plugin::model::CapabilityHints {
        self.model.load().hints
    }

    pub fn audio_in_count(&self) -> usize {
        self.model.load().audio_in.len()
    }

    pub fn audio_out_count(&self) -> usize {
        self.model.load().audio_out.len()
    }

    pub fn has_event_in(&self) -> bool {
        self.model.load().has_event_in
    }

    pub fn has_event_out(&self) -> bool {
        self.model.load().has_event_out
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> u32 {
        lock(&self.engine).latency
    }

    pub fn ui_binary(&self) -> Option<&PathBuf> {
        self.ui_binary.as_ref()
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    pub fn parameter_count(&self) -> usize {
        self.model.load().params.len()
    }

    pub fn parameter(&self, index: usize) -> Option<ParameterSlot> {
        self.model.load().params.get(index).cloned()
    }

    pub fn parameter_name(&self, index: usize) -> Option<String> {
        let raw = self.model.load().params.get(index)?.raw_index;
        Some(self.desc.port(raw).name)
    }

    pub fn parameter_value(&self, index: usize) -> Option<f32> {
        let values = self.values.load();
        (index < values.len()).then(|| values.get(index))
    }

    /// Clamp into the slot's range, store, and return the fixed value.
    pub fn set_parameter_value(&self, index: usize, value: f32) -> anyhow::Result<f32> {
        let model = self.model.load();
        let slot = model
            .params
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("parameter index out of range: {index}"))?;
        let fixed = slot.range.fix(value);
        self.values.load().set(index, fixed);
        Ok(fixed)
    }

    /// Bind (or unbind) a MIDI controller to a parameter slot at runtime.
    pub fn set_parameter_midi_cc(&self, index: usize, cc: Option<u8>) -> anyhow::Result<()> {
        self.update_slot(index, |slot| slot.midi_cc = cc)
    }

    pub fn set_parameter_midi_channel(&self, index: usize, channel: u8) -> anyhow::Result<()> {
        self.update_slot(index, |slot| slot.midi_channel = channel)
    }

    fn update_slot(
        &self,
        index: usize,
        f: impl FnOnce(&mut ParameterSlot),
    ) -> anyhow::Result<()> {
        let model = self.model.load_full();
        anyhow::ensure!(
            index < model.params.len(),
            "parameter index out of range: {index}"
        );
        let mut updated = (*model).clone();
        f(&mut updated.params[index]);
        self.model.store(Arc::new(updated));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Post-processing macros
    // -----------------------------------------------------------------------

    pub fn dry_wet(&self) -> f32 {
        self.dry_wet.load()
    }

    pub fn set_dry_wet(&self, value: f32) {
        self.dry_wet.store(value.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    pub fn set_volume(&self, value: f32) {
        self.volume.store(value.clamp(0.0, 1.27));
    }

    pub fn set_balance_left(&self, value: f32) {
        self.balance_left.store(value.clamp(-1.0, 1.0));
    }

    pub fn set_balance_right(&self, value: f32) {
        self.balance_right.store(value.clamp(-1.0, 1.0));
    }

    pub fn set_ctrl_channel(&self, channel: i8) {
        self.ctrl_channel.store(channel, Ordering::Relaxed);
    }

    /// Offline rendering blocks on the engine lock instead of skipping.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Ask the next block to flush voices (all-notes-off burst) and clear
    /// latency state, e.g. after a transport stop.
    pub fn request_reset(&self) {
        self.needs_reset.store(true, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn activate(&self) {
        let engine = lock(&self.engine);
        if !self.active.swap(true, Ordering::Relaxed) {
            engine.instances.activate(&*self.desc);
        }
    }

    pub fn deactivate(&self) {
        let engine = lock(&self.engine);
        if self.active.swap(false, Ordering::Relaxed) {
            engine.instances.deactivate(&*self.desc);
        }
    }

    // -----------------------------------------------------------------------
    // Reload / reconfigure
    // -----------------------------------------------------------------------

    /// Rebuild the whole port/parameter model from the descriptor.
    ///
    /// Mutually exclusive with the block processor: the engine lock is held
    /// for the duration and the disable flag keeps a concurrently-started
    /// block from touching half-built state.
    pub fn reload(&self) -> anyhow::Result<()> {
        let _master = lock(&self.master);
        self.disabled.store(true, Ordering::Relaxed);
        let result = {
            let mut engine = lock(&self.engine);
            self.reload_locked(&mut engine)
        };
        self.disabled.store(false, Ordering::Relaxed);
        result
    }

    fn reload_locked(&self, engine: &mut Engine) -> anyhow::Result<()> {
        log::debug!("reload() - start ({})", self.name);
        let desc = &*self.desc;
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        let was_active = self.active.load(Ordering::Relaxed);

        if was_active {
            engine.instances.deactivate(desc);
        }

        // Old buffers and bindings go away wholesale; everything below
        // rebuilds them.
        engine.audio_in.clear();
        engine.audio_out.clear();

        let counts = model::count_ports(desc);
        let mut options = self.options();

        if options.contains(Options::FORCE_STEREO)
            && counts.audio_in <= 1
            && counts.audio_out <= 1
            && (counts.audio_in == 1 || counts.audio_out == 1)
        {
            if let Instances::Mono(h) = engine.instances {
                match desc.instantiate(sample_rate) {
                    Some(h2) => engine.instances = Instances::Stereo(h, h2),
                    None => log::warn!(
                        "second instance of '{}' failed, stereo forcing disabled",
                        self.name
                    ),
                }
            }
        }

        let stereo = engine.instances.is_stereo();
        let forced_in = stereo && counts.audio_in == 1;
        let forced_out = stereo && counts.audio_out == 1;
        let audio_ins = if forced_in { 2 } else { counts.audio_in };
        let audio_outs = if forced_out { 2 } else { counts.audio_out };

        if forced_in || forced_out {
            options.insert(Options::FORCE_STEREO);
        } else {
            options.remove(Options::FORCE_STEREO);
        }
        self.options.store(options.bits(), Ordering::Relaxed);

        let midi_in = desc.supports_run_synth() || desc.supports_run_multiple();

        let built = model::build(
            desc,
            engine.instances.primary(),
            sample_rate as f32,
            forced_in,
            forced_out,
        );

        // Parameter storage starts at the defaults; every control port of
        // both instances reads and writes the same float per slot.
        let values = Arc::new(ParamValues::new(&built.defaults));
        for slot in &built.params {
            let ptr = values.ptr(slot.index as usize);
            engine.instances.for_each(|h| {
                // SAFETY: `values` outlives the bindings — the engine holds
                // an Arc to it until the next reload rebinds every port.
                unsafe { desc.connect_port(h, slot.raw_index, ptr) };
            });
        }
        for i in 0..desc.port_count() {
            if desc.port(i).kind == RawPortKind::Other {
                engine.instances.for_each(|h| {
                    // SAFETY: null is the defined "unbound" state for a port
                    // the host cannot classify.
                    unsafe { desc.connect_port(h, i, std::ptr::null_mut()) };
                });
            }
        }

        let hints = model::derive_hints(
            desc,
            midi_in,
            audio_ins,
            audio_outs,
            self.ui_binary.is_some(),
        );

        let new_model = Arc::new(Model {
            audio_in: built.audio_in,
            audio_out: built.audio_out,
            params: built.params,
            hints,
            has_event_in: built.needs_ctrl_in || audio_outs > 0 || midi_in,
            has_event_out: built.needs_ctrl_out,
            forced_stereo_in: forced_in,
            forced_stereo_out: forced_out,
        });

        if hints.can_dry_wet {
            if let Some(latency_idx) = new_model.latency_slot() {
                self.detect_latency(engine, &new_model, &values, latency_idx);
            }
        }

        engine.values = Arc::clone(&values);
        self.values.store(values);
        self.model.store(Arc::clone(&new_model));

        self.apply_buffer_size(engine, &new_model, self.buffer_size.load(Ordering::Relaxed));

        let init = !self.initialized.swap(true, Ordering::Relaxed);
        self.reload_programs_locked(engine, init);

        if was_active {
            engine.instances.activate(desc);
        }

        log::info!(
            "reloaded {}: {} audio in, {} audio out, {} parameter(s), synth={}, stereo-forced={}",
            self.name,
            audio_ins,
            audio_outs,
            new_model.params.len(),
            hints.is_synth,
            stereo,
        );
        Ok(())
    }

    /// Pre-run the primary instance over two silent frames so it publishes
    /// its latency control port, then resize the compensation buffers.
    fn detect_latency(
        &self,
        engine: &mut Engine,
        model: &Model,
        values: &ParamValues,
        latency_idx: usize,
    ) {
        let desc = &*self.desc;
        let h = engine.instances.primary();

        let mut tmp_in: Vec<[f32; 2]> = vec![[0.0; 2]; model.audio_in.len()];
        let mut tmp_out: Vec<[f32; 2]> = vec![[0.0; 2]; model.audio_out.len()];
        for (buf, port) in tmp_in.iter_mut().zip(&model.audio_in) {
            // SAFETY: temp binding, replaced by apply_buffer_size before the
            // buffers drop.
            unsafe { desc.connect_port(h, port.raw_index, buf.as_mut_ptr()) };
        }
        for (buf, port) in tmp_out.iter_mut().zip(&model.audio_out) {
            // SAFETY: as above.
            unsafe { desc.connect_port(h, port.raw_index, buf.as_mut_ptr()) };
        }

        if desc.supports_activation() {
            desc.activate(h);
        }
        desc.run(h, 2);
        if desc.supports_activation() {
            desc.deactivate(h);
        }

        let latency = values.get(latency_idx) as u32;
        if engine.latency != latency {
            log::debug!("latency changed: {} -> {latency}", engine.latency);
            engine.latency = latency;
            engine.latency_bufs = model
                .audio_in
                .iter()
                .map(|_| vec![0.0f32; latency as usize].into_boxed_slice())
                .collect();
        }
    }

    /// Reallocate the private audio buffers and rebind them to the
    /// instance(s). With a stereo split each side's two ports bind to
    /// distinct handles; mono binds everything to the primary.
    fn apply_buffer_size(&self, engine: &mut Engine, model: &Model, frames: u32) {
        let n = frames as usize;
        let desc = &*self.desc;

        engine.audio_in = model
            .audio_in
            .iter()
            .map(|_| vec![0.0f32; n].into_boxed_slice())
            .collect();
        engine.audio_out = model
            .audio_out
            .iter()
            .map(|_| vec![0.0f32; n].into_boxed_slice())
            .collect();
        engine.bal_scratch = vec![0.0f32; n].into_boxed_slice();

        let Engine {
            instances,
            audio_in,
            audio_out,
            ..
        } = engine;

        let bind = |bufs: &mut Vec<Box<[f32]>>, ports: &[model::AudioPort]| {
            match (*instances, bufs.len()) {
                (Instances::Stereo(a, b), 2) => {
                    // SAFETY: the engine owns these buffers until the next
                    // rebind; the plugin only touches them under the engine
                    // lock.
                    unsafe {
                        desc.connect_port(a, ports[0].raw_index, bufs[0].as_mut_ptr());
                        desc.connect_port(b, ports[1].raw_index, bufs[1].as_mut_ptr());
                    }
                }
                (instances, _) => {
                    for (buf, port) in bufs.iter_mut().zip(ports) {
                        // SAFETY: as above.
                        unsafe {
                            desc.connect_port(
                                instances.primary(),
                                port.raw_index,
                                buf.as_mut_ptr(),
                            )
                        };
                    }
                }
            }
        };
        bind(audio_in, &model.audio_in);
        bind(audio_out, &model.audio_out);
    }

    /// Host block budget changed: regrow and rebind the private buffers.
    pub fn set_buffer_size(&self, frames: u32) {
        let _master = lock(&self.master);
        self.buffer_size.store(frames, Ordering::Relaxed);
        let mut engine = lock(&self.engine);
        let model = self.model.load_full();
        self.apply_buffer_size(&mut engine, &model, frames);
    }

    /// Sample rate is baked in at instantiate time, so this is a structural
    /// change: replace the instance(s) and run a full reload.
    pub fn set_sample_rate(&self, rate: u32) -> anyhow::Result<()> {
        let _master = lock(&self.master);
        self.disabled.store(true, Ordering::Relaxed);
        let result = (|| {
            let mut engine = lock(&self.engine);
            let desc = &*self.desc;

            // Keep the old instance(s) alive until the replacement exists so
            // a failed instantiate leaves the adapter in its previous state.
            let handle = desc.instantiate(rate).ok_or_else(|| {
                anyhow::anyhow!(
                    "plugin '{}' failed to re-initialize at {rate} Hz",
                    self.label
                )
            })?;

            let was_active = self.active.swap(false, Ordering::Relaxed);
            if was_active {
                engine.instances.deactivate(desc);
            }
            engine.instances.cleanup(desc);
            engine.instances = Instances::Mono(handle);
            self.sample_rate.store(rate, Ordering::Relaxed);

            self.reload_locked(&mut engine)?;

            if was_active {
                engine.instances.activate(desc);
                self.active.store(true, Ordering::Relaxed);
            }
            Ok(())
        })();
        self.disabled.store(false, Ordering::Relaxed);
        result
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    pub fn program_count(&self) -> usize {
        self.programs.load().len()
    }

    pub fn program_entries(&self) -> Arc<Vec<ProgramEntry>> {
        self.programs.load_full()
    }

    pub fn current_program(&self) -> i32 {
        self.current_program.load(Ordering::Relaxed)
    }

    /// Re-scan the plugin's program list and migrate the selection.
    pub fn reload_programs(&self) {
        let mut engine = lock(&self.engine);
        self.disabled.store(true, Ordering::Relaxed);
        self.reload_programs_locked(&mut engine, false);
        self.disabled.store(false, Ordering::Relaxed);
    }

    fn reload_programs_locked(&self, engine: &mut Engine, init: bool) {
        let old_count = self.programs.load().len();
        let current = self.current_program.load(Ordering::Relaxed);

        let entries = programs::enumerate(&*self.desc, engine.instances.primary());
        let new_count = entries.len();
        self.programs.store(Arc::new(entries));
        log::debug!("program list rebuilt: {old_count} -> {new_count} entries");

        let (selected, changed) = programs::reconcile(init, old_count, current, new_count);
        self.current_program.store(selected, Ordering::Relaxed);

        if changed && selected >= 0 {
            self.select_program_on(engine, selected);
        }
        if changed && !init {
            self.notify(Notification::ProgramChanged(selected));
        }
        if !init {
            self.notify(Notification::ProgramsReloaded);
        }
    }

    fn select_program_on(&self, engine: &mut Engine, index: i32) {
        let desc = &*self.desc;
        if !desc.supports_programs() {
            return;
        }
        let programs = self.programs.load();
        if let Some(entry) = programs.get(index as usize) {
            engine
                .instances
                .for_each(|h| desc.select_program(h, entry.bank, entry.program));
        }
    }

    /// Select a program by table index; -1 deselects. Rejects any index at
    /// or past the table end.
    pub fn set_program(&self, index: i32) -> anyhow::Result<()> {
        let count = self.programs.load().len() as i32;
        anyhow::ensure!(
            (-1..count).contains(&index),
            "program index {index} out of range (count {count})"
        );
        {
            let mut engine = lock(&self.engine);
            if index >= 0 {
                self.select_program_on(&mut engine, index);
            }
        }
        self.current_program.store(index, Ordering::Relaxed);
        self.notify(Notification::ProgramChanged(index));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // External notes and deferred events
    // -----------------------------------------------------------------------

    /// Queue a note from outside the host event stream. `velocity` 0 means
    /// note-off. Dropped when the queue is full.
    pub fn inject_note(&self, channel: u8, note: u8, velocity: u8) {
        let mut notes = lock(&self.ext_notes);
        if notes.len() < EXT_NOTE_CAPACITY {
            notes.push_back(ExternalNote {
                channel,
                note,
                velocity,
            });
        }
    }

    /// Drain audio-thread-originated changes: apply the pending program
    /// switch (which may reallocate plugin-side state, hence never done in
    /// the block path) and forward queued notifications. Call once per
    /// control-thread tick.
    pub fn dispatch_deferred(&self) {
        let pending = self.pending_program.swap(-1, Ordering::Relaxed);
        if pending >= 0 {
            {
                let mut engine = lock(&self.engine);
                self.select_program_on(&mut engine, pending);
            }
            self.current_program.store(pending, Ordering::Relaxed);
            self.notify(Notification::ProgramChanged(pending));
        }

        let mut cons = lock(&self.post_cons);
        events::drain(&mut cons, |ev| {
            let note = match ev {
                DeferredEvent::ParameterChanged { index, value } => {
                    Notification::ParameterChanged { index, value }
                }
                DeferredEvent::DryWetChanged(v) => Notification::DryWetChanged(v),
                DeferredEvent::VolumeChanged(v) => Notification::VolumeChanged(v),
                DeferredEvent::BalanceChanged { left, right } => {
                    Notification::BalanceChanged { left, right }
                }
                DeferredEvent::NoteOn {
                    channel,
                    note,
                    velocity,
                } => Notification::NoteOn {
                    channel,
                    note,
                    velocity,
                },
                DeferredEvent::NoteOff { channel, note } => {
                    Notification::NoteOff { channel, note }
                }
            };
            self.notify(note);
        });
    }

    fn notify(&self, notification: Notification) {
        if let Some(tx) = &self.notifications {
            let _ = tx.try_send(notification);
        }
    }

    // -----------------------------------------------------------------------
    // Custom data and chunks
    // -----------------------------------------------------------------------

    /// Forward a (type, key, value) triple to the plugin's configure entry.
    /// The program-affecting keys trigger a program re-scan.
    pub fn set_custom_data(&self, dtype: &str, key: &str, value: &str) {
        if dtype != "string" {
            log::error!("set_custom_data({dtype:?}, {key:?}, ...): type is not \"string\"");
            return;
        }

        let mut engine = lock(&self.engine);
        let desc = &*self.desc;
        if desc.supports_configure() {
            engine.instances.for_each(|h| desc.configure(h, key, value));
        }

        if key == "reloadprograms" || key == "load" || key.starts_with("patches") {
            self.disabled.store(true, Ordering::Relaxed);
            self.reload_programs_locked(&mut engine, false);
            self.disabled.store(false, Ordering::Relaxed);
        }
    }

    /// Opaque full-state blob, when the plugin supports chunked state.
    pub fn chunk(&self) -> Option<Vec<u8>> {
        if !self.options().contains(Options::USE_CHUNKS) {
            return None;
        }
        let engine = lock(&self.engine);
        self.desc.chunk(engine.instances.primary())
    }

    pub fn chunk_base64(&self) -> Option<String> {
        self.chunk().map(|data| BASE64.encode(data))
    }

    pub fn set_chunk(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let engine = lock(&self.engine);
        if !self.desc.set_chunk(engine.instances.primary(), data) {
            log::warn!("plugin '{}' rejected a {} byte chunk", self.name, data.len());
        }
    }

    pub fn set_chunk_base64(&self, text: &str) -> anyhow::Result<()> {
        let data = BASE64.decode(text.trim().as_bytes())?;
        anyhow::ensure!(!data.is_empty(), "empty chunk");
        self.set_chunk(&data);
        Ok(())
    }
}

impl Drop for DssiPlugin {
    fn drop(&mut self) {
        let _master = lock(&self.master);
        let engine = lock(&self.engine);
        if self.active.swap(false, Ordering::Relaxed) {
            engine.instances.deactivate(&*self.desc);
        }
        engine.instances.cleanup(&*self.desc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::descriptor::{ProgramInfo, RangeHint};
    use crate::plugin::model::ParameterKind;
    use crate::plugin::testing::{
        audio_in, audio_out, control_in, control_out, MockDescriptor,
    };

    fn adapter(desc: MockDescriptor) -> (Arc<MockDescriptor>, DssiPlugin) {
        adapter_with(desc, HostConfig::default())
    }

    fn adapter_with(desc: MockDescriptor, config: HostConfig) -> (Arc<MockDescriptor>, DssiPlugin) {
        let desc = Arc::new(desc);
        let registry = ExclusiveRegistry::new();
        let shared: Arc<dyn SynthDescriptor> = desc.clone();
        let plugin = DssiPlugin::new(shared, &registry, config).unwrap();
        (desc, plugin)
    }

    fn range_hint(min: f32, max: f32) -> RangeHint {
        RangeHint {
            bounded_below: true,
            bounded_above: true,
            lower: min,
            upper: max,
            ..RangeHint::default()
        }
    }

    #[test]
    fn construction_fails_when_instantiate_fails() {
        let mut desc = MockDescriptor::synth(vec![audio_out("out")]);
        desc.max_instances = Some(0);
        let registry = ExclusiveRegistry::new();
        let err = DssiPlugin::new(Arc::new(desc), &registry, HostConfig::default()).unwrap_err();
        assert!(err.to_string().contains("failed to initialize"));
    }

    #[test]
    fn multi_only_plugins_are_exclusive_per_label() {
        let registry = ExclusiveRegistry::new();
        let first = DssiPlugin::new(
            Arc::new(MockDescriptor::multi_only(vec![audio_out("out")])),
            &registry,
            HostConfig::default(),
        )
        .unwrap();

        let err = DssiPlugin::new(
            Arc::new(MockDescriptor::multi_only(vec![audio_out("out")])),
            &registry,
            HostConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));

        // The permit returns with the first adapter.
        drop(first);
        DssiPlugin::new(
            Arc::new(MockDescriptor::multi_only(vec![audio_out("out")])),
            &registry,
            HostConfig::default(),
        )
        .unwrap();
    }

    #[test]
    fn reload_is_idempotent() {
        let (_, plugin) = adapter(MockDescriptor::synth(vec![
            audio_out("out"),
            control_in("attack", range_hint(0.0, 4.0)),
            control_in("cutoff", range_hint(20.0, 20_000.0)),
            control_out("meter", RangeHint::default()),
        ]));

        let snapshot = |p: &DssiPlugin| {
            let model = p.model.load_full();
            let values = p.values.load_full();
            (
                model.audio_in.len(),
                model.audio_out.len(),
                model
                    .params
                    .iter()
                    .map(|s| (s.raw_index, s.kind, s.range.min.to_bits(), s.range.max.to_bits()))
                    .collect::<Vec<_>>(),
                (0..values.len()).map(|i| values.get(i).to_bits()).collect::<Vec<_>>(),
            )
        };

        let before = snapshot(&plugin);
        plugin.reload().unwrap();
        assert_eq!(snapshot(&plugin), before);
    }

    #[test]
    fn forced_stereo_splits_into_two_instances_with_shared_parameters() {
        let config = HostConfig {
            options: Options::FORCE_STEREO,
            ..HostConfig::default()
        };
        let (desc, plugin) = adapter_with(
            MockDescriptor::effect(vec![
                audio_in("in"),
                audio_out("out"),
                control_in("gain", range_hint(0.0, 2.0)),
            ]),
            config,
        );

        assert_eq!(desc.live_instances(), 2);
        assert_eq!(plugin.audio_in_count(), 2);
        assert_eq!(plugin.audio_out_count(), 2);
        assert!(plugin.options().contains(Options::FORCE_STEREO));

        let model = plugin.model.load_full();
        assert!(model.forced_stereo_in && model.forced_stereo_out);

        // Control storage is shared; each side's audio ports bind to a
        // distinct instance.
        assert_eq!(desc.connection_of(0, 2), desc.connection_of(1, 2));
        assert!(!desc.connection_of(0, 0).is_null());
        assert!(!desc.connection_of(1, 0).is_null());
        assert_ne!(desc.connection_of(0, 0), desc.connection_of(1, 0));
        assert_ne!(desc.connection_of(0, 1), desc.connection_of(1, 1));
    }

    #[test]
    fn failed_second_instantiate_silently_disables_stereo() {
        let mut desc = MockDescriptor::effect(vec![audio_in("in"), audio_out("out")]);
        desc.max_instances = Some(1);
        let config = HostConfig {
            options: Options::FORCE_STEREO,
            ..HostConfig::default()
        };
        let (desc, plugin) = adapter_with(desc, config);

        assert_eq!(desc.live_instances(), 1);
        assert_eq!(plugin.audio_in_count(), 1);
        assert!(!plugin.options().contains(Options::FORCE_STEREO));
    }

    #[test]
    fn event_port_rules() {
        // Synth with no control inputs still gets an event-in port.
        let (_, synth) = adapter(MockDescriptor::synth(vec![audio_out("out")]));
        assert!(synth.has_event_in());
        assert!(!synth.has_event_out());

        // Pure sink: no audio out, no automatable input, not a synth.
        let (_, sink) = adapter(MockDescriptor::effect(vec![audio_in("in")]));
        assert!(!sink.has_event_in());

        // Output parameter creates the event-out port.
        let (_, meter) = adapter(MockDescriptor::effect(vec![
            audio_in("in"),
            control_out("level", RangeHint::default()),
        ]));
        assert!(meter.has_event_out());
    }

    #[test]
    fn end_to_end_synthetic_effect_reload() {
        let (_, plugin) = adapter(MockDescriptor::effect(vec![
            audio_in("in"),
            audio_out("out"),
            control_in("drive", range_hint(0.0, 10.0)),
            control_out("meter", RangeHint::default()),
        ]));

        assert_eq!(plugin.audio_in_count(), 1);
        assert_eq!(plugin.audio_out_count(), 1);
        assert_eq!(plugin.parameter_count(), 2);

        let drive = plugin.parameter(0).unwrap();
        assert_eq!(drive.kind, ParameterKind::Input);
        assert!(drive.range.def >= drive.range.min && drive.range.def <= drive.range.max);

        let hints = plugin.hints();
        assert!(!hints.is_synth);
        assert!(hints.can_dry_wet);
        assert!(hints.can_volume);
        assert!(!hints.can_balance);

        // Audio output present, so the event-in port exists for automation
        // and metering even though the plugin is not a synth.
        assert!(plugin.has_event_in());
        assert!(plugin.has_event_out());
    }

    #[test]
    fn options_are_gated_by_capabilities() {
        // Effects have no synth entry: send flags are masked away.
        let config = HostConfig {
            options: Options::SEND_PITCHBEND | Options::SEND_CONTROL_CHANGES,
            ..HostConfig::default()
        };
        let (_, effect) = adapter_with(
            MockDescriptor::effect(vec![audio_in("in"), audio_out("out")]),
            config,
        );
        assert!(!effect.options().contains(Options::SEND_PITCHBEND));
        assert!(effect.options().contains(Options::MAP_PROGRAM_CHANGES));

        // Synths default to the full send set.
        let (_, synth) = adapter(MockDescriptor::synth(vec![audio_out("out")]));
        assert!(synth.options().contains(Options::SEND_PITCHBEND));
        assert!(synth.options().contains(Options::SEND_ALL_SOUND_OFF));

        // Fixed-buffer plugins cannot drop FIXED_BUFFER.
        let mut desc = MockDescriptor::synth(vec![audio_out("out")]);
        desc.fixed_buffers = true;
        let (_, fixed) = adapter(desc);
        assert!(fixed.options().contains(Options::FIXED_BUFFER));
        fixed.set_option(Options::FIXED_BUFFER, false);
        assert!(fixed.options().contains(Options::FIXED_BUFFER));

        // Unavailable options are refused at runtime too.
        let (_, effect) = adapter(MockDescriptor::effect(vec![audio_in("in"), audio_out("out")]));
        effect.set_option(Options::SEND_PITCHBEND, true);
        assert!(!effect.options().contains(Options::SEND_PITCHBEND));
        effect.set_option(Options::SEND_ALL_SOUND_OFF, true);
        assert!(!effect.options().contains(Options::SEND_ALL_SOUND_OFF));
    }

    #[test]
    fn latency_is_read_back_from_a_silent_prerun() {
        let mut desc = MockDescriptor::effect(vec![
            audio_in("in"),
            audio_out("out"),
            control_out("latency", RangeHint::default()),
        ]);
        desc.latency_report = Some(64.0);
        let (_, plugin) = adapter(desc);
        assert_eq!(plugin.latency(), 64);
        // The latency slot is tracked but not automatable.
        let slot = plugin.parameter(0).unwrap();
        assert_eq!(slot.kind, ParameterKind::Latency);
        assert!(!slot.hints.automable);
    }

    #[test]
    fn program_rescan_keys_trigger_reload() {
        let (desc, plugin) = adapter(MockDescriptor::synth(vec![audio_out("out")]));
        assert_eq!(plugin.program_count(), 0);
        assert_eq!(plugin.current_program(), -1);

        desc.set_programs(vec![
            ProgramInfo { bank: 0, program: 0, name: "Init".into() },
            ProgramInfo { bank: 0, program: 3, name: "Keys".into() },
        ]);
        plugin.set_custom_data("string", "reloadprograms", "1");

        assert_eq!(plugin.program_count(), 2);
        // Programs appeared where there were none: first entry selected.
        assert_eq!(plugin.current_program(), 0);
        assert_eq!(lock(&desc.select_log).last(), Some(&(0, 0, 0)));
        assert_eq!(
            lock(&desc.configure_log).as_slice(),
            &[("reloadprograms".to_string(), "1".to_string())]
        );

        // Unrelated keys only configure.
        plugin.set_custom_data("string", "colour", "blue");
        assert_eq!(lock(&desc.configure_log).len(), 2);
        assert_eq!(plugin.program_count(), 2);

        // Non-string types are rejected outright.
        plugin.set_custom_data("chunk", "reloadprograms", "1");
        assert_eq!(lock(&desc.configure_log).len(), 2);
    }

    #[test]
    fn set_program_rejects_out_of_range_indices() {
        let (desc, plugin) = adapter(MockDescriptor::synth(vec![audio_out("out")]));
        desc.set_programs(vec![
            ProgramInfo { bank: 0, program: 0, name: "A".into() },
            ProgramInfo { bank: 1, program: 2, name: "B".into() },
        ]);
        plugin.reload_programs();

        assert!(plugin.set_program(2).is_err());
        assert!(plugin.set_program(-2).is_err());

        plugin.set_program(1).unwrap();
        assert_eq!(plugin.current_program(), 1);
        assert_eq!(lock(&desc.select_log).last(), Some(&(0, 1, 2)));

        plugin.set_program(-1).unwrap();
        assert_eq!(plugin.current_program(), -1);
    }

    #[test]
    fn selection_survives_a_plain_reload() {
        let (desc, plugin) = adapter(MockDescriptor::synth(vec![audio_out("out")]));
        desc.set_programs(vec![
            ProgramInfo { bank: 0, program: 0, name: "A".into() },
            ProgramInfo { bank: 0, program: 1, name: "B".into() },
            ProgramInfo { bank: 0, program: 2, name: "C".into() },
        ]);
        plugin.reload_programs();
        plugin.set_program(1).unwrap();

        plugin.reload().unwrap();
        assert_eq!(plugin.current_program(), 1);
    }

    #[test]
    fn sample_rate_change_reinstantiates() {
        let (desc, plugin) = adapter(MockDescriptor::synth(vec![
            audio_out("out"),
            control_in("cutoff", range_hint(0.0, 1.0)),
        ]));
        assert_eq!(desc.live_instances(), 1);

        plugin.activate();
        plugin.set_sample_rate(96_000).unwrap();

        assert_eq!(desc.live_instances(), 1);
        assert!(plugin.is_active());
        assert_eq!(plugin.parameter_count(), 1);
    }

    #[test]
    fn activation_reaches_every_instance() {
        let config = HostConfig {
            options: Options::FORCE_STEREO,
            ..HostConfig::default()
        };
        let (desc, plugin) = adapter_with(
            MockDescriptor::effect(vec![audio_in("in"), audio_out("out")]),
            config,
        );
        assert!(!desc.instance_active(0));

        plugin.activate();
        assert!(plugin.is_active());
        assert!(desc.instance_active(0));
        assert!(desc.instance_active(1));

        plugin.deactivate();
        assert!(!desc.instance_active(0));
        assert!(!desc.instance_active(1));
    }

    #[test]
    fn chunks_round_trip_through_base64() {
        let mut desc = MockDescriptor::synth(vec![audio_out("out")]);
        desc.chunks = true;
        let config = HostConfig {
            options: Options::USE_CHUNKS,
            ..HostConfig::default()
        };
        let (desc, plugin) = adapter_with(desc, config);
        assert!(plugin.options().contains(Options::USE_CHUNKS));

        plugin.set_chunk(&[1, 2, 3, 250]);
        assert_eq!(plugin.chunk().as_deref(), Some(&[1, 2, 3, 250][..]));

        let encoded = plugin.chunk_base64().unwrap();
        plugin.set_chunk(&[9]);
        plugin.set_chunk_base64(&encoded).unwrap();
        assert_eq!(lock(&desc.chunk_data).as_slice(), &[1, 2, 3, 250]);

        assert!(plugin.set_chunk_base64("").is_err());
    }

    #[test]
    fn parameter_values_clamp_into_range() {
        let (_, plugin) = adapter(MockDescriptor::effect(vec![
            audio_in("in"),
            audio_out("out"),
            control_in("gain", range_hint(0.0, 2.0)),
        ]));

        assert_eq!(plugin.set_parameter_value(0, 5.0).unwrap(), 2.0);
        assert_eq!(plugin.parameter_value(0), Some(2.0));
        assert!(plugin.set_parameter_value(7, 0.0).is_err());

        plugin.set_parameter_midi_cc(0, Some(0x10)).unwrap();
        assert_eq!(plugin.parameter(0).unwrap().midi_cc, Some(0x10));
    }
}
