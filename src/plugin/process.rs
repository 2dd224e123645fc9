//! The real-time block processor.
//!
//! `process` is called once per audio block from the host's audio thread.
//! It must never block (the engine lock is only *tried*, except in offline
//! mode) and never allocates: native events accumulate in the caller-owned
//! scratch buffer, deferred notifications go through the pre-sized ring, and
//! every degraded path resolves to silence rather than an error.

use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use crate::plugin::adapter::{lock, DssiPlugin, Engine};
use crate::plugin::events::{
    CtrlEvent, DeferredEvent, HostEvent, HostEventKind, HostEventQueue, NativeEvent,
    NativeEventBuffer, MAX_MIDI_CHANNELS, MAX_MIDI_NOTE, MAX_NATIVE_EVENTS, MIDI_CC_ALL_NOTES_OFF,
    MIDI_CC_ALL_SOUND_OFF, MIDI_CC_BALANCE, MIDI_CC_BREATH, MIDI_CC_VOLUME,
};
use crate::plugin::model::{Model, ParameterKind};
use crate::plugin::Options;

/// Outcome of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Every sub-block ran.
    Ran,
    /// At least one sub-block lost the engine lock and was silenced.
    Skipped,
    /// Adapter inactive or mid-reconfiguration; outputs zeroed.
    Inactive,
}

/// Result of asking for the engine without stalling the audio thread.
pub(crate) enum BlockAccess<'a> {
    Acquired(MutexGuard<'a, Engine>),
    Contended,
}

impl DssiPlugin {
    fn block_access(&self) -> BlockAccess<'_> {
        if self.offline.load(Ordering::Relaxed) {
            // Offline rendering has no deadline; wait for the lock.
            BlockAccess::Acquired(lock(&self.engine))
        } else {
            match self.engine.try_lock() {
                Ok(guard) => BlockAccess::Acquired(guard),
                Err(_) => BlockAccess::Contended,
            }
        }
    }

    fn post_deferred(&self, event: DeferredEvent) {
        // The ring itself is SPSC; the try-lock only enforces the
        // single-producer side and never blocks the audio thread.
        if let Ok(mut prod) = self.post_prod.try_lock() {
            crate::plugin::events::post(&mut prod, event);
        }
    }

    /// Process one block.
    ///
    /// `audio_in`/`audio_out` carry one span per declared audio port, each
    /// at least `frames` long. `events_in` is the host's time-ordered event
    /// list for this block; control outputs are appended to `events_out`.
    /// `scratch` is the caller-owned native event accumulator.
    pub fn process(
        &self,
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        frames: u32,
        events_in: &[HostEvent],
        events_out: &mut HostEventQueue,
        scratch: &mut NativeEventBuffer,
    ) -> ProcessStatus {
        if !self.active.load(Ordering::Relaxed) || self.disabled.load(Ordering::Relaxed) {
            for ch in audio_out.iter_mut() {
                ch.fill(0.0);
            }
            return ProcessStatus::Inactive;
        }

        let model = self.model.load();
        let values = self.values.load();
        let opts = self.options();
        let ctrl_channel = self.ctrl_channel.load(Ordering::Relaxed);

        scratch.clear();

        // -------------------------------------------------------------------
        // Reset burst (transport stop, panic)

        if self.needs_reset.swap(false, Ordering::Relaxed) {
            if opts.contains(Options::SEND_ALL_SOUND_OFF) {
                for ch in 0..MAX_MIDI_CHANNELS {
                    scratch.push(NativeEvent::controller(0, ch, MIDI_CC_ALL_NOTES_OFF, 0));
                    scratch.push(NativeEvent::controller(0, ch, MIDI_CC_ALL_SOUND_OFF, 0));
                }
            } else if (0..MAX_MIDI_CHANNELS as i8).contains(&ctrl_channel) {
                for note in 0..MAX_MIDI_NOTE {
                    scratch.push(NativeEvent::note_off(0, ctrl_channel as u8, note));
                }
            }

            if let Ok(mut engine) = self.engine.try_lock() {
                if engine.latency > 0 {
                    for buf in engine.latency_bufs.iter_mut() {
                        buf.fill(0.0);
                    }
                }
            }
        }

        let mut skipped = false;

        if model.has_event_in {
            // ---------------------------------------------------------------
            // Externally-injected notes (tried, never awaited)

            if let Ok(mut notes) = self.ext_notes.try_lock() {
                while scratch.len() < MAX_NATIVE_EVENTS {
                    let Some(n) = notes.pop_front() else { break };
                    let ev = if n.velocity > 0 {
                        NativeEvent::note_on(0, n.channel, n.note, n.velocity)
                    } else {
                        NativeEvent::note_off(0, n.channel, n.note)
                    };
                    scratch.push(ev);
                }
            }

            // ---------------------------------------------------------------
            // Host event loop with sample-accurate splitting

            let sample_accurate = !opts.contains(Options::FIXED_BUFFER);
            let programs = self.programs.load();
            let current = self.current_program.load(Ordering::Relaxed);
            let mut next_bank: u32 = if current >= 0 {
                programs.get(current as usize).map(|p| p.bank).unwrap_or(0)
            } else {
                0
            };

            let mut time_offset: u32 = 0;
            let mut start_time: u32 = 0;

            for event in events_in {
                let time = event.time;
                if time >= frames {
                    continue;
                }

                if time > time_offset && sample_accurate {
                    if self.run_sub_block(
                        audio_in,
                        audio_out,
                        time - time_offset,
                        time_offset,
                        scratch,
                        &model,
                    ) {
                        start_time = 0;
                        time_offset = time;
                        scratch.clear();
                    } else {
                        skipped = true;
                        start_time += time_offset;
                    }
                }

                let tick = if sample_accurate { start_time } else { time };

                match event.kind {
                    HostEventKind::Control(ctrl) => match ctrl {
                        CtrlEvent::Parameter { param, value } => {
                            // Backend macros listen on the control channel.
                            if event.channel as i8 == ctrl_channel {
                                if param == MIDI_CC_BREATH as u16 && model.hints.can_dry_wet {
                                    self.set_dry_wet(value);
                                    self.post_deferred(DeferredEvent::DryWetChanged(
                                        self.dry_wet.load(),
                                    ));
                                }
                                if param == MIDI_CC_VOLUME as u16 && model.hints.can_volume {
                                    self.set_volume(value * 127.0 / 100.0);
                                    self.post_deferred(DeferredEvent::VolumeChanged(
                                        self.volume.load(),
                                    ));
                                }
                                if param == MIDI_CC_BALANCE as u16 && model.hints.can_balance {
                                    let centred = value / 0.5 - 1.0;
                                    let (left, right) = if centred < 0.0 {
                                        (-1.0, centred * 2.0 + 1.0)
                                    } else if centred > 0.0 {
                                        (centred * 2.0 - 1.0, 1.0)
                                    } else {
                                        (-1.0, 1.0)
                                    };
                                    self.set_balance_left(left);
                                    self.set_balance_right(right);
                                    self.post_deferred(DeferredEvent::BalanceChanged {
                                        left,
                                        right,
                                    });
                                }
                            }

                            // Bound automatable parameters.
                            for (k, slot) in model.params.iter().enumerate() {
                                if slot.midi_channel != event.channel
                                    || slot.midi_cc.map(u16::from) != Some(param)
                                    || slot.kind != ParameterKind::Input
                                    || !slot.hints.automable
                                {
                                    continue;
                                }
                                let raw = if slot.hints.boolean {
                                    if value < 0.5 {
                                        slot.range.min
                                    } else {
                                        slot.range.max
                                    }
                                } else {
                                    let v = slot.range.unnormalized(value);
                                    if slot.hints.integer {
                                        v.round()
                                    } else {
                                        v
                                    }
                                };
                                let fixed = slot.range.fix(raw);
                                values.set(k, fixed);
                                self.post_deferred(DeferredEvent::ParameterChanged {
                                    index: k as u32,
                                    value: fixed,
                                });
                            }

                            // Only the native format's legal controller range
                            // is forwarded.
                            if opts.contains(Options::SEND_CONTROL_CHANGES) && param <= 0x5F {
                                scratch.push(NativeEvent::controller(
                                    tick,
                                    event.channel,
                                    param as u8,
                                    (value * 127.0) as i32,
                                ));
                            }
                        }
                        CtrlEvent::MidiBank(bank) => {
                            if event.channel as i8 == ctrl_channel
                                && opts.contains(Options::MAP_PROGRAM_CHANGES)
                            {
                                next_bank = bank as u32;
                            }
                        }
                        CtrlEvent::MidiProgram(program) => {
                            if event.channel as i8 == ctrl_channel
                                && opts.contains(Options::MAP_PROGRAM_CHANGES)
                            {
                                // Deferred: switching may reallocate, so the
                                // control thread applies it.
                                if let Some(k) = programs.iter().position(|p| {
                                    p.bank == next_bank && p.program == program as u32
                                }) {
                                    self.pending_program.store(k as i32, Ordering::Relaxed);
                                }
                            }
                        }
                        CtrlEvent::AllSoundOff => {
                            if opts.contains(Options::SEND_ALL_SOUND_OFF) {
                                scratch.push(NativeEvent::controller(
                                    tick,
                                    event.channel,
                                    MIDI_CC_ALL_SOUND_OFF,
                                    0,
                                ));
                            }
                        }
                        CtrlEvent::AllNotesOff => {
                            if opts.contains(Options::SEND_ALL_SOUND_OFF) {
                                scratch.push(NativeEvent::controller(
                                    tick,
                                    event.channel,
                                    MIDI_CC_ALL_NOTES_OFF,
                                    0,
                                ));
                            }
                        }
                    },
                    HostEventKind::Midi { size: _, data } => {
                        let mut status = data[0] & 0xF0;
                        let channel = event.channel;

                        // A note-on with zero velocity is a note-off.
                        if status == 0x90 && data[2] == 0 {
                            status = 0x80;
                        }

                        match status {
                            0x80 => {
                                let note = data[1];
                                scratch.push(NativeEvent::note_off(tick, channel, note));
                                self.post_deferred(DeferredEvent::NoteOff { channel, note });
                            }
                            0x90 => {
                                let note = data[1];
                                let velocity = data[2];
                                scratch.push(NativeEvent::note_on(tick, channel, note, velocity));
                                self.post_deferred(DeferredEvent::NoteOn {
                                    channel,
                                    note,
                                    velocity,
                                });
                            }
                            0xA0 if opts.contains(Options::SEND_NOTE_AFTERTOUCH) => {
                                scratch.push(NativeEvent::key_pressure(
                                    tick, channel, data[1], data[2],
                                ));
                            }
                            0xB0 if opts.contains(Options::SEND_CONTROL_CHANGES) => {
                                scratch.push(NativeEvent::controller(
                                    tick,
                                    channel,
                                    data[1],
                                    data[2] as i32,
                                ));
                            }
                            0xD0 if opts.contains(Options::SEND_CHANNEL_PRESSURE) => {
                                scratch.push(NativeEvent::channel_pressure(tick, channel, data[1]));
                            }
                            0xE0 if opts.contains(Options::SEND_PITCHBEND) => {
                                let bend =
                                    (((data[2] as i32) << 7) | data[1] as i32) - 8192;
                                scratch.push(NativeEvent::pitch_bend(tick, channel, bend));
                            }
                            // Capability flag off, or unsupported status:
                            // dropped, not deferred.
                            _ => {}
                        }
                    }
                }
            }

            // Trailing frames past the last event.
            if frames > time_offset
                && !self.run_sub_block(
                    audio_in,
                    audio_out,
                    frames - time_offset,
                    time_offset,
                    scratch,
                    &model,
                )
            {
                skipped = true;
            }
        } else {
            // No event port: the whole block is one sub-block. The scratch
            // buffer still carries a reset burst when one was synthesized.
            if !self.run_sub_block(audio_in, audio_out, frames, 0, scratch, &model) {
                skipped = true;
            }
        }

        // -------------------------------------------------------------------
        // Control output

        if model.has_event_out {
            for (k, slot) in model.params.iter().enumerate() {
                if slot.kind != ParameterKind::Output {
                    continue;
                }
                let fixed = slot.range.fix(values.get(k));
                values.set(k, fixed);
                if let Some(cc) = slot.midi_cc {
                    if cc > 0 {
                        events_out.push(HostEvent {
                            time: 0,
                            channel: slot.midi_channel,
                            kind: HostEventKind::Control(CtrlEvent::Parameter {
                                param: cc as u16,
                                value: slot.range.normalized(fixed),
                            }),
                        });
                    }
                }
            }
        }

        if skipped {
            ProcessStatus::Skipped
        } else {
            ProcessStatus::Ran
        }
    }

    /// Run the plugin over one contiguous frame range.
    ///
    /// Returns false without running when the engine lock is contended (the
    /// affected output region is zeroed) or when `frames` is zero.
    fn run_sub_block(
        &self,
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        frames: u32,
        offset: u32,
        scratch: &mut NativeEventBuffer,
        model: &Model,
    ) -> bool {
        if frames == 0 {
            return false;
        }
        let n = frames as usize;
        let off = offset as usize;

        let mut guard = match self.block_access() {
            BlockAccess::Acquired(guard) => guard,
            BlockAccess::Contended => {
                for ch in audio_out.iter_mut() {
                    ch[off..off + n].fill(0.0);
                }
                return false;
            }
        };
        let engine = &mut *guard;

        // Private copies: stereo splitting and post-processing mutate them.
        for (i, buf) in engine.audio_in.iter_mut().enumerate() {
            match audio_in.get(i) {
                Some(src) if src.len() >= off + n => buf[..n].copy_from_slice(&src[off..off + n]),
                _ => buf[..n].fill(0.0),
            }
        }
        for buf in engine.audio_out.iter_mut() {
            buf[..n].fill(0.0);
        }

        let desc = &*self.desc;
        let events = scratch.as_mut_slice();
        if desc.supports_run_synth() {
            desc.run_synth(engine.instances.primary(), frames, events);
            if let Some(second) = engine.instances.secondary() {
                desc.run_synth(second, frames, events);
            }
        } else if desc.supports_run_multiple() {
            let (handles, count) = engine.instances.raw();
            desc.run_multiple(&handles[..count], frames, events);
        } else {
            engine.instances.for_each(|h| desc.run(h, frames));
        }

        // -------------------------------------------------------------------
        // Post-processing (dry/wet, balance, volume)

        let dry_wet = self.dry_wet.load();
        let volume = self.volume.load();
        let bal_left = self.balance_left.load();
        let bal_right = self.balance_right.load();
        let do_dry_wet = model.hints.can_dry_wet && dry_wet != 1.0;
        let do_balance = model.hints.can_balance && (bal_left != -1.0 || bal_right != 1.0);

        let Engine {
            audio_in: priv_in,
            audio_out: priv_out,
            bal_scratch,
            ..
        } = engine;
        let in_count = priv_in.len();
        let out_count = priv_out.len();

        for i in 0..out_count {
            if do_dry_wet {
                let src = if in_count == 1 { 0 } else { i };
                if src < in_count {
                    // TODO: take the dry signal from latency_bufs so the
                    // blend lines up when the plugin reports latency.
                    for k in 0..n {
                        let dry = priv_in[src][k];
                        priv_out[i][k] = priv_out[i][k] * dry_wet + dry * (1.0 - dry_wet);
                    }
                }
            }

            if do_balance {
                let is_pair = i % 2 == 0;
                if is_pair {
                    bal_scratch[..n].copy_from_slice(&priv_out[i][..n]);
                }
                let range_l = (bal_left + 1.0) / 2.0;
                let range_r = (bal_right + 1.0) / 2.0;
                for k in 0..n {
                    if is_pair {
                        let right = if i + 1 < out_count { priv_out[i + 1][k] } else { 0.0 };
                        priv_out[i][k] =
                            bal_scratch[k] * (1.0 - range_l) + right * (1.0 - range_r);
                    } else {
                        let v = priv_out[i][k];
                        priv_out[i][k] = v * range_r + bal_scratch[k] * range_l;
                    }
                }
            }

            if let Some(out) = audio_out.get_mut(i) {
                for k in 0..n {
                    out[off + k] = priv_out[i][k] * volume;
                }
            }
        }

        true
    }
}
