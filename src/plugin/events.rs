//! Event types crossing the adapter's boundaries.
//!
//! Two representations meet here: the host's unified event stream
//! ([`HostEvent`]) and the plugin's native ALSA-sequencer events
//! ([`NativeEvent`], whose layout the plugin ABI dictates). Both sides use
//! fixed-capacity buffers so the audio path never allocates; a full buffer
//! drops further events instead of growing.

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

pub const MAX_MIDI_CHANNELS: u8 = 16;
pub const MAX_MIDI_NOTE: u8 = 128;

/// Capacity of the per-block native event buffer.
pub const MAX_NATIVE_EVENTS: usize = 512;

/// Controller numbers the adapter treats specially.
pub const MIDI_CC_BANK_SELECT: u8 = 0x00;
pub const MIDI_CC_BREATH: u8 = 0x02;
pub const MIDI_CC_VOLUME: u8 = 0x07;
pub const MIDI_CC_BALANCE: u8 = 0x08;
pub const MIDI_CC_ALL_SOUND_OFF: u8 = 0x78;
pub const MIDI_CC_ALL_NOTES_OFF: u8 = 0x7B;

// ---------------------------------------------------------------------------
// Host unified events
// ---------------------------------------------------------------------------

/// Control-class event payload in the host's unified stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CtrlEvent {
    /// Continuous controller, `value` normalized to 0..=1.
    Parameter { param: u16, value: f32 },
    MidiBank(u16),
    MidiProgram(u16),
    AllSoundOff,
    AllNotesOff,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HostEventKind {
    Control(CtrlEvent),
    Midi { size: u8, data: [u8; 3] },
}

/// One event of the host's time-ordered, block-local stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostEvent {
    /// Frame offset inside the current block.
    pub time: u32,
    pub channel: u8,
    pub kind: HostEventKind,
}

/// Pre-allocated host event list. `push` drops events once the configured
/// capacity is reached, so it is safe to fill from the audio path.
pub struct HostEventQueue {
    events: Vec<HostEvent>,
    capacity: usize,
}

impl HostEventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        HostEventQueue {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: HostEvent) -> bool {
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[HostEvent] {
        &self.events
    }
}

// ---------------------------------------------------------------------------
// Native (ALSA sequencer) events
// ---------------------------------------------------------------------------

/// Native event type codes (ALSA sequencer numbering, fixed by the ABI).
pub mod seq {
    pub const NOTE_ON: u8 = 6;
    pub const NOTE_OFF: u8 = 7;
    pub const KEY_PRESSURE: u8 = 8;
    pub const CONTROLLER: u8 = 10;
    pub const CHANNEL_PRESSURE: u8 = 12;
    pub const PITCH_BEND: u8 = 13;
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SeqRealTime {
    pub sec: u32,
    pub nsec: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SeqTime {
    pub tick: u32,
    pub time: SeqRealTime,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SeqAddr {
    pub client: u8,
    pub port: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SeqNote {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
    pub off_velocity: u8,
    pub duration: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SeqCtrl {
    pub channel: u8,
    pub unused: [u8; 3],
    pub param: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SeqData {
    pub note: SeqNote,
    pub control: SeqCtrl,
    pub raw8: [u8; 12],
}

/// One native event, laid out exactly as the plugin's run entry expects.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeEvent {
    pub r#type: u8,
    pub flags: u8,
    pub tag: u8,
    pub queue: u8,
    pub time: SeqTime,
    pub source: SeqAddr,
    pub dest: SeqAddr,
    pub data: SeqData,
}

impl NativeEvent {
    pub fn zeroed() -> Self {
        // SAFETY: all fields are plain-old-data; the all-zero pattern is a
        // valid (null) event.
        unsafe { std::mem::zeroed() }
    }

    pub fn note_on(tick: u32, channel: u8, note: u8, velocity: u8) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::NOTE_ON;
        ev.time.tick = tick;
        ev.data.note = SeqNote {
            channel,
            note,
            velocity,
            off_velocity: 0,
            duration: 0,
        };
        ev
    }

    pub fn note_off(tick: u32, channel: u8, note: u8) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::NOTE_OFF;
        ev.time.tick = tick;
        ev.data.note = SeqNote {
            channel,
            note,
            velocity: 0,
            off_velocity: 0,
            duration: 0,
        };
        ev
    }

    pub fn key_pressure(tick: u32, channel: u8, note: u8, pressure: u8) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::KEY_PRESSURE;
        ev.time.tick = tick;
        ev.data.note = SeqNote {
            channel,
            note,
            velocity: pressure,
            off_velocity: 0,
            duration: 0,
        };
        ev
    }

    pub fn controller(tick: u32, channel: u8, param: u8, value: i32) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::CONTROLLER;
        ev.time.tick = tick;
        ev.data.control = SeqCtrl {
            channel,
            unused: [0; 3],
            param: param as u32,
            value,
        };
        ev
    }

    pub fn channel_pressure(tick: u32, channel: u8, pressure: u8) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::CHANNEL_PRESSURE;
        ev.time.tick = tick;
        ev.data.control = SeqCtrl {
            channel,
            unused: [0; 3],
            param: 0,
            value: pressure as i32,
        };
        ev
    }

    /// `value` is the 14-bit bend recentred on zero (-8192..=8191).
    pub fn pitch_bend(tick: u32, channel: u8, value: i32) -> Self {
        let mut ev = Self::zeroed();
        ev.r#type = seq::PITCH_BEND;
        ev.time.tick = tick;
        ev.data.control = SeqCtrl {
            channel,
            unused: [0; 3],
            param: 0,
            value,
        };
        ev
    }

    pub fn tick(&self) -> u32 {
        // SAFETY: the adapter only ever writes tick times.
        unsafe { self.time.tick }
    }

    pub fn note(&self) -> SeqNote {
        // SAFETY: POD union; note fields alias the first bytes of data.
        unsafe { self.data.note }
    }

    pub fn control(&self) -> SeqCtrl {
        // SAFETY: POD union read.
        unsafe { self.data.control }
    }
}

/// Fixed-capacity native event accumulator for one block.
///
/// Lives on the host's audio-thread side (one per processing context) so the
/// adapter itself never allocates in the block path.
pub struct NativeEventBuffer {
    events: Box<[NativeEvent; MAX_NATIVE_EVENTS]>,
    len: usize,
}

impl NativeEventBuffer {
    pub fn new() -> Self {
        NativeEventBuffer {
            events: Box::new([NativeEvent::zeroed(); MAX_NATIVE_EVENTS]),
            len: 0,
        }
    }

    /// Append an event; returns false (and drops it) when full.
    pub fn push(&mut self, event: NativeEvent) -> bool {
        if self.len >= MAX_NATIVE_EVENTS {
            return false;
        }
        self.events[self.len] = event;
        self.len += 1;
        true
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[NativeEvent] {
        &self.events[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [NativeEvent] {
        &mut self.events[..self.len]
    }
}

impl Default for NativeEventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Deferred audio-thread → control-thread records
// ---------------------------------------------------------------------------

/// Plain-old-data record posted from the audio path and drained by the
/// control thread. Mirrored into [`crate::plugin::Notification`] on dispatch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeferredEvent {
    ParameterChanged { index: u32, value: f32 },
    DryWetChanged(f32),
    VolumeChanged(f32),
    BalanceChanged { left: f32, right: f32 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
}

pub const DEFERRED_QUEUE_CAPACITY: usize = 256;

/// Build the single-producer/single-consumer deferred queue pair.
pub fn deferred_queue() -> (HeapProd<DeferredEvent>, HeapCons<DeferredEvent>) {
    HeapRb::new(DEFERRED_QUEUE_CAPACITY).split()
}

/// Push without blocking; a full ring drops the record.
pub fn post(prod: &mut HeapProd<DeferredEvent>, event: DeferredEvent) {
    let _ = prod.try_push(event);
}

/// Drain every pending record into `f`.
pub fn drain(cons: &mut HeapCons<DeferredEvent>, mut f: impl FnMut(DeferredEvent)) {
    while let Some(event) = cons.try_pop() {
        f(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_event_layout_matches_the_abi() {
        // 4 header bytes + 8 timestamp + 2x2 addresses + 12 payload.
        assert_eq!(std::mem::size_of::<NativeEvent>(), 28);
        assert_eq!(std::mem::size_of::<SeqTime>(), 8);
        assert_eq!(std::mem::size_of::<SeqData>(), 12);
    }

    #[test]
    fn constructors_round_trip() {
        let ev = NativeEvent::note_on(17, 3, 60, 100);
        assert_eq!(ev.r#type, seq::NOTE_ON);
        assert_eq!(ev.tick(), 17);
        assert_eq!(ev.note().channel, 3);
        assert_eq!(ev.note().note, 60);
        assert_eq!(ev.note().velocity, 100);

        let ev = NativeEvent::controller(0, 1, MIDI_CC_ALL_NOTES_OFF, 0);
        assert_eq!(ev.r#type, seq::CONTROLLER);
        assert_eq!(ev.control().param, MIDI_CC_ALL_NOTES_OFF as u32);

        let ev = NativeEvent::pitch_bend(5, 0, -8192);
        assert_eq!(ev.control().value, -8192);
    }

    #[test]
    fn native_buffer_drops_on_overflow() {
        let mut buf = NativeEventBuffer::new();
        for i in 0..MAX_NATIVE_EVENTS {
            assert!(buf.push(NativeEvent::note_on(i as u32, 0, 60, 1)));
        }
        assert!(!buf.push(NativeEvent::note_on(0, 0, 61, 1)));
        assert_eq!(buf.len(), MAX_NATIVE_EVENTS);

        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.push(NativeEvent::note_on(0, 0, 61, 1)));
    }

    #[test]
    fn host_event_queue_respects_capacity() {
        let mut q = HostEventQueue::with_capacity(2);
        let ev = HostEvent {
            time: 0,
            channel: 0,
            kind: HostEventKind::Control(CtrlEvent::AllNotesOff),
        };
        assert!(q.push(ev));
        assert!(q.push(ev));
        assert!(!q.push(ev));
        assert_eq!(q.len(), 2);
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn deferred_queue_is_fifo_and_bounded() {
        let (mut prod, mut cons) = deferred_queue();
        for i in 0..DEFERRED_QUEUE_CAPACITY + 10 {
            post(
                &mut prod,
                DeferredEvent::ParameterChanged {
                    index: i as u32,
                    value: 0.0,
                },
            );
        }
        let mut seen = Vec::new();
        drain(&mut cons, |ev| seen.push(ev));
        assert_eq!(seen.len(), DEFERRED_QUEUE_CAPACITY);
        assert_eq!(
            seen[0],
            DeferredEvent::ParameterChanged { index: 0, value: 0.0 }
        );
    }
}
