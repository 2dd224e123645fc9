use std::collections::HashSet;

use crossbeam_channel::Sender;
use midir::{MidiInput, MidiInputConnection};

use crate::plugin::{CtrlEvent, HostEvent, HostEventKind};

/// Translate a raw MIDI message into the unified host event the adapter
/// consumes. Bank/program selectors and the panic controllers become
/// control-class events; everything else passes through as raw MIDI.
/// Returns None for messages the host does not carry (SysEx, bank LSB).
pub fn host_event_from_midi(bytes: &[u8]) -> Option<HostEvent> {
    if bytes.is_empty() || bytes.len() > 3 {
        return None;
    }
    let status = bytes[0] & 0xF0;
    let channel = bytes[0] & 0x0F;

    let kind = match status {
        0xB0 => {
            let cc = *bytes.get(1)?;
            let value = *bytes.get(2)? as f32 / 127.0;
            match cc {
                0x00 => HostEventKind::Control(CtrlEvent::MidiBank(bytes[2] as u16)),
                // Bank select LSB: the coarse selector is enough here.
                0x20 => return None,
                0x78 => HostEventKind::Control(CtrlEvent::AllSoundOff),
                0x7B => HostEventKind::Control(CtrlEvent::AllNotesOff),
                _ => HostEventKind::Control(CtrlEvent::Parameter {
                    param: cc as u16,
                    value,
                }),
            }
        }
        0xC0 => HostEventKind::Control(CtrlEvent::MidiProgram(*bytes.get(1)? as u16)),
        0x80 | 0x90 | 0xA0 | 0xD0 | 0xE0 => {
            let mut data = [0u8; 3];
            data[..bytes.len()].copy_from_slice(bytes);
            HostEventKind::Midi {
                size: bytes.len() as u8,
                data,
            }
        }
        _ => return None,
    };

    // Timestamp 0 = place at start of next block.
    Some(HostEvent {
        time: 0,
        channel,
        kind,
    })
}

pub struct MidiManager {
    sender: Sender<HostEvent>,
    device_filter: Option<String>,
    connections: Vec<MidiInputConnection<()>>,
    connected_names: HashSet<String>,
}

impl MidiManager {
    pub fn new(sender: Sender<HostEvent>, device_filter: Option<String>) -> Self {
        MidiManager {
            sender,
            device_filter,
            connections: Vec::new(),
            connected_names: HashSet::new(),
        }
    }

    /// Open all available MIDI input ports (or those matching the filter).
    /// Returns the number of newly opened connections.
    pub fn open_ports(&mut self) -> anyhow::Result<usize> {
        let midi_in = MidiInput::new("rivet")?;
        let ports = midi_in.ports();
        let mut opened = 0;

        for port in &ports {
            let name = match midi_in.port_name(port) {
                Ok(n) => n,
                Err(_) => continue,
            };

            if self.connected_names.contains(&name) {
                continue;
            }

            if let Some(ref filter) = self.device_filter {
                if !name.contains(filter.as_str()) {
                    continue;
                }
            }

            let sender = self.sender.clone();
            let log_name = name.clone();
            let conn_name = name.clone();

            // Need a fresh MidiInput for each connection
            let midi_in_for_port = MidiInput::new("rivet")?;
            match midi_in_for_port.connect(
                port,
                &conn_name,
                move |_timestamp_us, bytes, _| {
                    log::debug!("MIDI in [{log_name}] data={bytes:02x?}");
                    if let Some(event) = host_event_from_midi(bytes) {
                        if sender.try_send(event).is_err() {
                            log::warn!("MIDI channel full, dropping event from {log_name}");
                        }
                    }
                },
                (),
            ) {
                Ok(conn) => {
                    log::info!("Opened MIDI input: {name}");
                    self.connected_names.insert(name);
                    self.connections.push(conn);
                    opened += 1;
                }
                Err(e) => {
                    log::warn!("Failed to open MIDI input {name}: {e}");
                }
            }
        }

        Ok(opened)
    }

    /// Poll for newly connected MIDI devices. Call periodically from the
    /// main loop.
    pub fn poll_new_devices(&mut self) {
        match self.open_ports() {
            Ok(0) => {}
            Ok(n) => log::info!("Opened {n} new MIDI device(s)"),
            Err(e) => log::warn!("MIDI poll error: {e}"),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_pass_through_as_raw_midi() {
        let ev = host_event_from_midi(&[0x93, 60, 100]).unwrap();
        assert_eq!(ev.channel, 3);
        assert_eq!(
            ev.kind,
            HostEventKind::Midi {
                size: 3,
                data: [0x93, 60, 100]
            }
        );
    }

    #[test]
    fn bank_and_program_become_control_events() {
        let ev = host_event_from_midi(&[0xB0, 0x00, 5]).unwrap();
        assert_eq!(ev.kind, HostEventKind::Control(CtrlEvent::MidiBank(5)));

        let ev = host_event_from_midi(&[0xC2, 12]).unwrap();
        assert_eq!(ev.channel, 2);
        assert_eq!(ev.kind, HostEventKind::Control(CtrlEvent::MidiProgram(12)));

        assert!(host_event_from_midi(&[0xB0, 0x20, 1]).is_none());
    }

    #[test]
    fn controllers_normalize_their_value() {
        let ev = host_event_from_midi(&[0xB1, 0x4A, 127]).unwrap();
        assert_eq!(
            ev.kind,
            HostEventKind::Control(CtrlEvent::Parameter {
                param: 0x4A,
                value: 1.0
            })
        );
    }

    #[test]
    fn panic_controllers_map_to_dedicated_events() {
        let ev = host_event_from_midi(&[0xB0, 0x78, 0]).unwrap();
        assert_eq!(ev.kind, HostEventKind::Control(CtrlEvent::AllSoundOff));
        let ev = host_event_from_midi(&[0xB0, 0x7B, 0]).unwrap();
        assert_eq!(ev.kind, HostEventKind::Control(CtrlEvent::AllNotesOff));
    }

    #[test]
    fn unsupported_messages_are_dropped() {
        assert!(host_event_from_midi(&[]).is_none());
        assert!(host_event_from_midi(&[0xF0, 1, 2]).is_none());
        assert!(host_event_from_midi(&[0xF8]).is_none());
    }
}
