//! The plugin's built-in program list and the selection-migration policy
//! applied when the list is rebuilt.

use crate::plugin::descriptor::{PluginHandle, SynthDescriptor};

/// One built-in preset, addressed by (bank, program) on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramEntry {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

/// Query the plugin incrementally until it stops returning programs.
pub fn enumerate(desc: &dyn SynthDescriptor, handle: PluginHandle) -> Vec<ProgramEntry> {
    let mut entries = Vec::new();
    if !desc.supports_programs() {
        return entries;
    }
    while let Some(info) = desc.program(handle, entries.len() as u32) {
        entries.push(ProgramEntry {
            bank: info.bank,
            program: info.program,
            name: info.name,
        });
    }
    entries
}

/// Migrate the current selection across a table rebuild.
///
/// Returns the new current index and whether a (re)selection must be pushed
/// to the plugin. Rules are evaluated strictly in this order.
pub fn reconcile(init: bool, old_count: usize, current: i32, new_count: usize) -> (i32, bool) {
    if init {
        return if new_count > 0 { (0, true) } else { (-1, false) };
    }

    if new_count == old_count + 1 {
        // One program appeared, most likely just created: select it.
        (old_count as i32, true)
    } else if current < 0 && new_count > 0 {
        (0, true)
    } else if current >= 0 && new_count == 0 {
        (-1, true)
    } else if current >= new_count as i32 {
        (0, true)
    } else {
        (current, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::descriptor::ProgramInfo;
    use crate::plugin::testing::{audio_out, MockDescriptor};

    #[test]
    fn reconciliation_table() {
        // (old_count, current, new_count) -> expected current
        let cases = [
            (0usize, -1i32, 3usize, 0i32),
            (3, 1, 4, 3),
            (3, 1, 0, -1),
            (3, 5, 3, 0),
            (3, 1, 3, 1),
        ];
        for (old, current, new, expected) in cases {
            let (selected, _) = reconcile(false, old, current, new);
            assert_eq!(
                selected, expected,
                "reconcile(old={old}, current={current}, new={new})"
            );
        }
    }

    #[test]
    fn reconciliation_flags_changes() {
        assert_eq!(reconcile(false, 3, 1, 3), (1, false));
        assert_eq!(reconcile(false, 3, 1, 4), (3, true));
        assert_eq!(reconcile(false, 0, -1, 0), (-1, false));
        assert_eq!(reconcile(false, 3, 2, 0), (-1, true));
    }

    #[test]
    fn first_init_selects_program_zero() {
        assert_eq!(reconcile(true, 0, -1, 5), (0, true));
        assert_eq!(reconcile(true, 0, -1, 0), (-1, false));
    }

    #[test]
    fn enumeration_stops_at_the_first_gap() {
        let desc = MockDescriptor::synth(vec![audio_out("out")]);
        desc.set_programs(vec![
            ProgramInfo { bank: 0, program: 0, name: "Init".into() },
            ProgramInfo { bank: 0, program: 1, name: "Bright".into() },
            ProgramInfo { bank: 1, program: 0, name: "Pad".into() },
        ]);
        let handle = desc.instantiate(48_000).unwrap();
        let entries = enumerate(&desc, handle);
        desc.cleanup(handle);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].bank, 1);
        assert_eq!(entries[1].name, "Bright");
    }

    #[test]
    fn enumeration_is_empty_without_program_support() {
        let desc = MockDescriptor::effect(vec![audio_out("out")]);
        let handle = desc.instantiate(48_000).unwrap();
        assert!(enumerate(&desc, handle).is_empty());
        desc.cleanup(handle);
    }
}
