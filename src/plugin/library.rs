//! Raw plugin ABI and the dynamic-library-backed descriptor.
//!
//! `PluginLibrary` opens a DSSI plugin binary, resolves the
//! `dssi_descriptor` entry point, picks the descriptor matching the wanted
//! label, and exposes it through [`SynthDescriptor`] so the rest of the
//! crate never sees a nullable function pointer.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_ulong, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::plugin::descriptor::{
    DefaultHint, PluginHandle, PortInfo, ProgramInfo, RangeHint, RawPortDirection, RawPortKind,
    SynthDescriptor,
};
use crate::plugin::events::NativeEvent;

/// C-layout descriptor tables, as the plugin binary defines them.
pub mod ffi {
    use super::{c_char, c_int, c_ulong, c_void, NativeEvent};

    pub type LadspaHandle = *mut c_void;
    pub type LadspaData = f32;

    // Port descriptor bits.
    pub const PORT_INPUT: c_int = 0x1;
    pub const PORT_OUTPUT: c_int = 0x2;
    pub const PORT_CONTROL: c_int = 0x4;
    pub const PORT_AUDIO: c_int = 0x8;

    // Plugin property bits.
    pub const PROP_HARD_RT_CAPABLE: c_int = 0x4;

    // Range hint bits.
    pub const HINT_BOUNDED_BELOW: c_int = 0x1;
    pub const HINT_BOUNDED_ABOVE: c_int = 0x2;
    pub const HINT_TOGGLED: c_int = 0x4;
    pub const HINT_SAMPLE_RATE: c_int = 0x8;
    pub const HINT_LOGARITHMIC: c_int = 0x10;
    pub const HINT_INTEGER: c_int = 0x20;
    pub const HINT_DEFAULT_MASK: c_int = 0x3C0;
    pub const HINT_DEFAULT_MINIMUM: c_int = 0x40;
    pub const HINT_DEFAULT_LOW: c_int = 0x80;
    pub const HINT_DEFAULT_MIDDLE: c_int = 0xC0;
    pub const HINT_DEFAULT_HIGH: c_int = 0x100;
    pub const HINT_DEFAULT_MAXIMUM: c_int = 0x140;
    pub const HINT_DEFAULT_0: c_int = 0x200;
    pub const HINT_DEFAULT_1: c_int = 0x240;
    pub const HINT_DEFAULT_100: c_int = 0x280;
    pub const HINT_DEFAULT_440: c_int = 0x2C0;

    // Synth-API controller encoding.
    pub const CONTROLLER_NONE: c_int = -1;
    pub const CONTROLLER_CC_BITS: c_int = 0x20000000;

    #[repr(C)]
    pub struct LadspaPortRangeHint {
        pub hint_descriptor: c_int,
        pub lower_bound: LadspaData,
        pub upper_bound: LadspaData,
    }

    #[repr(C)]
    pub struct LadspaDescriptor {
        pub unique_id: c_ulong,
        pub label: *const c_char,
        pub properties: c_int,
        pub name: *const c_char,
        pub maker: *const c_char,
        pub copyright: *const c_char,
        pub port_count: c_ulong,
        pub port_descriptors: *const c_int,
        pub port_names: *const *const c_char,
        pub port_range_hints: *const LadspaPortRangeHint,
        pub implementation_data: *mut c_void,
        pub instantiate:
            Option<unsafe extern "C" fn(*const LadspaDescriptor, c_ulong) -> LadspaHandle>,
        pub connect_port: Option<unsafe extern "C" fn(LadspaHandle, c_ulong, *mut LadspaData)>,
        pub activate: Option<unsafe extern "C" fn(LadspaHandle)>,
        pub run: Option<unsafe extern "C" fn(LadspaHandle, c_ulong)>,
        pub run_adding: Option<unsafe extern "C" fn(LadspaHandle, c_ulong)>,
        pub set_run_adding_gain: Option<unsafe extern "C" fn(LadspaHandle, LadspaData)>,
        pub deactivate: Option<unsafe extern "C" fn(LadspaHandle)>,
        pub cleanup: Option<unsafe extern "C" fn(LadspaHandle)>,
    }

    #[repr(C)]
    pub struct ProgramDescriptor {
        pub bank: c_ulong,
        pub program: c_ulong,
        pub name: *const c_char,
    }

    #[repr(C)]
    pub struct DssiDescriptor {
        pub dssi_api_version: c_int,
        pub ladspa_plugin: *const LadspaDescriptor,
        pub configure:
            Option<unsafe extern "C" fn(LadspaHandle, *const c_char, *const c_char) -> *mut c_char>,
        pub get_program:
            Option<unsafe extern "C" fn(LadspaHandle, c_ulong) -> *const ProgramDescriptor>,
        pub select_program: Option<unsafe extern "C" fn(LadspaHandle, c_ulong, c_ulong)>,
        pub get_midi_controller_for_port:
            Option<unsafe extern "C" fn(LadspaHandle, c_ulong) -> c_int>,
        pub run_synth:
            Option<unsafe extern "C" fn(LadspaHandle, c_ulong, *mut NativeEvent, c_ulong)>,
        pub run_synth_adding:
            Option<unsafe extern "C" fn(LadspaHandle, c_ulong, *mut NativeEvent, c_ulong)>,
        pub run_multiple_synths: Option<
            unsafe extern "C" fn(
                c_ulong,
                *mut LadspaHandle,
                c_ulong,
                *mut *mut NativeEvent,
                *mut c_ulong,
            ),
        >,
        pub run_multiple_synths_adding: Option<
            unsafe extern "C" fn(
                c_ulong,
                *mut LadspaHandle,
                c_ulong,
                *mut *mut NativeEvent,
                *mut c_ulong,
            ),
        >,
        // dssi-vst extensions for opaque state chunks.
        pub get_custom_data:
            Option<unsafe extern "C" fn(LadspaHandle, *mut *mut c_void, *mut c_ulong) -> c_int>,
        pub set_custom_data:
            Option<unsafe extern "C" fn(LadspaHandle, *mut c_void, c_ulong) -> c_int>,
    }

    pub type DescriptorFn = unsafe extern "C" fn(c_ulong) -> *const DssiDescriptor;
}

fn cstr_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null, NUL-terminated string owned by the loaded library.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

pub(crate) fn decode_port_kind(desc: c_int) -> (RawPortKind, RawPortDirection) {
    let kind = if desc & ffi::PORT_AUDIO != 0 {
        RawPortKind::Audio
    } else if desc & ffi::PORT_CONTROL != 0 {
        RawPortKind::Control
    } else {
        RawPortKind::Other
    };
    let direction = if desc & ffi::PORT_INPUT != 0 {
        RawPortDirection::Input
    } else if desc & ffi::PORT_OUTPUT != 0 {
        RawPortDirection::Output
    } else {
        RawPortDirection::Unknown
    };
    (kind, direction)
}

pub(crate) fn decode_hint(descriptor: c_int, lower: f32, upper: f32) -> RangeHint {
    let default = match descriptor & ffi::HINT_DEFAULT_MASK {
        x if x == ffi::HINT_DEFAULT_MINIMUM => DefaultHint::Minimum,
        x if x == ffi::HINT_DEFAULT_LOW => DefaultHint::Low,
        x if x == ffi::HINT_DEFAULT_MIDDLE => DefaultHint::Middle,
        x if x == ffi::HINT_DEFAULT_HIGH => DefaultHint::High,
        x if x == ffi::HINT_DEFAULT_MAXIMUM => DefaultHint::Maximum,
        x if x == ffi::HINT_DEFAULT_0 => DefaultHint::Zero,
        x if x == ffi::HINT_DEFAULT_1 => DefaultHint::One,
        x if x == ffi::HINT_DEFAULT_100 => DefaultHint::Hundred,
        x if x == ffi::HINT_DEFAULT_440 => DefaultHint::FourForty,
        _ => DefaultHint::None,
    };
    RangeHint {
        bounded_below: descriptor & ffi::HINT_BOUNDED_BELOW != 0,
        bounded_above: descriptor & ffi::HINT_BOUNDED_ABOVE != 0,
        lower,
        upper,
        toggled: descriptor & ffi::HINT_TOGGLED != 0,
        sample_rate: descriptor & ffi::HINT_SAMPLE_RATE != 0,
        logarithmic: descriptor & ffi::HINT_LOGARITHMIC != 0,
        integer: descriptor & ffi::HINT_INTEGER != 0,
        default,
    }
}

pub(crate) fn decode_controller(value: c_int) -> Option<u8> {
    if value == ffi::CONTROLLER_NONE || value & ffi::CONTROLLER_CC_BITS == 0 {
        return None;
    }
    Some((value & 0x7F) as u8)
}

/// A plugin binary loaded into the process, pinned for the adapter's
/// lifetime.
pub struct PluginLibrary {
    path: PathBuf,
    label: String,
    name: String,
    maker: String,
    ports: Vec<PortInfo>,
    // Pointers into the loaded library's static descriptor tables. They
    // must be declared before _library: Rust drops fields in order, and the
    // library unmaps the memory they point into.
    dssi: *const ffi::DssiDescriptor,
    ladspa: *const ffi::LadspaDescriptor,
    _library: libloading::Library,
}

// SAFETY: the descriptor tables are static data inside the pinned library.
// Per-instance entry points require external serialization, which the
// adapter's engine lock provides.
unsafe impl Send for PluginLibrary {}
unsafe impl Sync for PluginLibrary {}

impl PluginLibrary {
    /// Open `path` and select the descriptor matching `label` (or the first
    /// one when `label` is None).
    pub fn load(path: &Path, label: Option<&str>) -> anyhow::Result<Arc<PluginLibrary>> {
        // SAFETY: loading external dynamic libraries is inherently unsafe.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| anyhow::anyhow!("failed to load plugin library {}: {e}", path.display()))?;

        let (dssi, ladspa) = {
            let entry: libloading::Symbol<'_, ffi::DescriptorFn> =
                unsafe { library.get(b"dssi_descriptor") }.map_err(|e| {
                    anyhow::anyhow!("dssi_descriptor not found in {}: {e}", path.display())
                })?;

            let mut index: c_ulong = 0;
            loop {
                let dssi = unsafe { entry(index) };
                if dssi.is_null() {
                    match label {
                        Some(want) => anyhow::bail!(
                            "label '{want}' not found in {} (available: {})",
                            path.display(),
                            Self::labels_via(&entry).join(", "),
                        ),
                        None => anyhow::bail!("no descriptors in {}", path.display()),
                    }
                }
                // SAFETY: non-null descriptor returned by the entry point.
                let ladspa = unsafe { (*dssi).ladspa_plugin };
                if !ladspa.is_null() {
                    let this_label = cstr_lossy(unsafe { (*ladspa).label });
                    match label {
                        None => break (dssi, ladspa),
                        Some(want) if want == this_label => break (dssi, ladspa),
                        Some(_) => {}
                    }
                }
                index += 1;
            }
        };

        // SAFETY: the descriptor stays valid while the library is loaded;
        // the port tables have port_count entries by contract.
        let ports: Vec<PortInfo> = unsafe {
            let count = (*ladspa).port_count as usize;
            let descs = std::slice::from_raw_parts((*ladspa).port_descriptors, count);
            let names = std::slice::from_raw_parts((*ladspa).port_names, count);
            let hints = std::slice::from_raw_parts((*ladspa).port_range_hints, count);
            (0..count)
                .map(|i| {
                    let (kind, direction) = decode_port_kind(descs[i]);
                    PortInfo {
                        name: cstr_lossy(names[i]),
                        kind,
                        direction,
                        hint: decode_hint(
                            hints[i].hint_descriptor,
                            hints[i].lower_bound,
                            hints[i].upper_bound,
                        ),
                    }
                })
                .collect()
        };

        let label = cstr_lossy(unsafe { (*ladspa).label });
        let name = cstr_lossy(unsafe { (*ladspa).name });
        let maker = cstr_lossy(unsafe { (*ladspa).maker });

        log::info!(
            "loaded {} ('{label}') from {}: {} port(s)",
            name,
            path.display(),
            ports.len(),
        );

        Ok(Arc::new(PluginLibrary {
            path: path.to_path_buf(),
            label,
            name,
            maker,
            ports,
            dssi,
            ladspa,
            _library: library,
        }))
    }

    /// Labels of every descriptor in a plugin binary.
    pub fn labels(path: &Path) -> anyhow::Result<Vec<String>> {
        // SAFETY: see load().
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| anyhow::anyhow!("failed to load plugin library {}: {e}", path.display()))?;
        let entry: libloading::Symbol<'_, ffi::DescriptorFn> =
            unsafe { library.get(b"dssi_descriptor") }
                .map_err(|e| anyhow::anyhow!("dssi_descriptor not found: {e}"))?;
        Ok(Self::labels_via(&entry))
    }

    fn labels_via(entry: &libloading::Symbol<'_, ffi::DescriptorFn>) -> Vec<String> {
        let mut labels = Vec::new();
        let mut index: c_ulong = 0;
        loop {
            // SAFETY: iterating the entry point until it returns null.
            let dssi = unsafe { entry(index) };
            if dssi.is_null() {
                break;
            }
            let ladspa = unsafe { (*dssi).ladspa_plugin };
            if !ladspa.is_null() {
                labels.push(cstr_lossy(unsafe { (*ladspa).label }));
            }
            index += 1;
        }
        labels
    }

    fn ladspa(&self) -> &ffi::LadspaDescriptor {
        // SAFETY: valid while _library is loaded.
        unsafe { &*self.ladspa }
    }

    fn dssi(&self) -> &ffi::DssiDescriptor {
        // SAFETY: valid while _library is loaded.
        unsafe { &*self.dssi }
    }
}

impl SynthDescriptor for PluginLibrary {
    fn label(&self) -> &str {
        &self.label
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn maker(&self) -> &str {
        &self.maker
    }

    fn is_hard_rt_capable(&self) -> bool {
        self.ladspa().properties & ffi::PROP_HARD_RT_CAPABLE != 0
    }

    fn requires_fixed_buffers(&self) -> bool {
        // Bridged plugins are the one family that cannot split buffers.
        self.path.to_string_lossy().contains("dssi-vst")
    }

    fn port_count(&self) -> usize {
        self.ports.len()
    }

    fn port(&self, index: usize) -> PortInfo {
        self.ports[index].clone()
    }

    fn instantiate(&self, sample_rate: u32) -> Option<PluginHandle> {
        let f = self.ladspa().instantiate?;
        // SAFETY: mandatory entry point called with its own descriptor.
        let handle = unsafe { f(self.ladspa, sample_rate as c_ulong) };
        (!handle.is_null()).then_some(PluginHandle(handle))
    }

    unsafe fn connect_port(&self, handle: PluginHandle, port: usize, data: *mut f32) {
        if let Some(f) = self.ladspa().connect_port {
            // SAFETY: caller upholds the binding lifetime contract.
            unsafe { f(handle.raw(), port as c_ulong, data) };
        }
    }

    fn supports_activation(&self) -> bool {
        self.ladspa().activate.is_some()
    }

    fn activate(&self, handle: PluginHandle) {
        if let Some(f) = self.ladspa().activate {
            // SAFETY: live handle from instantiate.
            unsafe { f(handle.raw()) };
        }
    }

    fn deactivate(&self, handle: PluginHandle) {
        if let Some(f) = self.ladspa().deactivate {
            // SAFETY: live handle from instantiate.
            unsafe { f(handle.raw()) };
        }
    }

    fn cleanup(&self, handle: PluginHandle) {
        if let Some(f) = self.ladspa().cleanup {
            // SAFETY: the handle is not used again after cleanup.
            unsafe { f(handle.raw()) };
        }
    }

    fn run(&self, handle: PluginHandle, frames: u32) {
        if let Some(f) = self.ladspa().run {
            // SAFETY: ports are bound and the engine lock is held.
            unsafe { f(handle.raw(), frames as c_ulong) };
        }
    }

    fn supports_run_synth(&self) -> bool {
        self.dssi().run_synth.is_some()
    }

    fn run_synth(&self, handle: PluginHandle, frames: u32, events: &mut [NativeEvent]) {
        if let Some(f) = self.dssi().run_synth {
            // SAFETY: as run(); the event slice outlives the call.
            unsafe {
                f(
                    handle.raw(),
                    frames as c_ulong,
                    events.as_mut_ptr(),
                    events.len() as c_ulong,
                )
            };
        }
    }

    fn supports_run_multiple(&self) -> bool {
        self.dssi().run_multiple_synths.is_some()
    }

    fn run_multiple(&self, handles: &[PluginHandle], frames: u32, events: &mut [NativeEvent]) {
        let Some(f) = self.dssi().run_multiple_synths else {
            return;
        };
        // At most the stereo pair; fixed arrays keep this allocation-free.
        let count = handles.len().min(2);
        let mut raw: [ffi::LadspaHandle; 2] = [std::ptr::null_mut(); 2];
        for (slot, handle) in raw.iter_mut().zip(handles) {
            *slot = handle.raw();
        }
        let mut event_ptrs: [*mut NativeEvent; 2] = [events.as_mut_ptr(); 2];
        let mut event_counts: [c_ulong; 2] = [events.len() as c_ulong; 2];
        // SAFETY: arrays carry `count` valid entries; every handle is live.
        unsafe {
            f(
                count as c_ulong,
                raw.as_mut_ptr(),
                frames as c_ulong,
                event_ptrs.as_mut_ptr(),
                event_counts.as_mut_ptr(),
            )
        };
    }

    fn midi_controller_for_port(&self, handle: PluginHandle, port: usize) -> Option<u8> {
        let f = self.dssi().get_midi_controller_for_port?;
        // SAFETY: live handle, in-range port.
        let value = unsafe { f(handle.raw(), port as c_ulong) };
        decode_controller(value)
    }

    fn supports_programs(&self) -> bool {
        self.dssi().get_program.is_some() && self.dssi().select_program.is_some()
    }

    fn program(&self, handle: PluginHandle, index: u32) -> Option<ProgramInfo> {
        let f = self.dssi().get_program?;
        // SAFETY: live handle; null return ends enumeration.
        let pdesc = unsafe { f(handle.raw(), index as c_ulong) };
        if pdesc.is_null() {
            return None;
        }
        // SAFETY: non-null program descriptor owned by the plugin.
        unsafe {
            Some(ProgramInfo {
                bank: (*pdesc).bank as u32,
                program: (*pdesc).program as u32,
                name: cstr_lossy((*pdesc).name),
            })
        }
    }

    fn select_program(&self, handle: PluginHandle, bank: u32, program: u32) {
        if let Some(f) = self.dssi().select_program {
            // SAFETY: live handle.
            unsafe { f(handle.raw(), bank as c_ulong, program as c_ulong) };
        }
    }

    fn supports_configure(&self) -> bool {
        self.dssi().configure.is_some()
    }

    fn configure(&self, handle: PluginHandle, key: &str, value: &str) {
        let Some(f) = self.dssi().configure else {
            return;
        };
        let Ok(ckey) = std::ffi::CString::new(key) else {
            return;
        };
        let Ok(cvalue) = std::ffi::CString::new(value) else {
            return;
        };
        // SAFETY: NUL-terminated arguments outlive the call.
        let message = unsafe { f(handle.raw(), ckey.as_ptr(), cvalue.as_ptr()) };
        if !message.is_null() {
            log::warn!("configure({key}): {}", cstr_lossy(message));
            // The API hands ownership of the message to the host.
            #[cfg(unix)]
            // SAFETY: allocated by the plugin with malloc, per the API.
            unsafe {
                libc::free(message as *mut c_void)
            };
        }
    }

    fn supports_chunks(&self) -> bool {
        self.dssi().get_custom_data.is_some() && self.dssi().set_custom_data.is_some()
    }

    fn chunk(&self, handle: PluginHandle) -> Option<Vec<u8>> {
        let f = self.dssi().get_custom_data?;
        let mut data: *mut c_void = std::ptr::null_mut();
        let mut size: c_ulong = 0;
        // SAFETY: live handle; out-params written on success.
        let ok = unsafe { f(handle.raw(), &mut data, &mut size) };
        if ok == 0 || data.is_null() || size == 0 {
            return None;
        }
        // SAFETY: the plugin owns `data`; copy out `size` bytes.
        Some(unsafe { std::slice::from_raw_parts(data as *const u8, size as usize) }.to_vec())
    }

    fn set_chunk(&self, handle: PluginHandle, data: &[u8]) -> bool {
        let Some(f) = self.dssi().set_custom_data else {
            return false;
        };
        // SAFETY: the plugin copies the buffer during the call.
        unsafe { f(handle.raw(), data.as_ptr() as *mut c_void, data.len() as c_ulong) != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_kind_decoding() {
        assert_eq!(
            decode_port_kind(ffi::PORT_AUDIO | ffi::PORT_INPUT),
            (RawPortKind::Audio, RawPortDirection::Input)
        );
        assert_eq!(
            decode_port_kind(ffi::PORT_CONTROL | ffi::PORT_OUTPUT),
            (RawPortKind::Control, RawPortDirection::Output)
        );
        // Malformed entries decode to the safe fallbacks instead of failing.
        assert_eq!(
            decode_port_kind(ffi::PORT_AUDIO),
            (RawPortKind::Audio, RawPortDirection::Unknown)
        );
        assert_eq!(
            decode_port_kind(0),
            (RawPortKind::Other, RawPortDirection::Unknown)
        );
    }

    #[test]
    fn hint_decoding() {
        let h = decode_hint(
            ffi::HINT_BOUNDED_BELOW
                | ffi::HINT_BOUNDED_ABOVE
                | ffi::HINT_LOGARITHMIC
                | ffi::HINT_DEFAULT_MIDDLE,
            20.0,
            20000.0,
        );
        assert!(h.bounded_below && h.bounded_above);
        assert!(h.logarithmic);
        assert!(!h.integer);
        assert_eq!(h.lower, 20.0);
        assert_eq!(h.upper, 20000.0);
        assert_eq!(h.default, DefaultHint::Middle);

        let h = decode_hint(ffi::HINT_TOGGLED | ffi::HINT_DEFAULT_1, 0.0, 0.0);
        assert!(h.toggled);
        assert_eq!(h.default, DefaultHint::One);

        let h = decode_hint(ffi::HINT_SAMPLE_RATE, 0.0, 0.5);
        assert!(h.sample_rate);
        assert_eq!(h.default, DefaultHint::None);
    }

    #[test]
    fn controller_decoding() {
        assert_eq!(decode_controller(ffi::CONTROLLER_NONE), None);
        assert_eq!(decode_controller(ffi::CONTROLLER_CC_BITS | 0x4A), Some(0x4A));
        // NRPN-style bindings are not CCs.
        assert_eq!(decode_controller(0x40000000 | 0x12), None);
        assert_eq!(decode_controller(0), None);
    }
}
