//! Plugin instance lifecycle: the mono/dual-mono handle variant and the
//! process-wide exclusivity registry for batched-run-only plugins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::plugin::descriptor::{PluginHandle, SynthDescriptor};

/// The live plugin handle(s).
///
/// Either one mono instance or a full dual-instance stereo split; no partial
/// state is representable. The split simulates stereo I/O for plugins with a
/// single mono audio port per side by running two synchronized instances
/// over shared parameter storage.
#[derive(Clone, Copy, Debug)]
pub enum Instances {
    Mono(PluginHandle),
    Stereo(PluginHandle, PluginHandle),
}

impl Instances {
    pub fn primary(&self) -> PluginHandle {
        match *self {
            Instances::Mono(h) => h,
            Instances::Stereo(h, _) => h,
        }
    }

    pub fn secondary(&self) -> Option<PluginHandle> {
        match *self {
            Instances::Mono(_) => None,
            Instances::Stereo(_, h) => Some(h),
        }
    }

    pub fn is_stereo(&self) -> bool {
        matches!(self, Instances::Stereo(..))
    }

    pub fn count(&self) -> usize {
        match self {
            Instances::Mono(_) => 1,
            Instances::Stereo(..) => 2,
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(PluginHandle)) {
        match *self {
            Instances::Mono(h) => f(h),
            Instances::Stereo(a, b) => {
                f(a);
                f(b);
            }
        }
    }

    /// Handle array for the batched multi-instance run entry.
    pub fn raw(&self) -> ([PluginHandle; 2], usize) {
        match *self {
            Instances::Mono(h) => ([h, h], 1),
            Instances::Stereo(a, b) => ([a, b], 2),
        }
    }

    pub fn activate(&self, desc: &dyn SynthDescriptor) {
        if desc.supports_activation() {
            self.for_each(|h| desc.activate(h));
        }
    }

    pub fn deactivate(&self, desc: &dyn SynthDescriptor) {
        if desc.supports_activation() {
            self.for_each(|h| desc.deactivate(h));
        }
    }

    pub fn cleanup(&self, desc: &dyn SynthDescriptor) {
        self.for_each(|h| desc.cleanup(h));
    }
}

/// A plugin label is already held exclusively by another instance.
#[derive(Debug)]
pub struct ExclusiveLabelError {
    pub label: String,
}

impl std::fmt::Display for ExclusiveLabelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "plugin '{}' uses a global instance and can't be loaded more than once",
            self.label
        )
    }
}

impl std::error::Error for ExclusiveLabelError {}

/// Host-owned registry of labels that must stay unique per process.
///
/// Plugins exposing only the batched multi-instance run entry keep global
/// state; the host creates one registry and threads it through every adapter
/// it constructs, borrowing a [`ExclusivePermit`] per loaded label.
#[derive(Default)]
pub struct ExclusiveRegistry {
    labels: Mutex<HashMap<String, u32>>,
}

impl ExclusiveRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(
        self: &Arc<Self>,
        label: &str,
    ) -> Result<ExclusivePermit, ExclusiveLabelError> {
        let mut labels = self
            .labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = labels.entry(label.to_string()).or_insert(0);
        if *count > 0 {
            return Err(ExclusiveLabelError {
                label: label.to_string(),
            });
        }
        *count += 1;
        Ok(ExclusivePermit {
            registry: Arc::clone(self),
            label: label.to_string(),
        })
    }

    pub fn is_held(&self, label: &str) -> bool {
        self.labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .is_some_and(|&c| c > 0)
    }

    fn release(&self, label: &str) {
        let mut labels = self
            .labels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = labels.get_mut(label) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                labels.remove(label);
            }
        }
    }
}

/// Borrowed exclusivity for one label; returned to the registry on drop.
pub struct ExclusivePermit {
    registry: Arc<ExclusiveRegistry>,
    label: String,
}

impl std::fmt::Debug for ExclusivePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusivePermit").field("label", &self.label).finish_non_exhaustive()
    }
}

impl Drop for ExclusivePermit {
    fn drop(&mut self) {
        self.registry.release(&self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;

    fn handle(n: usize) -> PluginHandle {
        PluginHandle(n as *mut c_void)
    }

    #[test]
    fn mono_shape() {
        let inst = Instances::Mono(handle(1));
        assert_eq!(inst.count(), 1);
        assert!(!inst.is_stereo());
        assert_eq!(inst.secondary(), None);
        let (arr, n) = inst.raw();
        assert_eq!(n, 1);
        assert_eq!(arr[0], handle(1));
    }

    #[test]
    fn stereo_visits_both_handles() {
        let inst = Instances::Stereo(handle(1), handle(2));
        let mut seen = Vec::new();
        inst.for_each(|h| seen.push(h));
        assert_eq!(seen, vec![handle(1), handle(2)]);
        let (arr, n) = inst.raw();
        assert_eq!(&arr[..n], &[handle(1), handle(2)]);
    }

    #[test]
    fn permit_is_exclusive_until_dropped() {
        let registry = ExclusiveRegistry::new();
        let permit = registry.acquire("xsynth").unwrap();
        assert!(registry.is_held("xsynth"));

        let err = registry.acquire("xsynth").unwrap_err();
        assert_eq!(err.label, "xsynth");

        // Different labels are independent.
        let other = registry.acquire("ysynth").unwrap();
        drop(other);

        drop(permit);
        assert!(!registry.is_held("xsynth"));
        let _again = registry.acquire("xsynth").unwrap();
    }
}
