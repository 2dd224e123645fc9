//! Real-time safe host adapter for DSSI/LADSPA instrument plugins.
//!
//! The [`plugin`] module is the product: it loads a plugin binary, discovers
//! its ports and parameters, and drives per-block processing with
//! sample-accurate event delivery, dual-mono stereo forcing, and
//! dry/wet/volume/balance post-processing. [`audio`], [`midi`], and
//! [`session`] are the demo host driver around it.

pub mod audio;
pub mod midi;
pub mod plugin;
pub mod session;
