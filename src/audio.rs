use std::mem::MaybeUninit;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Receiver;

use crate::plugin::{DssiPlugin, HostEvent, HostEventQueue, NativeEventBuffer};

/// Maximum number of audio ports supported (for stack-allocated reference arrays).
const MAX_PORTS: usize = 16;

/// Build `&mut [&mut [f32]]` on the stack from `&mut [Vec<f32>]`.
///
/// # Panics
/// Panics if `bufs.len() > MAX_PORTS`.
fn mut_slices<'a>(
    bufs: &'a mut [Vec<f32>],
    storage: &'a mut [MaybeUninit<&'a mut [f32]>; MAX_PORTS],
) -> &'a mut [&'a mut [f32]] {
    let n = bufs.len();
    assert!(n <= MAX_PORTS);
    for (i, buf) in bufs.iter_mut().enumerate() {
        storage[i].write(buf.as_mut_slice());
    }
    // SAFETY: first `n` elements are initialized. MaybeUninit<T> is #[repr(transparent)].
    unsafe { std::slice::from_raw_parts_mut(storage.as_mut_ptr().cast(), n) }
}

/// Build `&[&[f32]]` on the stack from `&[Vec<f32>]`.
///
/// # Panics
/// Panics if `bufs.len() > MAX_PORTS`.
fn shared_slices<'a>(
    bufs: &'a [Vec<f32>],
    storage: &'a mut [MaybeUninit<&'a [f32]>; MAX_PORTS],
) -> &'a [&'a [f32]] {
    let n = bufs.len();
    assert!(n <= MAX_PORTS);
    for (i, buf) in bufs.iter().enumerate() {
        storage[i].write(buf.as_slice());
    }
    // SAFETY: first `n` elements are initialized. MaybeUninit<T> is #[repr(transparent)].
    unsafe { std::slice::from_raw_parts(storage.as_ptr().cast(), n) }
}

pub struct AudioEngine {
    stream: cpal::Stream,
}

impl AudioEngine {
    /// Stop the audio stream. Call this before dropping the adapter.
    pub fn stop(self) {
        if let Err(e) = self.stream.pause() {
            log::warn!("Failed to pause audio stream: {e}");
        }
        // Give the audio callback time to finish if it's mid-flight
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(self.stream);
        log::info!("Audio stream stopped");
    }

    pub fn start(
        plugin: Arc<DssiPlugin>,
        event_rx: Receiver<HostEvent>,
        device_name: Option<&str>,
        sample_rate: u32,
        buffer_size: u32,
    ) -> anyhow::Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            host.output_devices()?
                .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
                .ok_or_else(|| anyhow::anyhow!("Audio device not found: {name}"))?
        } else {
            host.default_output_device()
                .ok_or_else(|| anyhow::anyhow!("No default audio output device"))?
        };

        let dev_name = device.name().unwrap_or_else(|_| "Unknown".into());
        log::info!("Using audio device: {dev_name}");

        let in_ports = plugin.audio_in_count();
        let out_ports = plugin.audio_out_count();
        let num_channels = out_ports.clamp(1, 2);

        let config = cpal::StreamConfig {
            channels: num_channels as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_size),
        };

        log::info!(
            "Audio config: {num_channels}ch, {sample_rate}Hz, buffer={buffer_size} \
             (plugin: {in_ports} in, {out_ports} out)"
        );

        // Pre-allocate everything the callback reuses; the block path must
        // not allocate.
        let mut events: Vec<HostEvent> = Vec::with_capacity(256);
        let mut events_out = HostEventQueue::with_capacity(256);
        let mut scratch = NativeEventBuffer::new();
        // This demo host has no audio capture: plugin inputs get silence.
        let in_bufs: Vec<Vec<f32>> = vec![vec![0.0; buffer_size as usize]; in_ports];
        let mut out_bufs: Vec<Vec<f32>> =
            vec![vec![0.0; buffer_size as usize]; out_ports.max(1)];

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / num_channels;

                events.clear();
                while let Ok(event) = event_rx.try_recv() {
                    if events.len() < events.capacity() {
                        events.push(event);
                    }
                }

                for buf in out_bufs.iter_mut() {
                    buf.resize(frames, 0.0);
                }
                events_out.clear();

                {
                    let mut in_storage = [const { MaybeUninit::uninit() }; MAX_PORTS];
                    let mut out_storage = [const { MaybeUninit::uninit() }; MAX_PORTS];
                    let in_refs = shared_slices(&in_bufs, &mut in_storage);
                    let out_refs = mut_slices(&mut out_bufs, &mut out_storage);

                    plugin.process(
                        in_refs,
                        out_refs,
                        frames as u32,
                        &events,
                        &mut events_out,
                        &mut scratch,
                    );
                }

                // Interleave into the device buffer; a mono plugin feeds
                // every device channel.
                for frame in 0..frames {
                    for ch in 0..num_channels {
                        let src = ch.min(out_bufs.len() - 1);
                        data[frame * num_channels + ch] = out_bufs[src][frame];
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {err}");
            },
            None,
        )?;

        stream.play()?;
        log::info!("Audio stream started");

        Ok(AudioEngine { stream })
    }
}
