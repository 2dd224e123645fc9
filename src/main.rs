mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use cli::{Cli, Command, PlayArgs};

use rivet::plugin::library::PluginLibrary;
use rivet::plugin::model::ParameterKind;
use rivet::plugin::{DssiPlugin, ExclusiveRegistry, HostConfig, HostEvent, Notification};
use rivet::{audio, midi, session};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Describe { plugin, label } => describe(&plugin, label.as_deref()),
        Command::Play(args) => play(args),
    }
}

fn describe(path: &str, label: Option<&str>) -> anyhow::Result<()> {
    let library = PluginLibrary::load(Path::new(path), label)?;
    let registry = ExclusiveRegistry::new();
    let plugin = DssiPlugin::new(library, &registry, HostConfig::default())?;

    println!("{} ({})", plugin.name(), plugin.label());
    println!("  Maker:         {}", plugin.maker());
    let hints = plugin.hints();
    println!(
        "  Type:          {}",
        if hints.is_synth { "instrument" } else { "effect" }
    );
    println!("  Audio inputs:  {}", plugin.audio_in_count());
    println!("  Audio outputs: {}", plugin.audio_out_count());
    println!("  Latency:       {} frames", plugin.latency());
    println!(
        "  Capabilities:  dry/wet={} volume={} balance={} rt-safe={}",
        hints.can_dry_wet, hints.can_volume, hints.can_balance, hints.is_rt_safe
    );
    println!("  Options:       {:#05x}", plugin.options().bits());

    println!("  Parameters:    {}", plugin.parameter_count());
    for i in 0..plugin.parameter_count() {
        let slot = plugin.parameter(i).unwrap();
        let name = plugin.parameter_name(i).unwrap_or_default();
        let kind = match slot.kind {
            ParameterKind::Input => "in ",
            ParameterKind::Output => "out",
            ParameterKind::Latency => "lat",
            ParameterKind::SampleRate => "sr ",
            ParameterKind::Unknown => "?  ",
        };
        let cc = slot
            .midi_cc
            .map(|cc| format!(" cc={cc}"))
            .unwrap_or_default();
        println!(
            "    [{i}] {kind} {name} (min={}, max={}, default={}{cc})",
            slot.range.min, slot.range.max, slot.range.def
        );
    }

    let programs = plugin.program_entries();
    if programs.is_empty() {
        println!("  Programs:      (none)");
    } else {
        println!("  Programs:      {}", programs.len());
        for (i, p) in programs.iter().enumerate() {
            println!("    [{i}] {}:{} {}", p.bank, p.program, p.name);
        }
    }

    Ok(())
}

fn play(args: PlayArgs) -> anyhow::Result<()> {
    let config = session::load(&args.session)?;
    let session_dir = Path::new(&args.session)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let plugin_path = session::resolve_plugin_path(&config.plugin.path, session_dir);

    let library = PluginLibrary::load(&plugin_path, config.plugin.label.as_deref())?;

    let (event_tx, event_rx) = crossbeam_channel::bounded::<HostEvent>(1024);
    let (notify_tx, notify_rx) = crossbeam_channel::bounded::<Notification>(256);

    let registry = ExclusiveRegistry::new();
    let plugin = Arc::new(DssiPlugin::new(
        library,
        &registry,
        HostConfig {
            sample_rate: args.sample_rate,
            buffer_size: args.buffer_size,
            options: config.plugin.options.to_options(),
            ctrl_channel: config.plugin.control_channel,
            ui_binary: None,
            notifications: Some(notify_tx),
        },
    )?);
    log::info!("Loaded plugin: {}", plugin.name());

    // Apply session overrides before the audio thread starts.
    if let Some(program) = config.plugin.program {
        plugin.set_program(program)?;
    }
    for (name, &value) in &config.plugin.params {
        let index = (0..plugin.parameter_count())
            .find(|&i| plugin.parameter_name(i).as_deref() == Some(name.as_str()));
        match index {
            Some(i) => {
                let fixed = plugin.set_parameter_value(i, value)?;
                log::info!("Set '{name}' = {fixed}");
            }
            None => log::warn!("Unknown parameter '{name}' in session file"),
        }
    }

    plugin.activate();

    let mut midi_mgr = midi::MidiManager::new(event_tx, args.midi_device.clone());
    midi_mgr.open_ports()?;
    log::info!("MIDI inputs connected: {}", midi_mgr.connection_count());

    let engine = audio::AudioEngine::start(
        Arc::clone(&plugin),
        event_rx,
        args.audio_device.as_deref(),
        args.sample_rate,
        args.buffer_size,
    )?;

    // Quit on Enter; audio keeps running meanwhile.
    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = quit_tx.send(());
    });

    log::info!("Playing. Press Enter to stop.");
    let mut last_poll = Instant::now();

    loop {
        if quit_rx.try_recv().is_ok() {
            break;
        }

        // Apply deferred program switches and surface notifications.
        plugin.dispatch_deferred();
        while let Ok(notification) = notify_rx.try_recv() {
            match notification {
                Notification::ProgramChanged(index) => log::info!("Program -> {index}"),
                Notification::ParameterChanged { index, value } => {
                    log::debug!("Parameter {index} -> {value}")
                }
                other => log::debug!("{other:?}"),
            }
        }

        if last_poll.elapsed() >= Duration::from_secs(1) {
            midi_mgr.poll_new_devices();
            last_poll = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    log::info!("Stopping...");

    // Shutdown order matters: stop audio first (so the callback can't call
    // into the plugin), then drop MIDI connections, then the adapter.
    engine.stop();
    drop(midi_mgr);
    plugin.deactivate();

    Ok(())
}
