//! phaselock: run a tempo-locked sequencer session against an in-memory DAC

mod config;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use crossbeam_channel::Receiver;
use phaselock_core::TempoClock;
use phaselock_services::{Coordinator, DriftReport, LoopEvent, MemoryDac, Scheduler, SinkHandle};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::SessionConfig;

const EVENT_BUFFER: usize = 1024;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("phaselock=info".parse()?),
        )
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let session = config::load_config(path.as_deref()).context("loading session")?;
    info!(
        bpm = session.bpm,
        loops = session.loops.len(),
        mode = ?session.mode,
        run_beats = session.run_beats,
        "Starting phaselock session"
    );

    run_session(&session)
}

fn run_session(session: &SessionConfig) -> anyhow::Result<()> {
    let clock = Arc::new(TempoClock::new(session.bpm)?);
    let dac = MemoryDac::new(session.dac.vref)?
        .with_default_channel(session.dac.default_channel)?;
    let monitor = dac.monitor();
    let sink = SinkHandle::new(dac);

    let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_BUFFER);
    let mut coordinator = Coordinator::new(clock.clone(), sink);
    for loop_config in &session.loops {
        let sequencer = loop_config
            .build(&clock)
            .with_context(|| format!("building loop {}", loop_config.name()))?
            .with_events(events_tx.clone());
        coordinator.add_loop(sequencer);
    }
    // Loops own the remaining senders; the logger ends once they stop
    drop(events_tx);
    let logger = thread::Builder::new()
        .name("events".into())
        .spawn(move || log_events(events_rx))?;

    let mut handle = coordinator.spawn(session.mode)?;
    let scheduler = Scheduler::blocking(clock.clone(), handle.cancellation());

    if let Some(change) = session.tempo_change {
        scheduler.block_until_beat(change.at_beat)?;
        clock.change_tempo(change.bpm, change.smooth)?;
        info!(
            bpm = change.bpm,
            smooth = change.smooth,
            beat = clock.current_beat(),
            "Tempo changed"
        );
    }
    scheduler.block_until_beat(session.run_beats)?;

    let reports = handle.stop()?;
    if logger.join().is_err() {
        warn!("Event logger panicked");
    }

    info!(
        beat = clock.current_beat(),
        bar = clock.current_bar(session.beats_per_bar)?,
        dac_writes = monitor.writes(),
        "Session finished"
    );

    let mut summary: BTreeMap<String, DriftReport> = BTreeMap::new();
    for report in reports {
        info!(
            loop_name = %report.name,
            iterations = report.iterations,
            triggers = report.triggers,
            sink_failures = report.sink_failures,
            reason = ?report.stop_reason,
            "Loop report"
        );
        summary.insert(report.name.to_string(), report.drift);
    }
    println!("{}", toml::to_string(&summary)?);
    Ok(())
}

fn log_events(events: Receiver<LoopEvent>) {
    for event in events {
        match event {
            LoopEvent::Tick {
                loop_name,
                beat,
                index,
            } => info!(loop_name = %loop_name, beat = %format!("{beat:.2}"), index, "Tick"),
            LoopEvent::Trigger {
                loop_name,
                beat,
                index,
                value,
            } => info!(
                loop_name = %loop_name,
                beat = %format!("{beat:.2}"),
                index,
                value,
                "Trigger"
            ),
            LoopEvent::Sample {
                loop_name,
                beat,
                wave_position,
                amplitude,
                voltage,
            } => info!(
                loop_name = %loop_name,
                beat = %format!("{beat:.2}"),
                wave_position = %format!("{wave_position:.2}"),
                amplitude = %format!("{amplitude:.3}"),
                voltage = %format!("{voltage:.2}"),
                "Sample"
            ),
            LoopEvent::SinkFailure {
                loop_name,
                beat,
                error,
            } => warn!(loop_name = %loop_name, beat, error = %error, "Sink failure"),
            LoopEvent::Stopped {
                loop_name,
                iterations,
            } => debug!(loop_name = %loop_name, iterations, "Loop stopped"),
        }
    }
}
