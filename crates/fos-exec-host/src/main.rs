//! fOS Exec Host - Headless UI loop
//!
//! Drives a main looper the way a rendering host does: input arrives from a
//! producer thread, a worker pushes state onto the UI thread with
//! `run_blocking`, and each frame is scheduled behind a barrier so only the
//! asynchronous frame callback runs until it lifts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use fos_exec::{
    Dispatcher, IdleCallback, LooperConfig, MonotonicClock, Runnable, ThreadRegistry, UiDrain,
    WorkItem,
};

const MSG_INPUT: i32 = 1;
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// State owned by the UI thread
#[derive(Default)]
struct UiState {
    inputs: AtomicU64,
    frames: AtomicU64,
    idle_passes: AtomicU64,
    status: AtomicU64,
    frame_pending: AtomicBool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let frame_count: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("frame count must be a number")?,
        None => 30,
    };

    tracing::info!(frame_count, "Starting fOS Exec host...");

    let registry = Arc::new(ThreadRegistry::with_config(
        LooperConfig::ui(),
        Arc::new(MonotonicClock::new()),
    ));
    let main = registry.prepare_main()?;
    let state = Arc::new(UiState::default());

    // Input events are routed through the handler callback.
    let input_state = state.clone();
    let ui = Dispatcher::with_callback(&main, move |item: &WorkItem| {
        if item.what == MSG_INPUT {
            input_state.inputs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(x = item.arg1, y = item.arg2, "input");
            return true;
        }
        false
    });
    let frames = Dispatcher::new_async(&main);

    let idle_state = state.clone();
    main.queue().add_idle_callback(IdleCallback::new(move || {
        idle_state.idle_passes.fetch_add(1, Ordering::Relaxed);
        true
    }));

    let producer = {
        let messenger = ui.messenger();
        thread::Builder::new()
            .name("input".into())
            .spawn(move || -> fos_exec::Result<()> {
                for i in 0..10 {
                    let mut item = WorkItem::obtain();
                    item.what = MSG_INPUT;
                    item.arg1 = i * 10;
                    item.arg2 = i * 5;
                    if !messenger.send(item)? {
                        break;
                    }
                    thread::sleep(Duration::from_millis(7));
                }
                Ok(())
            })
            .context("failed to spawn input thread")?
    };

    let worker = {
        let ui = ui.clone();
        let state = state.clone();
        thread::Builder::new()
            .name("worker".into())
            .spawn(move || {
                for round in 1..=3u64 {
                    thread::sleep(Duration::from_millis(40));
                    let state = state.clone();
                    let applied = ui.run_blocking(
                        move || state.status.store(round, Ordering::Relaxed),
                        Duration::from_millis(500),
                    );
                    tracing::debug!(round, applied, "status pushed to UI thread");
                }
            })
            .context("failed to spawn worker thread")?
    };

    for frame in 0..frame_count {
        if !state.frame_pending.swap(true, Ordering::Relaxed) {
            let token = main.queue().post_barrier_now();
            let frame_state = state.clone();
            let queue_owner = main.clone();
            frames.post(Runnable::new(move || {
                frame_state.frames.fetch_add(1, Ordering::Relaxed);
                frame_state.frame_pending.store(false, Ordering::Relaxed);
                if let Err(error) = queue_owner.queue().remove_barrier(token) {
                    tracing::warn!(%error, "frame barrier already gone");
                }
            }))?;
        }

        if main.run_ui()? == UiDrain::Quit {
            break;
        }
        tracing::trace!(frame, "frame drained");
        thread::sleep(FRAME_INTERVAL);
    }

    producer
        .join()
        .map_err(|_| anyhow::anyhow!("input thread panicked"))??;
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;

    main.quit_safely()?;
    while main.run_ui()? != UiDrain::Quit {}

    tracing::info!(
        inputs = state.inputs.load(Ordering::Relaxed),
        frames = state.frames.load(Ordering::Relaxed),
        idle_passes = state.idle_passes.load(Ordering::Relaxed),
        status = state.status.load(Ordering::Relaxed),
        pool = ?fos_exec::WorkPool::global().stats(),
        "Host finished"
    );

    Ok(())
}
