//! Ctrl+C handling: the first SIGINT stops the running session, the second
//! exits immediately.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::session::LoopControl;

/// Global interrupt flag, registered once with SIGINT.
static INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Register the SIGINT handler. Only the first call registers.
pub fn register_signal_handler() -> Result<()> {
    if INTERRUPT_FLAG.get().is_some() {
        return Ok(());
    }
    let flag = INTERRUPT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)));

    // Runs before the flag handler below, so it only sees the flag set on a second Ctrl+C.
    let flag_clone = Arc::clone(flag);
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
            if flag_clone.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
        })?;
    }
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;

    Ok(())
}

pub fn is_interrupted() -> bool {
    INTERRUPT_FLAG
        .get()
        .map(|f| f.load(Ordering::SeqCst))
        .unwrap_or(false)
}

pub fn clear_interrupt() {
    if let Some(flag) = INTERRUPT_FLAG.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

/// Poll the interrupt flag every 100 ms.
pub async fn wait_for_interrupt() {
    while !is_interrupted() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Stop `control`'s session on Ctrl+C. The task ends with the session.
pub fn stop_on_interrupt(control: LoopControl) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_interrupt() => {
                eprintln!("\nInterrupted, stopping session (Ctrl+C again to force exit)");
                control.stop();
            }
            _ = control.stopped() => {}
        }
    })
}
