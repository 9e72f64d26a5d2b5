//! Cooperative signal flags.
//!
//! The handlers only flip process-wide atomics; the engines poll them
//! between files, chunks and multichunks and wind down cleanly. SIGINT
//! requests an orderly stop (the current file is finished and whatever is
//! consistent gets committed); SIGUSR2 requests a one-shot memory
//! statistics dump at the next safe point.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Error;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static DUMP_STATS: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signal: libc::c_int) {
    match signal {
        libc::SIGINT => EXIT_REQUESTED.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => DUMP_STATS.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Install the SIGINT/SIGUSR2 handlers.
pub fn install() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGUSR2, &action)?;
    }
    Ok(())
}

/// Whether an orderly stop was requested.
pub fn exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::SeqCst)
}

/// Consume a pending stats-dump request.
pub fn take_dump_request() -> bool {
    DUMP_STATS.swap(false, Ordering::SeqCst)
}
