//! Thread signal-mask helper for non-restartable critical sections.
//!
//! The index rewrite formats and writes a whole text stream; interrupting it
//! midway would leave the file indeterminate, and stream-level writes cannot
//! be resumed the way a plain syscall can. The helper blocks every signal
//! except the fatal ones for the duration of the closure and restores the
//! caller's mask on every exit path, panics included.

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

/// Signals that must never be blocked: delivery is the only sane response.
const FATAL_SIGNALS: [Signal; 4] = [
    Signal::SIGABRT,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
];

/// Run `f` with all non-fatal signals blocked on the calling thread.
///
/// If installing the mask fails (it cannot on Linux for valid arguments),
/// `f` runs with the caller's mask unchanged; the operation itself is never
/// skipped.
pub fn with_signals_blocked<T>(f: impl FnOnce() -> T) -> T {
    let mut mask = SigSet::all();
    for signal in FATAL_SIGNALS {
        mask.remove(signal);
    }

    let mut saved = SigSet::empty();
    let installed =
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), Some(&mut saved)).is_ok();

    let _restore = MaskGuard {
        saved,
        active: installed,
    };
    f()
}

struct MaskGuard {
    saved: SigSet,
    active: bool,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None);
        }
    }
}
