//! Routes process interrupts into the session's cancellation token.

use log::{debug, info};
use sysaudio_core::{CancellationToken, CaptureError, StopReason};

#[cfg(unix)]
use signal_hook::consts::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::iterator::{Handle, Signals};
#[cfg(unix)]
use std::thread::{self, JoinHandle};

/// Forward a signal to the token. Only the first one stops the recording.
fn forward(token: &CancellationToken, signal: i32, name: &str) {
    if token.cancel(StopReason::Signal(signal)) {
        info!("Received {name}, stopping");
    } else {
        debug!("Received {name} while already stopping");
    }
}

/// Keeps the signal listener alive; dropping it unregisters the handlers.
#[cfg(unix)]
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

#[cfg(unix)]
pub fn install(token: CancellationToken) -> Result<SignalListener, CaptureError> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| CaptureError::io("register signal handlers", e))?;
    let handle = signals.handle();

    debug!("Signal handlers registered (SIGINT, SIGTERM)");
    let thread = thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    _ => continue,
                };
                forward(&token, sig, name);
            }
        })
        .map_err(|e| CaptureError::io("spawn signal thread", e))?;

    Ok(SignalListener {
        handle,
        thread: Some(thread),
    })
}

#[cfg(unix)]
impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Ctrl+C handler. `ctrlc` cannot unregister, so this holds nothing.
#[cfg(windows)]
pub struct SignalListener;

#[cfg(windows)]
pub fn install(token: CancellationToken) -> Result<SignalListener, CaptureError> {
    // Windows has no signal numbers; report Ctrl+C as SIGINT's value.
    const CTRL_C: i32 = 2;

    ctrlc::set_handler(move || forward(&token, CTRL_C, "Ctrl+C"))
        .map_err(|e| CaptureError::Io(format!("set Ctrl+C handler: {}", e)))?;
    debug!("Ctrl+C handler registered");
    Ok(SignalListener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_signal_stops() {
        let token = CancellationToken::new();
        forward(&token, 15, "SIGTERM");
        forward(&token, 2, "SIGINT");
        assert_eq!(token.reason(), Some(StopReason::Signal(15)));
    }

    #[cfg(unix)]
    #[test]
    fn raised_signal_cancels_token() {
        let token = CancellationToken::new();
        let listener = install(token.clone()).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let reason = token.wait_timeout(std::time::Duration::from_secs(2));
        assert_eq!(reason, Some(StopReason::Signal(SIGTERM)));

        drop(listener);
    }
}
