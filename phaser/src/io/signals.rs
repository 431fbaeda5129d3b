//! Termination signals sent to the controller reach its in-flight child.
//!
//! Children run in their own process group, so a terminal interrupt or a
//! plain `kill <controller>` would otherwise leave the agent running.

#[cfg(unix)]
mod imp {
    use std::path::Path;
    use std::process;
    use std::thread::{self, JoinHandle};

    use anyhow::{Context, Result};
    use nix::sys::signal::Signal;
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::{Handle, Signals};
    use tracing::{debug, warn};

    use crate::io::process::{remove_pgid_marker, signal_recorded_group};

    /// Kills the process group recorded in the pgid marker, then exits the
    /// controller, when SIGINT, SIGTERM or SIGHUP arrives. Uninstalled on drop.
    pub struct SignalForwarder {
        handle: Handle,
        thread: Option<JoinHandle<()>>,
    }

    impl SignalForwarder {
        pub fn install(child_pgid_path: &Path) -> Result<Self> {
            let mut signals =
                Signals::new([SIGINT, SIGTERM, SIGHUP]).context("install signal handlers")?;
            let handle = signals.handle();
            let marker = child_pgid_path.to_path_buf();
            let thread = thread::spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    warn!(signal, "controller interrupted; killing in-flight child");
                    signal_recorded_group(&marker, Signal::SIGKILL);
                    remove_pgid_marker(&marker);
                    process::exit(128 + signal);
                }
            });
            debug!("signal forwarding installed");
            Ok(Self {
                handle,
                thread: Some(thread),
            })
        }
    }

    impl Drop for SignalForwarder {
        fn drop(&mut self) {
            self.handle.close();
            if let Some(thread) = self.thread.take()
                && thread.join().is_err()
            {
                warn!("signal forwarding thread panicked");
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::path::Path;

    use anyhow::Result;

    /// No-op: children are not grouped off from the controller here.
    pub struct SignalForwarder;

    impl SignalForwarder {
        pub fn install(_child_pgid_path: &Path) -> Result<Self> {
            Ok(Self)
        }
    }
}

pub use imp::SignalForwarder;
