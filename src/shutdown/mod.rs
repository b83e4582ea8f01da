use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Cloneable view of the shutdown flag handed to connection and housekeeping threads.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

pub struct ShutdownHooks {
    signal: ShutdownSignal,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    /// Routes SIGINT and SIGTERM into the returned hooks' shared flag.
    pub fn install() -> io::Result<Self> {
        let signal = ShutdownSignal::new();

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&signal.triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&signal.triggered))?;
            Ok(Self {
                signal,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { signal })
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.signal.is_triggered()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ShutdownSignal;

    #[test]
    fn clones_observe_the_same_flag() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_triggered());

        signal.trigger();
        assert!(observer.is_triggered());
    }
}
