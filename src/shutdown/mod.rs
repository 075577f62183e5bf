use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use signal_hook::SigId;
#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;

/// Watches SIGINT/SIGTERM and exposes them as a flag the main loop polls.
pub struct ShutdownHooks {
    requested: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

/// Cloneable handle that requests shutdown without a signal.
#[derive(Clone)]
pub struct ShutdownTrigger {
    requested: Arc<AtomicBool>,
}

impl ShutdownTrigger {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let requested = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let sig_ids = [SIGINT, SIGTERM]
                .into_iter()
                .map(|signal| flag::register(signal, Arc::clone(&requested)))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Self { requested, sig_ids })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { requested })
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            requested: Arc::clone(&self.requested),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
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
