use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the environment is currently active (e.g. visible or focused).
///
/// Retries only continue and interval refetches only run while the probe reports
/// active, unless a query opts into background refetching.
pub trait ActivityProbe: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Probe that is always active. Used when no probe is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysActive;

impl ActivityProbe for AlwaysActive {
    fn is_active(&self) -> bool {
        true
    }
}

/// Probe backed by a flag that a focus or visibility watcher can toggle.
#[derive(Debug)]
pub struct ActivityFlag {
    active: AtomicBool,
}

impl ActivityFlag {
    pub fn new(active: bool) -> Self {
        ActivityFlag {
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl Default for ActivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ActivityProbe for ActivityFlag {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
