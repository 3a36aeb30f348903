//! Global interrupt enable (the GIE bit of the status register) and the
//! critical-section primitive built on it.

/// Proof that interrupts were masked by [`InterruptState::acquire`], carrying
/// the GIE value to put back.
#[derive(Debug)]
#[must_use = "dropping the token leaves interrupts masked"]
pub struct RestoreToken {
    was_enabled: bool,
}

impl RestoreToken {
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

#[derive(Debug, Default)]
pub struct InterruptState {
    gie: bool,
    depth: u32,
    entries: u64,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `__bis_status_register(GIE)`
    pub fn enable(&mut self) {
        self.gie = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.gie
    }

    /// Nesting depth of currently open critical sections.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Total number of critical sections entered since reset.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Mask interrupts, remembering whether they were enabled.
    pub fn acquire(&mut self) -> RestoreToken {
        let token = RestoreToken {
            was_enabled: self.gie,
        };
        self.gie = false;
        self.depth += 1;
        self.entries += 1;
        token
    }

    /// Put GIE back to what it was when `token` was acquired.
    pub fn release(&mut self, token: RestoreToken) {
        self.depth = self.depth.saturating_sub(1);
        if token.was_enabled {
            self.gie = true;
        }
    }

    /// Run `f` with interrupts masked. The previous GIE value is restored on
    /// every exit path, including an early return from `f`.
    pub fn free<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let token = self.acquire();
        let r = f(self);
        self.release(token);
        r
    }
}
