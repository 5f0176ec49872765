//! Change notification with change-block coalescing.
//!
//! Several core models (`EventList`, `Track`, `TrackList`, `Transport`,
//! `PatchBay`) publish a notification on every mutation but must coalesce a
//! burst of mutations performed inside a "change block" into a single
//! notification fired on release. The depth counter is per object, matching
//! the source's behavior exactly (tests depend on a single notification
//! firing at release).

/// Per-object change-block depth counter. `mark()` reports whether a
/// notification should fire immediately (no block open); `enter`/`leave`
/// manage nested blocks and `leave` reports whether the release should fire
/// a coalesced notification.
#[derive(Debug, Default)]
pub struct ChangeBlock {
    depth: u32,
    pending: bool,
}

impl ChangeBlock {
    pub fn enter(&mut self) {
        self.depth += 1;
    }

    /// Returns true if a coalesced notification should fire now.
    pub fn leave(&mut self) -> bool {
        assert!(self.depth > 0, "unbalanced change-block leave");
        self.depth -= 1;
        if self.depth == 0 && self.pending {
            self.pending = false;
            true
        } else {
            false
        }
    }

    /// Record a change. Returns true if it should fire immediately.
    pub fn mark(&mut self) -> bool {
        if self.depth == 0 {
            true
        } else {
            self.pending = true;
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.depth > 0
    }
}

/// Observer list plus a [`ChangeBlock`]. Embed one per observable model.
pub struct Notifier {
    change: ChangeBlock,
    observers: Vec<Box<dyn FnMut() + Send>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier {
            change: ChangeBlock::default(),
            observers: Vec::new(),
        }
    }
}

impl Notifier {
    pub fn subscribe(&mut self, observer: impl FnMut() + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn begin_change(&mut self) {
        self.change.enter();
    }

    pub fn end_change(&mut self) {
        if self.change.leave() {
            self.fire();
        }
    }

    /// Record a mutation; fires immediately unless a change block is open.
    pub fn notify(&mut self) {
        if self.change.mark() {
            self.fire();
        }
    }

    fn fire(&mut self) {
        for observer in self.observers.iter_mut() {
            observer();
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("change", &self.change)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
    use std::sync::Arc;

    #[test]
    fn fires_once_per_unblocked_change() {
        let count = Arc::new(AtomicU32::new(0));
        let mut n = Notifier::default();
        let c = count.clone();
        n.subscribe(move || {
            c.fetch_add(1, SeqCst);
        });
        n.notify();
        n.notify();
        assert_eq!(2, count.load(SeqCst));
    }

    #[test]
    fn coalesces_inside_change_block() {
        let count = Arc::new(AtomicU32::new(0));
        let mut n = Notifier::default();
        let c = count.clone();
        n.subscribe(move || {
            c.fetch_add(1, SeqCst);
        });
        n.begin_change();
        n.notify();
        n.notify();
        n.notify();
        assert_eq!(0, count.load(SeqCst));
        n.end_change();
        assert_eq!(1, count.load(SeqCst));
    }

    #[test]
    fn nested_blocks_fire_only_on_outermost_release() {
        let count = Arc::new(AtomicU32::new(0));
        let mut n = Notifier::default();
        let c = count.clone();
        n.subscribe(move || {
            c.fetch_add(1, SeqCst);
        });
        n.begin_change();
        n.begin_change();
        n.notify();
        n.end_change();
        assert_eq!(0, count.load(SeqCst));
        n.end_change();
        assert_eq!(1, count.load(SeqCst));
    }
}
