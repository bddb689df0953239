use std::sync::atomic::{AtomicU32, Ordering};

/// Per-connection allocator of message serials.
///
/// Serials start at 1, increase by one per call and skip 0 on wrap-around.
/// The counter is atomic, so one instance can be shared by every sender on a
/// connection without extra locking.
#[derive(Debug)]
pub struct SerialCounter {
    next: AtomicU32,
}

impl SerialCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start at `first`; zero is treated as 1.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    /// Allocate the next serial.
    pub fn next_serial(&self) -> u32 {
        let step = |current: u32| Some(current.checked_add(1).unwrap_or(1));
        match self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, step) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// The serial the next call will return, without allocating it.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SerialCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn starts_at_one_and_increments() {
        let counter = SerialCounter::new();
        assert_eq!(counter.next_serial(), 1);
        assert_eq!(counter.next_serial(), 2);
        assert_eq!(counter.peek(), 3);
    }

    #[test]
    fn wraps_past_zero() {
        let counter = SerialCounter::starting_at(u32::MAX);
        assert_eq!(counter.next_serial(), u32::MAX);
        assert_eq!(counter.next_serial(), 1);
        assert_eq!(SerialCounter::starting_at(0).next_serial(), 1);
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        let counter = Arc::new(SerialCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || (0..250).map(|_| counter.next_serial()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for serial in handle.join().unwrap() {
                assert!(seen.insert(serial), "serial {serial} allocated twice");
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
