//! Single-occupancy command rendezvous.
//!
//! The wire protocol carries no request identifiers: a response is matched
//! to its request purely by source address, so the controller allows exactly
//! one command in flight. The slot is that serialization point: callers
//! acquire it, arm it with the expected response address, transmit, and wait
//! for the receive path to post the matching payload.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

#[derive(Default)]
struct SlotState {
    /// A caller owns the slot.
    busy: bool,
    /// The slot is armed to capture a response.
    active: bool,
    /// Source address the response must carry.
    expect: u8,
    /// A response has been captured and not yet consumed.
    posted: bool,
    response: Vec<u8>,
}

pub(crate) struct CommandSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl CommandSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
        }
    }

    /// Take exclusive ownership of the slot, waiting until `deadline` for
    /// the current holder to release it. `None` means the deadline fired
    /// first.
    pub fn acquire(&self, deadline: Instant) -> Option<SlotGuard<'_>> {
        let mut st = self.state.lock().unwrap();
        while st.busy {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        st.busy = true;
        Some(SlotGuard { slot: self })
    }

    /// Deliver a response payload from `src`. Consumed only when the slot is
    /// armed for that address and has not been signaled yet.
    pub fn post(&self, src: u8, payload: &[u8]) -> bool {
        let mut st = self.state.lock().unwrap();
        if !st.active || st.posted || st.expect != src {
            return false;
        }
        st.response.clear();
        st.response.extend_from_slice(payload);
        st.posted = true;
        self.cond.notify_all();
        true
    }
}

/// Ownership of the slot for one command. Dropping releases the slot and
/// wakes contending callers.
pub(crate) struct SlotGuard<'a> {
    slot: &'a CommandSlot,
}

impl SlotGuard<'_> {
    /// Arm the slot for a response from `expect`. `scratch` is reused as the
    /// response buffer.
    pub fn activate(&self, expect: u8, mut scratch: Vec<u8>) {
        scratch.clear();
        let mut st = self.slot.state.lock().unwrap();
        st.active = true;
        st.expect = expect;
        st.posted = false;
        st.response = scratch;
    }

    /// Wait until a response is posted or `deadline` fires. `None` means no
    /// response arrived in time.
    pub fn wait(&self, deadline: Instant) -> Option<Vec<u8>> {
        let mut st = self.slot.state.lock().unwrap();
        while !st.posted {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.slot.cond.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        st.posted = false;
        st.active = false;
        Some(std::mem::take(&mut st.response))
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.slot.state.lock().unwrap();
        st.busy = false;
        st.active = false;
        st.posted = false;
        self.slot.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn posted_response_is_returned() {
        let slot = CommandSlot::new();
        let guard = slot.acquire(soon()).unwrap();
        guard.activate(0x05, Vec::new());

        assert!(slot.post(0x05, &[1, 2, 3]));
        assert_eq!(guard.wait(soon()), Some(vec![1, 2, 3]));
    }

    #[test]
    fn response_from_another_address_is_ignored() {
        let slot = CommandSlot::new();
        let guard = slot.acquire(soon()).unwrap();
        guard.activate(0x05, Vec::new());

        assert!(!slot.post(0x06, &[1, 2, 3]));
        assert_eq!(guard.wait(soon()), None);
    }

    #[test]
    fn post_without_an_armed_slot_is_ignored() {
        let slot = CommandSlot::new();
        assert!(!slot.post(0x05, &[1]));

        let guard = slot.acquire(soon()).unwrap();
        // Acquired but not armed yet.
        assert!(!slot.post(0x05, &[1]));
        drop(guard);
    }

    #[test]
    fn only_the_first_response_is_kept() {
        let slot = CommandSlot::new();
        let guard = slot.acquire(soon()).unwrap();
        guard.activate(0x05, Vec::new());

        assert!(slot.post(0x05, &[1]));
        assert!(!slot.post(0x05, &[2]));
        assert_eq!(guard.wait(soon()), Some(vec![1]));
    }

    #[test]
    fn contending_callers_serialize() {
        let slot = Arc::new(CommandSlot::new());
        let (held_tx, held_rx) = std::sync::mpsc::channel();

        let holder = {
            let slot = slot.clone();
            thread::spawn(move || {
                let guard = slot.acquire(soon()).unwrap();
                guard.activate(0x02, Vec::new());
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                drop(guard);
            })
        };

        held_rx.recv().unwrap();
        // A short deadline fires while the first caller holds the slot.
        assert!(slot.acquire(Instant::now() + Duration::from_millis(5)).is_none());
        // A generous one succeeds once it is released.
        let guard = slot.acquire(Instant::now() + Duration::from_secs(2)).unwrap();
        drop(guard);

        holder.join().unwrap();
    }
}
