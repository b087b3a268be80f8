//! In-memory serial link for exercising the PHY and the controller without
//! hardware.

use crate::phy::SerialLink;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct LinkState {
    readable: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    fail_writes: bool,
    closed: bool,
}

/// A scripted serial line: every write records the frame and makes the next
/// scripted reply readable, mimicking a device answering a command.
#[derive(Clone, Default)]
pub(crate) struct ScriptedLink {
    state: Arc<(Mutex<LinkState>, Condvar)>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a wire frame that becomes readable after the next write.
    pub fn push_reply(&self, frame: Vec<u8>) {
        self.state.0.lock().unwrap().replies.push_back(frame);
    }

    /// Make bytes readable immediately, without a triggering write.
    pub fn push_readable(&self, bytes: &[u8]) {
        let (lock, cond) = &*self.state;
        lock.lock().unwrap().readable.extend(bytes);
        cond.notify_all();
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self) {
        self.state.0.lock().unwrap().fail_writes = true;
    }

    /// Frames written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.0.lock().unwrap().written.clone()
    }

    /// Simulate the port going away: reads return end-of-file.
    pub fn close(&self) {
        let (lock, cond) = &*self.state;
        lock.lock().unwrap().closed = true;
        cond.notify_all();
    }
}

impl SerialLink for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock().unwrap();
        if st.readable.is_empty() && !st.closed {
            let (guard, _) = cond
                .wait_timeout(st, Duration::from_millis(10))
                .unwrap();
            st = guard;
        }
        if !st.readable.is_empty() {
            let mut n = 0;
            while n < buf.len() {
                match st.readable.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            return Ok(n);
        }
        if st.closed {
            return Ok(0);
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock().unwrap();
        if st.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        st.written.push(buf.to_vec());
        if let Some(reply) = st.replies.pop_front() {
            st.readable.extend(reply);
            cond.notify_all();
        }
        Ok(())
    }

    fn set_rate(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_break(&mut self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }
}

/// Encode a device-side frame as it appears on the wire, scrambled with
/// `seed`.
pub(crate) fn device_frame(src: u8, dst: u8, payload: &[u8], seed: u8) -> Vec<u8> {
    let mut scrambled = payload.to_vec();
    crate::phy::scramble(seed, &mut scrambled);
    let mut buf = Vec::new();
    crate::phy::encode_frame(&mut buf, src, dst, seed, &scrambled);
    buf
}

/// Parse one wire frame back into `(src, dst, payload)`. Panics on a
/// malformed frame; only meant for frames this crate produced.
pub(crate) fn decode_frame(wire: &[u8]) -> (u8, u8, Vec<u8>) {
    assert_eq!(wire[0], 0xAA, "missing start marker");
    let mut bytes = Vec::new();
    let mut i = 1;
    while i < wire.len() {
        if wire[i] == 0xAA {
            assert_eq!(wire[i + 1], 0xAA, "unescaped start marker inside frame");
            bytes.push(0xAA);
            i += 2;
        } else {
            bytes.push(wire[i]);
            i += 1;
        }
    }
    let (src, dst, len) = (bytes[0], bytes[1], usize::from(bytes[2]));
    let body = &bytes[3..3 + len + 2];
    let mut payload = body[1..len].to_vec();
    crate::phy::scramble(body[0], &mut payload);
    (src, dst, payload)
}
