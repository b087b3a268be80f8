//! # Bus PHY
//!
//! Owns the byte stream of the single-wire battery bus and implements the
//! low-level wire format: `0xAA`-delimited frames with byte stuffing, an
//! additive 16-bit checksum, and a per-packet seeded scrambler.
//!
//! The PHY reports upward through two callbacks installed by the bus
//! controller before the receive loop starts:
//!
//! - a packet handler, invoked for every frame with a valid checksum, and
//! - an optional presence handler, invoked for every byte received while no
//!   frame is in progress (idle-line activity hints that a device is alive).
//!
//! Frames with a bad checksum are dropped without notice; the framer
//! resynchronizes on the next `0xAA` start marker.

use crate::Error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Line rate of the battery bus (8N1, idle high).
pub const LINE_RATE: u32 = 9600;

/// Frame start marker. Any occurrence inside a frame is doubled on the wire.
const FRAME_START: u8 = 0xAA;

/// Seed transmitted when outgoing scrambling is disabled. Its keystream is
/// all zeros (`120 + 136 = 0 mod 256`, and every following step stays zero),
/// so receivers that descramble unconditionally still recover the plaintext.
const PLAIN_SEED: u8 = 120;

/// The length byte counts the payload plus the seed, so a frame carries at
/// most this many payload bytes.
const MAX_PAYLOAD: usize = 254;

/// Line rate used while emulating a break with null bytes.
const EMULATED_BREAK_RATE: u32 = 300;

/// One null byte at 300 baud holds the line low for roughly 30 ms; breaks
/// are emitted in steps of this length.
const EMULATED_BREAK_STEP: Duration = Duration::from_millis(70);

/// Byte stream the PHY runs on: an opened half-duplex serial line.
///
/// Reads must time out periodically (returning
/// [`std::io::ErrorKind::TimedOut`]) so the receive loop can observe
/// shutdown requests.
pub trait SerialLink: Send {
    /// Read available bytes into `buf`, blocking up to the link's read
    /// timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write `buf` as a single stream write.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Change the line rate.
    fn set_rate(&mut self, baud: u32) -> io::Result<()>;
    /// Drive (`true`) or release (`false`) a break condition on the line.
    fn set_break(&mut self, on: bool) -> io::Result<()>;
    /// An independent handle to the same line, so one half can read while
    /// the other writes.
    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// Callback for bytes received while the line is idle.
pub type PresenceHandler = Box<dyn Fn(u8) -> Result<(), Error> + Send + Sync>;

/// Callback for valid received packets: `(source, destination, payload)`.
pub type PacketHandler = Box<dyn Fn(u8, u8, &[u8]) -> Result<(), Error> + Send + Sync>;

/// Apply the payload scrambler in place.
///
/// The keystream starts at `seed + 136` and each subsequent byte is the
/// previous one plus the seed, XORed with the seed (all mod 256). The
/// transform is an involution: applying it twice restores the input.
pub(crate) fn scramble(seed: u8, buf: &mut [u8]) {
    let mut key = seed.wrapping_add(136);
    for b in buf.iter_mut() {
        *b ^= key;
        key = key.wrapping_add(seed) ^ seed;
    }
}

fn push_stuffed(buf: &mut Vec<u8>, sum: &mut u16, m: u8) {
    *sum = sum.wrapping_add(u16::from(m));
    if m == FRAME_START {
        buf.push(FRAME_START);
    }
    buf.push(m);
}

/// Assemble a complete wire frame into `buf`. `body` is the seed-scrambled
/// payload as it should appear on the stream.
pub(crate) fn encode_frame(buf: &mut Vec<u8>, src: u8, dst: u8, seed: u8, body: &[u8]) {
    buf.clear();
    buf.push(FRAME_START);
    let mut sum = 0u16;
    push_stuffed(buf, &mut sum, src);
    push_stuffed(buf, &mut sum, dst);
    push_stuffed(buf, &mut sum, (body.len() + 1) as u8);
    push_stuffed(buf, &mut sum, seed);
    for &m in body {
        push_stuffed(buf, &mut sum, m);
    }
    let total = sum;
    push_stuffed(buf, &mut sum, total as u8);
    push_stuffed(buf, &mut sum, (total >> 8) as u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Src,
    Dst,
    Len,
    Body,
}

/// Receive-side frame reassembly state.
struct Framer {
    state: RxState,
    escaped: bool,
    src: u8,
    dst: u8,
    want: usize,
    sum: u16,
    payload: Vec<u8>,
}

impl Framer {
    fn new() -> Self {
        Self {
            state: RxState::Idle,
            escaped: false,
            src: 0,
            dst: 0,
            want: 0,
            sum: 0,
            payload: Vec::new(),
        }
    }
}

enum BreakMode {
    /// The port can signal a real break condition.
    Hardware,
    /// Emulate a break by sending null bytes at 300 baud.
    Emulated,
}

struct TxState {
    link: Box<dyn SerialLink>,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    seed: u8,
}

/// The bus PHY. Construct one per serial line, hand it to the controller.
pub struct Phy {
    rx: Mutex<Box<dyn SerialLink>>,
    tx: Mutex<TxState>,
    closed: AtomicBool,
    break_mode: BreakMode,
    scramble_disabled: bool,
    on_presence: Option<PresenceHandler>,
    on_packet: Option<PacketHandler>,
}

impl Phy {
    /// Create a PHY on top of `link`. Probes once whether the port can
    /// signal a real break condition and falls back to emulating one at 300
    /// baud otherwise.
    pub fn new(link: Box<dyn SerialLink>) -> Result<Self, Error> {
        let mut tx_link = link.try_clone()?;

        let break_mode = match tx_link.set_break(true).and_then(|()| {
            thread::sleep(Duration::from_millis(10));
            tx_link.set_break(false)
        }) {
            Ok(()) => BreakMode::Hardware,
            Err(err) => {
                log::debug!("port cannot signal a break ({err}), emulating at {EMULATED_BREAK_RATE} baud");
                BreakMode::Emulated
            }
        };

        Ok(Self {
            rx: Mutex::new(link),
            tx: Mutex::new(TxState {
                link: tx_link,
                buf: Vec::new(),
                scratch: Vec::new(),
                seed: 0,
            }),
            closed: AtomicBool::new(false),
            break_mode,
            scramble_disabled: false,
            on_presence: None,
            on_packet: None,
        })
    }

    /// Send outgoing payloads verbatim with the self-canceling seed instead
    /// of scrambling them.
    pub fn set_scramble_disabled(&mut self, disabled: bool) {
        self.scramble_disabled = disabled;
    }

    /// Install the handler invoked for every valid received packet.
    pub fn set_packet_handler<F>(&mut self, handler: F)
    where
        F: Fn(u8, u8, &[u8]) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.on_packet = Some(Box::new(handler));
    }

    /// Install the handler invoked for bytes received while idle.
    pub fn set_presence_handler<F>(&mut self, handler: F)
    where
        F: Fn(u8) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.on_presence = Some(Box::new(handler));
    }

    /// Listen for packets on the line. Returns when the port errors, a
    /// callback errors, or [`Phy::close`] is called. The controller runs
    /// this on a dedicated thread.
    pub fn run(&self) -> Result<(), Error> {
        let mut link = self.rx.lock().unwrap();
        let mut framer = Framer::new();
        let mut buf = [0u8; 512];

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let n = match link.read(&mut buf) {
                Ok(0) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            for &m in &buf[..n] {
                self.feed(&mut framer, m)?;
            }
        }
    }

    /// Stop [`Phy::run`]. The receive loop observes the flag at its next
    /// read timeout.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn feed(&self, fr: &mut Framer, m: u8) -> Result<(), Error> {
        if !fr.escaped {
            if m == FRAME_START {
                fr.escaped = true;
                return Ok(());
            }
        } else {
            fr.escaped = false;
            if m != FRAME_START {
                // The unescaped 0xAA before `m` marked a frame start; `m`
                // itself is the source address of the new frame.
                fr.state = RxState::Src;
                fr.sum = 0;
            }
        }

        match fr.state {
            RxState::Idle => {
                if let Some(handler) = &self.on_presence {
                    handler(m)?;
                }
            }
            RxState::Src => {
                fr.src = m;
                fr.sum = fr.sum.wrapping_add(u16::from(m));
                fr.state = RxState::Dst;
            }
            RxState::Dst => {
                fr.dst = m;
                fr.sum = fr.sum.wrapping_add(u16::from(m));
                fr.state = RxState::Len;
            }
            RxState::Len => {
                if m > 0 {
                    fr.payload.clear();
                    // Seed plus scrambled payload plus the checksum trailer.
                    fr.want = usize::from(m) + 2;
                    fr.sum = fr.sum.wrapping_add(u16::from(m));
                    fr.state = RxState::Body;
                } else {
                    fr.state = RxState::Idle;
                }
            }
            RxState::Body => {
                fr.payload.push(m);
                if fr.payload.len() == fr.want {
                    let csum_end = fr.payload.len() - 2;
                    for &b in &fr.payload[..csum_end] {
                        fr.sum = fr.sum.wrapping_add(u16::from(b));
                    }
                    let received =
                        u16::from_le_bytes([fr.payload[csum_end], fr.payload[csum_end + 1]]);
                    if received == fr.sum {
                        let seed = fr.payload[0];
                        scramble(seed, &mut fr.payload[1..csum_end]);
                        log::trace!(
                            "rx packet src={:#04X} dst={:#04X} payload={:02X?}",
                            fr.src,
                            fr.dst,
                            &fr.payload[1..csum_end]
                        );
                        if let Some(handler) = &self.on_packet {
                            handler(fr.src, fr.dst, &fr.payload[1..csum_end])?;
                        }
                    } else {
                        log::debug!(
                            "dropping frame with bad checksum: calculated={:#06X} received={:#06X}",
                            fr.sum,
                            received
                        );
                    }
                    fr.state = RxState::Idle;
                }
            }
        }
        Ok(())
    }

    /// Encode and send one packet. The payload is scrambled with the
    /// per-PHY rolling seed unless scrambling is disabled.
    pub fn send_packet(&self, src: u8, dst: u8, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }

        let mut tx = self.tx.lock().unwrap();
        let tx = &mut *tx;

        if self.scramble_disabled {
            encode_frame(&mut tx.buf, src, dst, PLAIN_SEED, payload);
        } else {
            let seed = tx.seed;
            tx.seed = tx.seed.wrapping_add(1);
            tx.scratch.clear();
            tx.scratch.extend_from_slice(payload);
            scramble(seed, &mut tx.scratch);
            encode_frame(&mut tx.buf, src, dst, seed, &tx.scratch);
        }

        log::trace!("tx frame: {:02X?}", tx.buf);
        tx.link.write_all(&tx.buf)?;
        Ok(())
    }

    /// Hold the line low for `duration` (devices require at least 70 ms to
    /// register a break). Uses the port break facility when available,
    /// otherwise sends null bytes at 300 baud and restores the line rate.
    pub fn send_break(&self, duration: Duration) -> Result<(), Error> {
        let mut tx = self.tx.lock().unwrap();
        match self.break_mode {
            BreakMode::Hardware => {
                tx.link.set_break(true)?;
                thread::sleep(duration);
                tx.link.set_break(false)?;
            }
            BreakMode::Emulated => {
                tx.link.set_rate(EMULATED_BREAK_RATE)?;
                let mut elapsed = Duration::ZERO;
                while elapsed < duration {
                    let _ = tx.link.write_all(&[0]);
                    thread::sleep(EMULATED_BREAK_STEP);
                    elapsed += EMULATED_BREAK_STEP;
                }
                tx.link.set_rate(LINE_RATE)?;
            }
        }
        Ok(())
    }
}
