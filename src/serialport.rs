//! Serial port glue: a [`SerialLink`] backed by the `serialport` crate and a
//! convenience constructor for a standard USB serial adapter.

use crate::phy::{Phy, SerialLink, LINE_RATE};
use crate::Error;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Read timeout on the port; bounds how quickly the receive loop observes a
/// shutdown request.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

fn into_io(err: serialport::Error) -> io::Error {
    io::Error::other(err)
}

impl SerialLink for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }

    fn set_rate(&mut self, baud: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud).map_err(into_io)
    }

    fn set_break(&mut self, on: bool) -> io::Result<()> {
        if on {
            self.port.set_break().map_err(into_io)
        } else {
            self.port.clear_break().map_err(into_io)
        }
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialLink>> {
        Ok(Box::new(SerialPortLink {
            port: self.port.try_clone().map_err(into_io)?,
        }))
    }
}

/// Open the serial device at `path` and build a [`Phy`] for it: 9600 baud,
/// 8N1, no flow control.
///
/// # Example
///
/// ```no_run
/// use battgo_lib::controller::Controller;
///
/// # fn main() -> Result<(), battgo_lib::Error> {
/// let phy = battgo_lib::serialport::open("/dev/ttyUSB0")?;
/// let mut controller = Controller::new(phy, -1, |_device| None);
/// controller.run()?;
/// # Ok(())
/// # }
/// ```
pub fn open(path: &str) -> Result<Phy, Error> {
    let port = serialport::new(path, LINE_RATE)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()?;

    Phy::new(Box::new(SerialPortLink { port }))
}
