/// Errors produced by the bus library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error from the underlying byte stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// An error from the `serialport` crate.
    #[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
    #[cfg(feature = "serialport")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// The bus device was used after the controller removed it from the bus.
    #[error("device has been closed")]
    DeviceClosed,
    /// The payload does not fit in a single frame.
    #[error("payload too large for a single frame")]
    PayloadTooLarge,
}
