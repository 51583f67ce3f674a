//! Contract for the SPI peripheral underneath the SD driver.

/// A full-duplex SPI master the SD card hangs off.
///
/// Electrical contract: mode 0 (CPOL = 0, data sampled on the first clock
/// edge), MSB first, 3-pin mode. Chip select is a plain GPIO owned by the
/// card driver, never the peripheral.
///
/// [`transfer`](SdBus::transfer) blocks until one byte has been clocked out
/// and one clocked in. Implementations offering an interrupt-driven path
/// (registered `on_tx`/`on_rx` callbacks feeding the shift register from an
/// ISR) must refuse the synchronous transfer while callbacks are
/// registered and return 0, so the two modes can never interleave on the
/// wire. This driver only ever uses the synchronous path.
pub trait SdBus {
    type Error: core::fmt::Debug;

    /// Exchange one byte. Send `byte`, return what the peer shifted back.
    fn transfer(&mut self, byte: u8) -> Result<u8, Self::Error>;

    /// Reconfigure the SCLK rate. Takes effect before the next transfer.
    fn set_frequency(&mut self, hz: u32) -> Result<(), Self::Error>;
}

impl<T: SdBus> SdBus for &mut T {
    type Error = T::Error;

    fn transfer(&mut self, byte: u8) -> Result<u8, Self::Error> {
        (*self).transfer(byte)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), Self::Error> {
        (*self).set_frequency(hz)
    }
}
