use embedded_hal::blocking::spi::Transfer;

/// SPI clock rate used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Speed {
    /// Negotiation rate (100-400 kHz), used while the card type is unknown.
    Slow,
    /// Operating rate, used once the card type is resolved.
    Fast,
}

/// SPI bus carrying the card protocol.
///
/// Byte exchange comes from [`Transfer`], the bus additionally has to switch
/// between the negotiation and the operating clock rate.
pub trait Transport: Transfer<u8> {
    /// Set SPI clock rate.
    fn set_speed(&mut self, speed: Speed) -> Result<(), <Self as Transfer<u8>>::Error>;
}

/// [`Transport`] over an SPI bus with a fixed clock rate.
///
/// The bus must already run at a rate the card accepts during initialization.
pub struct FixedSpeed<Spi>(pub Spi);

impl<Spi: Transfer<u8>> Transfer<u8> for FixedSpeed<Spi> {
    type Error = Spi::Error;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.0.transfer(words)
    }
}

impl<Spi: Transfer<u8>> Transport for FixedSpeed<Spi> {
    fn set_speed(&mut self, _speed: Speed) -> Result<(), Spi::Error> {
        Ok(())
    }
}
