//! A blocking driver for SD/SDHC/SDXC cards on an SPI bus.
//!
//! The card is identified and brought up with [`SdCard::init`], after which
//! byte-addressed [`read`](SdCard::read)/[`program`](SdCard::program) move
//! whole 512-byte sectors. The driver implements
//! [`block_device::BlockDevice`] so a filesystem can sit on top.

#![cfg_attr(not(test), no_std)]

// MUST be the first module listed
mod fmt;

pub mod bus;
mod crc;
mod proto;

pub use bus::SdBus;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

/// What CMD0/CMD8/ACMD41 concluded about the attached card.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardType {
    /// Nothing attached, or not probed yet
    #[default]
    None,
    /// v1.x standard capacity
    V1,
    /// v2.x standard capacity
    V2,
    /// v2.x high/extended capacity, block addressed
    V2Hc,
    /// Responded, but unusable (bad voltage range or echo)
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Operation would block
    WouldBlock,
    /// Operation or command not supported by this card
    Unsupported,
    /// Invalid parameter (misaligned or out-of-range access)
    Parameter,
    /// Card has not been initialized
    NoInit,
    /// No card present, or it never left reset
    NoDevice,
    /// Card is write protected
    WriteProtected,
    /// Card responded but cannot be used (voltage range, CMD8 echo)
    Unusable,
    /// Card stopped responding within the bounded wait
    NoResponse,
    /// CRC mismatch on a data block or command
    Crc,
    /// Erase sequence rejected
    Erase,
    /// Data write rejected
    Write,
    /// The SPI peripheral failed
    Bus,
    /// The chip-select pin failed
    ChipSelect,
}

/// R1 status plus the trailing R2/R3/R7 payload for commands that carry
/// one.
#[derive(Copy, Clone, Debug, Default)]
struct CmdResponse {
    r1: u8,
    payload: u32,
}

/// One SD card on a shared-nothing SPI bus.
///
/// Owns the chip-select line for its slot; the bus may only be handed to
/// other users while no call into the driver is in progress.
pub struct SdCard<BUS, CS, D> {
    bus: BUS,
    cs: CS,
    delay: D,
    card_type: CardType,
    sectors: u64,
    erase_group: u32,
    init_hz: u32,
    transfer_hz: u32,
    crc_on: bool,
    initialized: bool,
}

impl<BUS, CS, D> SdCard<BUS, CS, D>
where
    BUS: SdBus,
    CS: OutputPin,
    D: DelayNs,
{
    /// Driver with the default identification and transfer clocks.
    pub fn new(bus: BUS, cs: CS, delay: D) -> Self {
        Self::with_frequencies(
            bus,
            cs,
            delay,
            proto::DEFAULT_INIT_FREQUENCY,
            proto::DEFAULT_TRANSFER_FREQUENCY,
        )
    }

    /// Driver with explicit clock rates. `init_hz` is capped at 400 kHz,
    /// `transfer_hz` at 25 MHz.
    pub fn with_frequencies(bus: BUS, cs: CS, delay: D, init_hz: u32, transfer_hz: u32) -> Self {
        Self {
            bus,
            cs,
            delay,
            card_type: CardType::None,
            sectors: 0,
            erase_group: proto::BLOCK_SIZE,
            init_hz: init_hz.min(proto::MAX_INIT_FREQUENCY),
            transfer_hz: transfer_hz.min(proto::MAX_TRANSFER_FREQUENCY),
            crc_on: false,
            initialized: false,
        }
    }

    /// Verify and send CRC16 on data blocks. Must be set before `init`.
    pub fn set_crc(&mut self, enabled: bool) {
        self.crc_on = enabled;
    }

    /// Release the bus, chip select and delay provider.
    pub fn release(self) -> (BUS, CS, D) {
        (self.bus, self.cs, self.delay)
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Capacity in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.sectors * u64::from(proto::BLOCK_SIZE)
    }

    /// Erase-group size in bytes, from the CSD.
    pub fn erase_group(&self) -> u32 {
        self.erase_group
    }

    /// Identify and bring up the card. Idempotent: once initialized,
    /// returns `Ok` without touching the bus.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.initialized {
            return Ok(());
        }
        match self.initialise_card() {
            Ok(()) => {
                self.initialized = true;
                info!(
                    "card up: {:?}, {} sectors",
                    self.card_type,
                    self.sectors
                );
                Ok(())
            }
            Err(e) => {
                error!("card init failed: {:?}", e);
                Err(e)
            }
        }
    }

    /// Forget the card. The next `init` re-probes from scratch.
    pub fn deinit(&mut self) -> Result<(), Error> {
        self.initialized = false;
        self.card_type = CardType::None;
        self.sectors = 0;
        self.erase_group = proto::BLOCK_SIZE;
        Ok(())
    }

    /// Read `buf.len()` bytes at byte address `addr`. Both must be
    /// multiples of 512 and in range.
    pub fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NoInit);
        }
        if !self.valid_span(addr, buf.len() as u64) {
            return Err(Error::Parameter);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let wire = self.wire_address(addr);
        if buf.len() as u32 == proto::BLOCK_SIZE {
            let r = self.cmd(proto::CMD17, wire, false)?;
            if let Err(e) = check_r1(r.r1) {
                self.end_transfer()?;
                return Err(e);
            }
            let res = self.read_block(buf);
            self.end_transfer()?;
            res
        } else {
            let r = self.cmd(proto::CMD18, wire, false)?;
            if let Err(e) = check_r1(r.r1) {
                self.end_transfer()?;
                return Err(e);
            }
            let mut res = Ok(());
            for block in buf.chunks_mut(proto::BLOCK_SIZE as usize) {
                res = self.read_block(block);
                if res.is_err() {
                    break;
                }
            }
            // terminate the open transfer even if a block failed
            let stop = self.cmd(proto::CMD12, 0, false);
            res?;
            stop.map(|_| ())
        }
    }

    /// Program `buf.len()` bytes at byte address `addr`. Both must be
    /// multiples of 512 and in range.
    pub fn program(&mut self, buf: &[u8], addr: u64) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NoInit);
        }
        if !self.valid_span(addr, buf.len() as u64) {
            return Err(Error::Parameter);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let wire = self.wire_address(addr);
        let blocks = buf.len() as u32 / proto::BLOCK_SIZE;
        if blocks == 1 {
            let r = self.cmd(proto::CMD24, wire, false)?;
            if let Err(e) = check_r1(r.r1) {
                self.end_transfer()?;
                return Err(e);
            }
            let res = self
                .write_block(proto::DATA_START_BLOCK, buf)
                .and_then(|_| self.wait_ready());
            self.end_transfer()?;
            res?;
            // R2 status pass after the busy phase
            let st = self.cmd(proto::CMD13, 0, false)?;
            if st.r1 != proto::R1_READY_STATE || st.payload != 0 {
                warn!("post-write status {:02x} {:02x}", st.r1, st.payload as u8);
                return Err(Error::Write);
            }
            Ok(())
        } else {
            // pre-erase hint, advisory: the write proceeds either way
            let _ = self.cmd(proto::ACMD23, blocks, true);

            let r = self.cmd(proto::CMD25, wire, false)?;
            if let Err(e) = check_r1(r.r1) {
                self.end_transfer()?;
                return Err(e);
            }
            let mut res = Ok(());
            for block in buf.chunks(proto::BLOCK_SIZE as usize) {
                res = self
                    .wait_ready()
                    .and_then(|_| self.write_block(proto::WRITE_MULTIPLE_TOKEN, block));
                if res.is_err() {
                    break;
                }
            }
            if res.is_ok() {
                res = self
                    .wait_ready()
                    .and_then(|_| self.send(proto::STOP_TRAN_TOKEN));
            }
            let stop = self.cmd(proto::CMD12, 0, false);
            res?;
            stop.map(|_| ())
        }
    }

    /// Pre-erase the range so later programs run at full speed.
    pub fn trim(&mut self, addr: u64, len: u64) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NoInit);
        }
        if len == 0 {
            return Ok(());
        }
        if !self.valid_span(addr, len) {
            return Err(Error::Parameter);
        }
        let start = self.wire_address(addr);
        let end = self.wire_address(addr + len - u64::from(proto::BLOCK_SIZE));
        let r = self.cmd(proto::CMD32, start, false)?;
        if r.r1 != proto::R1_READY_STATE {
            return Err(Error::Erase);
        }
        let r = self.cmd(proto::CMD33, end, false)?;
        if r.r1 != proto::R1_READY_STATE {
            return Err(Error::Erase);
        }
        // R1b: the busy phase is waited out inside cmd()
        let r = self.cmd(proto::CMD38, 0, false)?;
        if r.r1 != proto::R1_READY_STATE {
            return Err(Error::Erase);
        }
        Ok(())
    }

    /// Set the transfer clock, capped at 25 MHz. Returns whether the
    /// request was clamped.
    pub fn frequency(&mut self, hz: u32) -> Result<bool, Error> {
        let clamped = hz > proto::MAX_TRANSFER_FREQUENCY;
        self.transfer_hz = hz.min(proto::MAX_TRANSFER_FREQUENCY);
        self.bus
            .set_frequency(self.transfer_hz)
            .map_err(|_| Error::Bus)?;
        Ok(clamped)
    }

    fn valid_span(&self, addr: u64, len: u64) -> bool {
        addr % u64::from(proto::BLOCK_SIZE) == 0
            && len % u64::from(proto::BLOCK_SIZE) == 0
            && addr + len <= self.capacity()
    }

    /// High-capacity cards take sector indices on the wire, standard
    /// capacity cards take byte addresses. Exactly one conversion per
    /// command happens here.
    fn wire_address(&self, byte_addr: u64) -> u32 {
        match self.card_type {
            CardType::V2Hc => (byte_addr / u64::from(proto::BLOCK_SIZE)) as u32,
            _ => byte_addr as u32,
        }
    }

    fn initialise_card(&mut self) -> Result<(), Error> {
        self.card_type = CardType::None;
        self.sectors = 0;

        self.bus
            .set_frequency(self.init_hz)
            .map_err(|_| Error::Bus)?;

        // at least 74 clocks with CS deasserted to get the card into SPI
        // mode
        self.unselect()?;
        for _ in 0..proto::DUMMY_CLOCK_BYTES {
            self.send(0xFF)?;
        }

        // CMD0 until the card reports idle
        let mut idled = false;
        for _ in 0..proto::CMD0_ATTEMPTS {
            match self.cmd(proto::CMD0, 0, false) {
                Ok(r) if r.r1 == proto::R1_IDLE_STATE => {
                    idled = true;
                    break;
                }
                Ok(_) | Err(Error::NoResponse) => {
                    self.delay.delay_us(proto::OP_COND_DELAY_US);
                }
                Err(e) => return Err(e),
            }
        }
        if !idled {
            return Err(Error::NoDevice);
        }

        // CMD8 sorts v1 cards from v2, and checks the voltage echo
        match self.cmd(proto::CMD8, proto::CMD8_ARG, false) {
            Ok(r) if r.r1 & proto::R1_ILLEGAL_COMMAND != 0 => {
                self.card_type = CardType::V1;
            }
            Ok(r) if r.r1 == proto::R1_IDLE_STATE => {
                if r.payload & 0xFFF != proto::CMD8_ARG {
                    warn!("CMD8 echo 0x{:03x}", r.payload & 0xFFF);
                    self.card_type = CardType::Unknown;
                    return Err(Error::Unusable);
                }
                self.card_type = CardType::V2;
            }
            Ok(_) => {
                self.card_type = CardType::Unknown;
                return Err(Error::Unusable);
            }
            Err(e) => return Err(e),
        }

        if self.crc_on {
            let r = self.cmd(proto::CMD59, 1, false)?;
            if r.r1 != proto::R1_IDLE_STATE {
                return Err(Error::Unsupported);
            }
        }

        // the card must support 3.3 V
        let r = self.cmd(proto::CMD58, 0, false)?;
        if r.payload & proto::OCR_3_3V == 0 {
            self.card_type = CardType::Unknown;
            return Err(Error::Unusable);
        }

        // ACMD41 until the card leaves idle; this is the long one
        let hcs = if self.card_type == CardType::V2 {
            proto::ACMD41_HCS
        } else {
            0
        };
        let mut ready = false;
        for _ in 0..proto::OP_COND_ATTEMPTS {
            let r = self.cmd(proto::ACMD41, hcs, true)?;
            if r.r1 == proto::R1_READY_STATE {
                ready = true;
                break;
            }
            self.delay.delay_us(proto::OP_COND_DELAY_US);
        }
        if !ready {
            return Err(Error::NoResponse);
        }

        // CCS distinguishes high capacity once the card is powered up
        if self.card_type == CardType::V2 {
            let r = self.cmd(proto::CMD58, 0, false)?;
            if r.payload & proto::OCR_CCS != 0 {
                self.card_type = CardType::V2Hc;
            }
        }

        if !self.crc_on {
            self.cmd(proto::CMD59, 0, false)?;
        }

        let (sectors, erase_group) = self.read_csd()?;
        if sectors == 0 {
            return Err(Error::Unusable);
        }
        self.sectors = sectors;
        self.erase_group = erase_group;

        let r = self.cmd(proto::CMD16, proto::BLOCK_SIZE, false)?;
        if r.r1 != proto::R1_READY_STATE {
            return Err(Error::Unusable);
        }

        self.frequency(self.transfer_hz)?;
        Ok(())
    }

    fn read_csd(&mut self) -> Result<(u64, u32), Error> {
        let r = self.cmd(proto::CMD9, 0, false)?;
        if r.r1 != proto::R1_READY_STATE {
            self.end_transfer()?;
            return Err(Error::NoResponse);
        }
        let mut csd = [0u8; 16];
        let res = self.read_block(&mut csd);
        self.end_transfer()?;
        res?;
        parse_csd(&csd)
    }

    fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::ChipSelect)
    }

    fn unselect(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::ChipSelect)
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, Error> {
        self.bus.transfer(byte).map_err(|_| Error::Bus)
    }

    fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    fn send(&mut self, byte: u8) -> Result<(), Error> {
        self.transfer(byte).map(|_| ())
    }

    fn receive_slice(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        for byte in buf {
            *byte = self.receive()?;
        }
        Ok(())
    }

    fn send_slice(&mut self, buf: &[u8]) -> Result<(), Error> {
        for &byte in buf {
            self.send(byte)?;
        }
        Ok(())
    }

    /// Poll until the card releases DO (reads back 0xFF).
    fn wait_ready(&mut self) -> Result<(), Error> {
        for _ in 0..proto::READY_POLLS {
            if self.receive()? == 0xFF {
                return Ok(());
            }
            self.delay.delay_us(proto::READY_POLL_DELAY_US);
        }
        Err(Error::NoResponse)
    }

    /// Poll until the card sends `token`.
    fn wait_token(&mut self, token: u8) -> Result<(), Error> {
        for _ in 0..proto::TOKEN_POLLS {
            if self.receive()? == token {
                return Ok(());
            }
        }
        Err(Error::NoResponse)
    }

    /// Deassert CS and clock once so the card releases DO.
    fn end_transfer(&mut self) -> Result<(), Error> {
        self.unselect()?;
        self.receive().map(|_| ())
    }

    /// Receive one framed data block: start token, payload, CRC16.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.wait_token(proto::DATA_START_BLOCK)?;
        self.receive_slice(buf)?;
        let mut crc_bytes = [0u8; 2];
        self.receive_slice(&mut crc_bytes)?;
        if self.crc_on {
            let wire = u16::from_be_bytes(crc_bytes);
            let computed = crc::crc16(buf);
            if wire != computed {
                warn!("data CRC 0x{:04x}, computed 0x{:04x}", wire, computed);
                return Err(Error::Crc);
            }
        }
        Ok(())
    }

    /// Send one framed data block and check the data-response token.
    fn write_block(&mut self, token: u8, buf: &[u8]) -> Result<(), Error> {
        self.send(token)?;
        self.send_slice(buf)?;
        let crc_bytes = if self.crc_on {
            crc::crc16(buf).to_be_bytes()
        } else {
            [0xFF, 0xFF]
        };
        self.send_slice(&crc_bytes)?;
        let response = self.receive()? & proto::DATA_RES_MASK;
        match response {
            proto::DATA_RES_ACCEPTED => Ok(()),
            proto::DATA_RES_CRC_ERROR => Err(Error::Crc),
            _ => Err(Error::Write),
        }
    }

    /// Issue one command, retrying the whole exchange on a missing R1.
    /// An ACMD is prefixed with CMD55 inside the retry loop.
    fn cmd(&mut self, index: u8, arg: u32, is_acmd: bool) -> Result<CmdResponse, Error> {
        let mut result = Err(Error::NoResponse);
        for _ in 0..proto::CMD_RETRIES {
            result = if is_acmd {
                self.cmd_transaction(proto::CMD55, 0)
                    .and_then(|_| self.cmd_transaction(index, arg))
            } else {
                self.cmd_transaction(index, arg)
            };
            match result {
                Err(Error::NoResponse) => {
                    debug!("no response to CMD{}, retrying", index);
                }
                _ => break,
            }
        }
        result
    }

    /// One select/command/deselect cycle. A successful data-phase command
    /// leaves CS asserted; the caller finishes the phase and deasserts.
    fn cmd_transaction(&mut self, index: u8, arg: u32) -> Result<CmdResponse, Error> {
        self.select()?;
        let res = self.cmd_selected(index, arg);
        match res {
            Ok(_) if is_data_phase(index) => {}
            Ok(_) => self.end_transfer()?,
            Err(_) => {
                let _ = self.end_transfer();
            }
        }
        res
    }

    fn cmd_selected(&mut self, index: u8, arg: u32) -> Result<CmdResponse, Error> {
        // CMD12 interrupts an open transfer, everything else waits for
        // the previous operation to drain
        if index != proto::CMD12 {
            self.wait_ready()?;
        }

        let mut packet = [0u8; 6];
        packet[0] = 0x40 | index;
        packet[1..5].copy_from_slice(&arg.to_be_bytes());
        packet[5] = if self.crc_on {
            (crc::crc7(&packet[..5]) << 1) | 1
        } else {
            match index {
                proto::CMD0 => proto::CMD0_CRC,
                proto::CMD8 => proto::CMD8_CRC,
                _ => proto::CRC_FILLER,
            }
        };
        self.send_slice(&packet)?;

        // stuff byte ahead of CMD12's response
        if index == proto::CMD12 {
            self.receive()?;
        }

        let mut r1 = proto::R1_NO_RESPONSE;
        for _ in 0..proto::R1_POLLS {
            let byte = self.receive()?;
            if byte & proto::R1_RESPONSE_RECV == 0 {
                r1 = byte;
                break;
            }
        }
        if r1 == proto::R1_NO_RESPONSE {
            return Err(Error::NoResponse);
        }

        let mut payload = 0u32;
        match index {
            // R3/R7: four trailing payload bytes
            proto::CMD8 | proto::CMD58 => {
                let mut trail = [0u8; 4];
                self.receive_slice(&mut trail)?;
                payload = u32::from_be_bytes(trail);
            }
            // R2: one trailing status byte
            proto::CMD13 => {
                payload = u32::from(self.receive()?);
            }
            // R1b: wait out the busy phase
            proto::CMD12 | proto::CMD38 => {
                self.wait_ready()?;
            }
            _ => {}
        }

        Ok(CmdResponse { r1, payload })
    }
}

/// Commands that open a data phase keep CS asserted on success.
fn is_data_phase(index: u8) -> bool {
    matches!(
        index,
        proto::CMD9
            | proto::CMD17
            | proto::CMD18
            | proto::CMD24
            | proto::CMD25
            | proto::ACMD22
    )
}

fn check_r1(r1: u8) -> Result<(), Error> {
    if r1 == proto::R1_READY_STATE {
        Ok(())
    } else if r1 & (proto::R1_ERASE_RESET | proto::R1_ERASE_SEQUENCE_ERROR) != 0 {
        Err(Error::Erase)
    } else if r1 & (proto::R1_ADDRESS_ERROR | proto::R1_PARAMETER_ERROR) != 0 {
        Err(Error::Parameter)
    } else if r1 & proto::R1_COM_CRC_ERROR != 0 {
        Err(Error::Crc)
    } else if r1 & proto::R1_ILLEGAL_COMMAND != 0 {
        Err(Error::Unsupported)
    } else {
        Err(Error::NoResponse)
    }
}

/// Capacity in 512-byte sectors and erase-group size in bytes, from the
/// raw CSD register.
fn parse_csd(csd: &[u8; 16]) -> Result<(u64, u32), Error> {
    let sectors = match csd_bits(csd, 127, 126) {
        0 => {
            // CSD v1: (C_SIZE+1) * 2^(C_SIZE_MULT+2) * 2^READ_BL_LEN bytes
            let read_bl_len = csd_bits(csd, 83, 80);
            let c_size = csd_bits(csd, 73, 62);
            let c_size_mult = csd_bits(csd, 49, 47);
            let blocks = u64::from(c_size + 1) << (c_size_mult + 2);
            (blocks << read_bl_len) / u64::from(proto::BLOCK_SIZE)
        }
        1 => {
            // CSD v2: (C_SIZE+1) * 512 KiB
            let c_size = csd_bits(csd, 69, 48);
            u64::from(c_size + 1) * 1024
        }
        v => {
            warn!("unsupported CSD structure {}", v);
            return Err(Error::Unusable);
        }
    };
    let erase_group = if csd_bits(csd, 46, 46) == 1 {
        proto::BLOCK_SIZE
    } else {
        proto::BLOCK_SIZE * (csd_bits(csd, 45, 39) + 1)
    };
    Ok((sectors, erase_group))
}

/// Extract `[msb:lsb]` from the big-endian 128-bit CSD image.
fn csd_bits(csd: &[u8; 16], msb: u32, lsb: u32) -> u32 {
    let mut bits = 0u32;
    for i in 0..=(msb - lsb) {
        let position = lsb + i;
        let byte = 15 - (position >> 3) as usize;
        let bit = position & 0x7;
        bits |= u32::from((csd[byte] >> bit) & 1) << i;
    }
    bits
}

impl<BUS, CS, D> block_device::BlockDevice for SdCard<BUS, CS, D>
where
    BUS: SdBus,
    CS: OutputPin,
    D: DelayNs,
{
    type Error = Error;

    fn init(&mut self) -> Result<(), Self::Error> {
        SdCard::init(self)
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        SdCard::deinit(self)
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Self::Error> {
        SdCard::read(self, buf, addr)
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<(), Self::Error> {
        SdCard::program(self, buf, addr)
    }

    fn erase(&mut self, _addr: u64, _len: u64) -> Result<(), Self::Error> {
        // the card erases implicitly on program
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        // no write cache below this layer
        Ok(())
    }

    fn size(&self) -> u64 {
        self.capacity()
    }

    fn read_size(&self) -> u64 {
        u64::from(proto::BLOCK_SIZE)
    }

    fn program_size(&self) -> u64 {
        u64::from(proto::BLOCK_SIZE)
    }

    fn device_type(&self) -> &'static str {
        "SD"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, VecDeque};
    use std::rc::Rc;

    /// Behavior knobs for the simulated card.
    #[derive(Clone, Copy)]
    struct Profile {
        dead: bool,
        cmd8_illegal: bool,
        cmd8_echo: u32,
        ocr: u32,
        acmd41_busy: u32,
        csd: [u8; 16],
        high_capacity: bool,
    }

    impl Profile {
        /// SDHC, 65536 sectors (32 MiB), comes ready on the second ACMD41.
        fn hc() -> Self {
            Profile {
                dead: false,
                cmd8_illegal: false,
                cmd8_echo: proto::CMD8_ARG,
                ocr: 0xC0FF_8000,
                acmd41_busy: 1,
                csd: csd_v2(63),
                high_capacity: true,
            }
        }

        /// SDSC v2, CSD v1 geometry, byte addressed.
        fn sc_v2() -> Self {
            Profile {
                ocr: 0x80FF_8000,
                csd: csd_v1(2047, 7, 9),
                high_capacity: false,
                ..Profile::hc()
            }
        }

        /// Legacy card that rejects CMD8.
        fn v1() -> Self {
            Profile {
                cmd8_illegal: true,
                ..Profile::sc_v2()
            }
        }
    }

    fn csd_v2(c_size: u32) -> [u8; 16] {
        let mut csd = [0u8; 16];
        csd[0] = 0x40;
        csd[7] = ((c_size >> 16) & 0x3F) as u8;
        csd[8] = (c_size >> 8) as u8;
        csd[9] = c_size as u8;
        csd[10] = 0x40; // ERASE_BLK_EN
        csd
    }

    fn csd_v1(c_size: u32, c_size_mult: u32, read_bl_len: u32) -> [u8; 16] {
        let mut csd = [0u8; 16];
        csd[5] = (read_bl_len & 0x0F) as u8;
        csd[6] |= ((c_size >> 10) & 0x03) as u8;
        csd[7] = ((c_size >> 2) & 0xFF) as u8;
        csd[8] |= ((c_size & 0x03) << 6) as u8;
        csd[9] |= ((c_size_mult >> 1) & 0x03) as u8;
        csd[10] |= ((c_size_mult & 0x01) << 7) as u8;
        csd[10] |= 0x40; // ERASE_BLK_EN
        csd
    }

    enum Phase {
        Command,
        WriteToken { multi: bool, block: u32 },
        WriteData { multi: bool, block: u32, buf: Vec<u8> },
    }

    /// Byte-level card model behind the mock bus. Parses command packets
    /// off the wire and queues the response stream the driver will clock
    /// in, shifted one byte late the way a real half-duplex peer answers.
    struct MockCard {
        profile: Profile,
        ready: bool,
        phase: Phase,
        cmd_buf: Vec<u8>,
        wire: Vec<u8>,
        cmds: Vec<(u8, u32)>,
        packets: Vec<[u8; 6]>,
        out: VecDeque<u8>,
        read_multi: Option<u32>,
        blocks: BTreeMap<u32, Vec<u8>>,
        freqs: Vec<u32>,
    }

    impl MockCard {
        fn new(profile: Profile) -> Self {
            MockCard {
                profile,
                ready: false,
                phase: Phase::Command,
                cmd_buf: Vec::new(),
                wire: Vec::new(),
                cmds: Vec::new(),
                packets: Vec::new(),
                out: VecDeque::new(),
                read_multi: None,
                blocks: BTreeMap::new(),
                freqs: Vec::new(),
            }
        }

        fn transfer(&mut self, byte: u8) -> u8 {
            self.wire.push(byte);
            self.process(byte);
            if let Some(out) = self.out.pop_front() {
                return out;
            }
            if let Some(block) = self.read_multi {
                if byte == 0xFF && self.cmd_buf.is_empty() && matches!(self.phase, Phase::Command)
                {
                    self.push_data_block(block);
                    self.read_multi = Some(block + 1);
                    return self.out.pop_front().unwrap();
                }
            }
            0xFF
        }

        fn process(&mut self, byte: u8) {
            match &mut self.phase {
                Phase::Command => {
                    if self.cmd_buf.is_empty() && byte & 0xC0 != 0x40 {
                        return;
                    }
                    self.cmd_buf.push(byte);
                    if self.cmd_buf.len() == 6 {
                        let packet: [u8; 6] = self.cmd_buf[..].try_into().unwrap();
                        self.cmd_buf.clear();
                        self.handle_command(packet);
                    }
                }
                Phase::WriteToken { multi, block } => {
                    let (multi, block) = (*multi, *block);
                    if multi && byte == proto::STOP_TRAN_TOKEN {
                        self.phase = Phase::Command;
                        self.out.extend([0x00, 0xFF]); // busy, then ready
                    } else if (multi && byte == proto::WRITE_MULTIPLE_TOKEN)
                        || (!multi && byte == proto::DATA_START_BLOCK)
                    {
                        self.phase = Phase::WriteData {
                            multi,
                            block,
                            buf: Vec::new(),
                        };
                    }
                }
                Phase::WriteData { multi, block, buf } => {
                    buf.push(byte);
                    if buf.len() == proto::BLOCK_SIZE as usize + 2 {
                        let data = buf[..proto::BLOCK_SIZE as usize].to_vec();
                        let (multi, block) = (*multi, *block);
                        self.blocks.insert(block, data);
                        self.out
                            .extend([0xFF, proto::DATA_RES_ACCEPTED, 0x00, 0xFF]);
                        self.phase = if multi {
                            Phase::WriteToken {
                                multi: true,
                                block: block + 1,
                            }
                        } else {
                            Phase::Command
                        };
                    }
                }
            }
        }

        fn handle_command(&mut self, packet: [u8; 6]) {
            let index = packet[0] & 0x3F;
            let arg = u32::from_be_bytes(packet[1..5].try_into().unwrap());
            self.packets.push(packet);
            self.cmds.push((index, arg));
            if self.profile.dead {
                return;
            }
            let idle = if self.ready { 0x00 } else { 0x01 };
            match index {
                proto::CMD0 => {
                    self.ready = false;
                    self.out.extend([0xFF, 0x01]);
                }
                proto::CMD8 => {
                    if self.profile.cmd8_illegal {
                        self.out.extend([0xFF, 0x05]);
                    } else {
                        self.out.extend([0xFF, 0x01]);
                        self.out.extend(self.profile.cmd8_echo.to_be_bytes());
                    }
                }
                proto::CMD55 => self.out.extend([0xFF, idle]),
                proto::ACMD41 => {
                    if self.profile.acmd41_busy > 0 {
                        self.profile.acmd41_busy -= 1;
                        self.out.extend([0xFF, 0x01]);
                    } else {
                        self.ready = true;
                        self.out.extend([0xFF, 0x00]);
                    }
                }
                proto::CMD58 => {
                    self.out.extend([0xFF, idle]);
                    self.out.extend(self.profile.ocr.to_be_bytes());
                }
                proto::CMD59 | proto::CMD16 => self.out.extend([0xFF, idle]),
                proto::CMD9 => {
                    self.out.extend([0xFF, 0x00, 0xFF, proto::DATA_START_BLOCK]);
                    let csd = self.profile.csd;
                    self.out.extend(csd);
                    self.out.extend(crc::crc16(&csd).to_be_bytes());
                }
                proto::CMD13 => self.out.extend([0xFF, 0x00, 0x00]),
                proto::CMD17 => {
                    self.out.extend([0xFF, 0x00]);
                    let block = self.block_index(arg);
                    self.push_data_block(block);
                }
                proto::CMD18 => {
                    self.out.extend([0xFF, 0x00]);
                    self.read_multi = Some(self.block_index(arg));
                }
                proto::CMD12 => {
                    self.read_multi = None;
                    self.out.clear();
                    // stuff byte, pad, R1, busy, ready
                    self.out.extend([0xFF, 0xFF, 0x00, 0x00, 0xFF]);
                }
                proto::CMD24 => {
                    self.out.extend([0xFF, 0x00]);
                    self.phase = Phase::WriteToken {
                        multi: false,
                        block: self.block_index(arg),
                    };
                }
                proto::CMD25 => {
                    self.out.extend([0xFF, 0x00]);
                    self.phase = Phase::WriteToken {
                        multi: true,
                        block: self.block_index(arg),
                    };
                }
                proto::ACMD23 => self.out.extend([0xFF, 0x00]),
                proto::CMD32 | proto::CMD33 => self.out.extend([0xFF, 0x00]),
                proto::CMD38 => self.out.extend([0xFF, 0x00, 0x00, 0xFF]),
                _ => self.out.extend([0xFF, 0x05]),
            }
        }

        fn block_index(&self, arg: u32) -> u32 {
            if self.profile.high_capacity {
                arg
            } else {
                arg / proto::BLOCK_SIZE
            }
        }

        fn push_data_block(&mut self, block: u32) {
            self.out.push_back(0xFF);
            self.out.push_back(proto::DATA_START_BLOCK);
            let data = self
                .blocks
                .get(&block)
                .cloned()
                .unwrap_or_else(|| vec![0u8; proto::BLOCK_SIZE as usize]);
            let crc = crc::crc16(&data);
            self.out.extend(data);
            self.out.extend(crc.to_be_bytes());
        }

        fn commands(&self) -> Vec<u8> {
            self.cmds.iter().map(|&(index, _)| index).collect()
        }
    }

    #[derive(Clone)]
    struct SharedBus(Rc<RefCell<MockCard>>);

    impl SdBus for SharedBus {
        type Error = core::convert::Infallible;

        fn transfer(&mut self, byte: u8) -> Result<u8, Self::Error> {
            Ok(self.0.borrow_mut().transfer(byte))
        }

        fn set_frequency(&mut self, hz: u32) -> Result<(), Self::Error> {
            self.0.borrow_mut().freqs.push(hz);
            Ok(())
        }
    }

    #[derive(Clone)]
    struct SharedPin(Rc<Cell<bool>>);

    impl embedded_hal::digital::ErrorType for SharedPin {
        type Error = core::convert::Infallible;
    }

    impl OutputPin for SharedPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.set(true);
            Ok(())
        }
    }

    struct NoopDelay;

    impl DelayNs for NoopDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    type TestCard = SdCard<SharedBus, SharedPin, NoopDelay>;

    fn setup(profile: Profile) -> (TestCard, Rc<RefCell<MockCard>>, Rc<Cell<bool>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let card = Rc::new(RefCell::new(MockCard::new(profile)));
        let pin = Rc::new(Cell::new(true));
        let sd = SdCard::new(SharedBus(card.clone()), SharedPin(pin.clone()), NoopDelay);
        (sd, card, pin)
    }

    #[test]
    fn cmd0_framing() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        let card = card.borrow();
        // dummy clocks first, then the reset command with its fixed CRC
        let first = card.wire.iter().position(|&b| b != 0xFF).unwrap();
        assert!(first >= proto::DUMMY_CLOCK_BYTES as usize);
        assert_eq!(
            &card.wire[first..first + 6],
            &[0x40, 0x00, 0x00, 0x00, 0x00, 0x95]
        );
    }

    #[test]
    fn init_hc_card() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        assert_eq!(sd.card_type(), CardType::V2Hc);
        assert_eq!(sd.sectors(), 65536);
        assert_eq!(sd.capacity(), 65536 * 512);
        assert_eq!(sd.erase_group(), 512);
        // identification clock first, transfer clock after
        assert_eq!(card.borrow().freqs, vec![200_000, 20_000_000]);
    }

    #[test]
    fn init_v1_card() {
        let (mut sd, _, _) = setup(Profile::v1());
        sd.init().unwrap();
        assert_eq!(sd.card_type(), CardType::V1);
        assert_eq!(sd.sectors(), 1_048_576);
    }

    #[test]
    fn init_rejects_bad_cmd8_echo() {
        let (mut sd, _, _) = setup(Profile {
            cmd8_echo: 0x1AB,
            ..Profile::hc()
        });
        assert_eq!(sd.init(), Err(Error::Unusable));
        assert_eq!(sd.card_type(), CardType::Unknown);
        assert!(!sd.is_initialized());
    }

    #[test]
    fn init_rejects_wrong_voltage() {
        let (mut sd, _, _) = setup(Profile {
            ocr: 0xC000_0000, // 3.3 V window unsupported
            ..Profile::hc()
        });
        assert_eq!(sd.init(), Err(Error::Unusable));
        assert_eq!(sd.card_type(), CardType::Unknown);
    }

    #[test]
    fn init_without_card() {
        let (mut sd, _, _) = setup(Profile {
            dead: true,
            ..Profile::hc()
        });
        assert_eq!(sd.init(), Err(Error::NoDevice));
    }

    #[test]
    fn init_is_idempotent() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        let traffic = card.borrow().wire.len();
        sd.init().unwrap();
        // the second init puts nothing on the wire
        assert_eq!(card.borrow().wire.len(), traffic);
    }

    #[test]
    fn packets_are_well_formed() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        sd.read(&mut [0u8; 512], 512).unwrap();
        for packet in &card.borrow().packets {
            assert_eq!(packet[0] & 0xC0, 0x40);
            assert_eq!(packet[5] & 0x01, 0x01);
        }
    }

    #[test]
    fn crc_mode_sends_valid_crc7() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.set_crc(true);
        sd.init().unwrap();
        sd.read(&mut [0u8; 512], 0).unwrap();
        for packet in &card.borrow().packets {
            assert_eq!(packet[5], (crc::crc7(&packet[..5]) << 1) | 1);
        }
    }

    #[test]
    fn single_block_read_hc_addressing() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        card.borrow_mut().blocks.insert(1, vec![0xA5; 512]);
        let mut buf = [0u8; 512];
        sd.read(&mut buf, 512).unwrap();
        assert_eq!(buf, [0xA5; 512]);
        // sector index on the wire for high capacity
        assert!(card.borrow().cmds.contains(&(proto::CMD17, 1)));
    }

    #[test]
    fn single_block_read_sc_addressing() {
        let (mut sd, card, _) = setup(Profile::sc_v2());
        sd.init().unwrap();
        assert_eq!(sd.card_type(), CardType::V2);
        sd.read(&mut [0u8; 512], 512).unwrap();
        // byte address on the wire for standard capacity
        assert!(card.borrow().cmds.contains(&(proto::CMD17, 512)));
    }

    #[test]
    fn multi_block_read_stops_with_cmd12() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        card.borrow_mut().blocks.insert(4, vec![0x11; 512]);
        card.borrow_mut().blocks.insert(5, vec![0x22; 512]);
        let mut buf = [0u8; 1024];
        sd.read(&mut buf, 4 * 512).unwrap();
        assert_eq!(&buf[..512], &[0x11; 512][..]);
        assert_eq!(&buf[512..], &[0x22; 512][..]);
        let cmds = card.borrow().commands();
        let cmd18 = cmds.iter().position(|&c| c == proto::CMD18).unwrap();
        assert!(cmds[cmd18 + 1..].contains(&proto::CMD12));
    }

    #[test]
    fn multi_block_write_token_discipline() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        let baseline = card.borrow().wire.len();
        sd.program(&[0u8; 1024], 0).unwrap();
        let card = card.borrow();
        // ACMD23 pre-erase hint, CMD25, stop
        let cmds = card.commands();
        let cmd25 = cmds.iter().position(|&c| c == proto::CMD25).unwrap();
        assert!(cmds[..cmd25].ends_with(&[proto::CMD55, proto::ACMD23]));
        assert!(cmds[cmd25 + 1..].contains(&proto::CMD12));
        // two data blocks framed with 0xFC, terminated by 0xFD (the data
        // is all zeros, so the tokens are unambiguous on the wire)
        let wire = &card.wire[baseline..];
        let tokens: Vec<u8> = wire
            .iter()
            .copied()
            .filter(|&b| b == proto::WRITE_MULTIPLE_TOKEN || b == proto::STOP_TRAN_TOKEN)
            .collect();
        assert_eq!(
            tokens,
            vec![
                proto::WRITE_MULTIPLE_TOKEN,
                proto::WRITE_MULTIPLE_TOKEN,
                proto::STOP_TRAN_TOKEN
            ]
        );
    }

    #[test]
    fn program_then_read_round_trip() {
        let (mut sd, _, _) = setup(Profile::hc());
        sd.init().unwrap();
        let mut data = [0u8; 1024];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        sd.program(&data, 1024).unwrap();
        let mut back = [0u8; 1024];
        sd.read(&mut back, 1024).unwrap();
        assert_eq!(data, back);

        // single block too
        sd.program(&data[..512], 4096).unwrap();
        let mut one = [0u8; 512];
        sd.read(&mut one, 4096).unwrap();
        assert_eq!(&data[..512], &one[..]);
    }

    #[test]
    fn chip_select_released_after_every_call() {
        let (mut sd, _, pin) = setup(Profile::hc());
        sd.init().unwrap();
        assert!(pin.get());
        sd.read(&mut [0u8; 512], 0).unwrap();
        assert!(pin.get());
        sd.program(&[0u8; 512], 0).unwrap();
        assert!(pin.get());
        sd.program(&[0u8; 1024], 0).unwrap();
        assert!(pin.get());
        sd.trim(0, 1024).unwrap();
        assert!(pin.get());
        let _ = sd.read(&mut [0u8; 512], 1); // misaligned, fails early
        assert!(pin.get());
    }

    #[test]
    fn trim_sends_erase_range() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        sd.trim(512, 1536).unwrap();
        let cmds = &card.borrow().cmds;
        assert!(cmds.contains(&(proto::CMD32, 1)));
        assert!(cmds.contains(&(proto::CMD33, 3)));
        assert!(cmds.contains(&(proto::CMD38, 0)));
    }

    #[test]
    fn alignment_and_state_guards() {
        let (mut sd, _, _) = setup(Profile::hc());
        assert_eq!(sd.read(&mut [0u8; 512], 0), Err(Error::NoInit));
        sd.init().unwrap();
        assert_eq!(sd.read(&mut [0u8; 512], 1), Err(Error::Parameter));
        assert_eq!(sd.read(&mut [0u8; 100], 0), Err(Error::Parameter));
        assert_eq!(sd.program(&[0u8; 512], 511), Err(Error::Parameter));
        let end = sd.capacity();
        assert_eq!(sd.read(&mut [0u8; 512], end), Err(Error::Parameter));
    }

    #[test]
    fn frequency_is_clamped() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        assert_eq!(sd.frequency(30_000_000), Ok(true));
        assert_eq!(*card.borrow().freqs.last().unwrap(), 25_000_000);
        assert_eq!(sd.frequency(10_000_000), Ok(false));
        assert_eq!(*card.borrow().freqs.last().unwrap(), 10_000_000);
    }

    #[test]
    fn deinit_forgets_the_card() {
        let (mut sd, card, _) = setup(Profile::hc());
        sd.init().unwrap();
        sd.deinit().unwrap();
        assert_eq!(sd.card_type(), CardType::None);
        assert_eq!(sd.read(&mut [0u8; 512], 0), Err(Error::NoInit));
        // init probes again from scratch
        let traffic = card.borrow().wire.len();
        sd.init().unwrap();
        assert!(card.borrow().wire.len() > traffic);
    }

    #[test]
    fn csd_v1_capacity() {
        let csd = csd_v1(2047, 7, 9);
        let (sectors, erase) = parse_csd(&csd).unwrap();
        assert_eq!(sectors, 1_048_576);
        assert_eq!(erase, 512);
    }

    #[test]
    fn csd_v2_capacity() {
        let (sectors, erase) = parse_csd(&csd_v2(63)).unwrap();
        assert_eq!(sectors, 64 * 1024);
        assert_eq!(erase, 512);
    }

    #[test]
    fn csd_erase_group_without_single_block_erase() {
        let mut csd = csd_v2(63);
        csd[10] = 0; // ERASE_BLK_EN off
        csd[10] |= 0x3F; // SECTOR_SIZE high bits
        csd[11] |= 0x80; // SECTOR_SIZE low bit
        let (_, erase) = parse_csd(&csd).unwrap();
        assert_eq!(erase, 512 * 128);
    }

    #[test]
    fn block_device_facade() {
        use block_device::BlockDevice;

        let (mut sd, _, _) = setup(Profile::hc());
        BlockDevice::init(&mut sd).unwrap();
        assert_eq!(sd.read_size(), 512);
        assert_eq!(sd.program_size(), 512);
        assert_eq!(sd.erase_size(), 512);
        assert_eq!(sd.device_type(), "SD");
        assert_eq!(BlockDevice::size(&sd), 65536 * 512);
        assert!(sd.is_valid_read(0, 512));
        assert!(!sd.is_valid_read(0, 100));
        sd.erase(0, 512).unwrap();
        sd.sync().unwrap();
    }
}
