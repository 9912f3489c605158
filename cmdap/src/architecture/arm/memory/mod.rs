//! Types and functions for interacting with target memory.
//!
//! Every access goes through the AP selected on the [`DapInterface`]. The first access to an
//! AP probes it, later accesses only write the registers whose cached value is stale.

use bitfield::bitfield;
use scroll::{Pread, Pwrite, LE};

use super::ap::{DataSize, DRW, TAR};
use super::communication_interface::{ArmCommunicationInterface, DapInterface};
use super::dp::{Ctrl, TransferMode};
use super::{ArmError, Register};

bitfield! {
    /// Attributes of a memory access.
    ///
    /// Bit 0 suppresses the address auto-increment, bits [2:1] select the security type.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct AccessAttributes(u8);
    impl Debug;
    pub no_increment, set_no_increment: 0;
    pub u8, security_raw, set_security_raw: 2, 1;
}

impl AccessAttributes {
    pub fn new(security: SecurityType) -> Self {
        let mut attributes = Self::default();
        attributes.set_security(security);
        attributes
    }

    /// The same register over and over, e.g. a FIFO.
    pub fn fixed_address() -> Self {
        let mut attributes = Self::default();
        attributes.set_no_increment(true);
        attributes
    }

    pub fn security(&self) -> SecurityType {
        match self.security_raw() {
            1 => SecurityType::NonSecure,
            2 => SecurityType::Secure,
            3 => SecurityType::Cpu,
            _ => SecurityType::Any,
        }
    }

    pub fn set_security(&mut self, security: SecurityType) {
        self.set_security_raw(security as u8);
    }
}

impl From<u8> for AccessAttributes {
    fn from(raw: u8) -> Self {
        AccessAttributes(raw)
    }
}

/// The security view an access is made with on ARMv8-M.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityType {
    /// Whatever the AP is configured for, secure unless the AP is pinned to non-secure.
    #[default]
    Any = 0,
    NonSecure = 1,
    Secure = 2,
    /// The current security state of the CPU.
    Cpu = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

impl std::fmt::Display for AccessDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessDirection::Read => f.write_str("read"),
            AccessDirection::Write => f.write_str("write"),
        }
    }
}

/// Result of comparing target memory against expected content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    /// The target differs. The chunk that failed was read back into the buffer.
    Mismatch,
}

/// Plain sized memory access, used by the resource detection and the software breakpoint test.
pub trait MemoryInterface {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError>;
    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError>;
    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError>;
    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError>;
    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError>;
    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError>;
}

fn check_alignment(address: u32, size: DataSize) -> Result<(), ArmError> {
    let alignment = size.to_byte_count();
    if address as usize % alignment != 0 {
        return Err(ArmError::MemoryNotAligned { address, alignment });
    }

    Ok(())
}

/// Bit offset of the byte lane `address` lands on in DRW.
fn lane_shift(address: u32) -> u32 {
    (address & 0x3) * 8
}

impl DapInterface {
    fn read_data(
        &mut self,
        address: u32,
        size: DataSize,
        attributes: AccessAttributes,
    ) -> Result<u32, ArmError> {
        check_alignment(address, size)?;
        let _suspend = self.suspend_monitor(address, size.to_byte_count() as u32);

        self.prepare_transfer(size, attributes)?;
        self.write_ap(TAR::ADDRESS, address)?;
        let value = self.read_ap(DRW::ADDRESS)?;

        Ok(value >> lane_shift(address))
    }

    fn write_data(
        &mut self,
        address: u32,
        size: DataSize,
        value: u32,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        check_alignment(address, size)?;
        let _suspend = self.suspend_monitor(address, size.to_byte_count() as u32);

        self.prepare_transfer(size, attributes)?;
        self.write_ap(TAR::ADDRESS, address)?;
        self.write_ap(DRW::ADDRESS, value << lane_shift(address))
    }

    pub fn read_32(&mut self, address: u32, attributes: AccessAttributes) -> Result<u32, ArmError> {
        self.read_data(address, DataSize::U32, attributes)
            .map_err(|e| e.at(address, AccessDirection::Read, DataSize::U32))
    }

    pub fn read_16(&mut self, address: u32, attributes: AccessAttributes) -> Result<u16, ArmError> {
        self.read_data(address, DataSize::U16, attributes)
            .map(|value| value as u16)
            .map_err(|e| e.at(address, AccessDirection::Read, DataSize::U16))
    }

    pub fn read_8(&mut self, address: u32, attributes: AccessAttributes) -> Result<u8, ArmError> {
        self.read_data(address, DataSize::U8, attributes)
            .map(|value| value as u8)
            .map_err(|e| e.at(address, AccessDirection::Read, DataSize::U8))
    }

    pub fn write_32(
        &mut self,
        address: u32,
        value: u32,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.write_data(address, DataSize::U32, value, attributes)
            .map_err(|e| e.at(address, AccessDirection::Write, DataSize::U32))
    }

    pub fn write_16(
        &mut self,
        address: u32,
        value: u16,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.write_data(address, DataSize::U16, value.into(), attributes)
            .map_err(|e| e.at(address, AccessDirection::Write, DataSize::U16))
    }

    pub fn write_8(
        &mut self,
        address: u32,
        value: u8,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.write_data(address, DataSize::U8, value.into(), attributes)
            .map_err(|e| e.at(address, AccessDirection::Write, DataSize::U8))
    }

    /// Check the parameters of a block transfer.
    ///
    /// Blocks are word aligned and, unless the address does not increment, stay inside one
    /// auto-increment page.
    fn check_block(
        &self,
        address: u32,
        len: usize,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        check_alignment(address, DataSize::U32)?;

        let page = self.current_rw_page();
        let invalid = ArmError::InvalidBlockLength { address, len, page };

        if len == 0 || len % 4 != 0 {
            return Err(invalid);
        }

        if !attributes.no_increment() {
            let offset = (address % page) as usize;
            if len > page as usize || offset + len > page as usize {
                return Err(invalid);
            }
        }

        Ok(())
    }

    fn read_block_words(
        &mut self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.prepare_transfer(DataSize::U32, attributes)?;
        self.write_ap(TAR::ADDRESS, address)?;

        let mut words = vec![0u32; data.len() / 4];
        self.read_ap_block(DRW::ADDRESS, &mut words)?;
        self.check_sticky()?;

        for (index, word) in words.iter().enumerate() {
            data.pwrite_with(*word, index * 4, LE)?;
        }

        Ok(())
    }

    /// Read a word aligned block that fits the auto-increment page.
    pub fn read_block(
        &mut self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.check_block(address, data.len(), attributes)?;
        let _suspend = self.suspend_monitor(address, data.len() as u32);

        self.read_block_words(address, data, attributes)
            .map_err(|e| e.at(address, AccessDirection::Read, DataSize::U32))
    }

    fn write_block_words(
        &mut self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        let words = to_words(data)?;

        self.prepare_transfer(DataSize::U32, attributes)?;
        self.write_ap(TAR::ADDRESS, address)?;
        self.write_ap_block(DRW::ADDRESS, &words)?;
        self.check_sticky()
    }

    /// Write a word aligned block that fits the auto-increment page.
    pub fn write_block(
        &mut self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.check_block(address, data.len(), attributes)?;
        let _suspend = self.suspend_monitor(address, data.len() as u32);

        self.write_block_words(address, data, attributes)
            .map_err(|e| e.at(address, AccessDirection::Write, DataSize::U32))
    }

    /// Compare a block against target memory using the pushed verify mode of the DP.
    ///
    /// The target is left untouched, a mismatch is reported through STICKYCMP.
    pub fn verify_block(
        &mut self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        self.check_block(address, data.len(), attributes)?;
        let words = to_words(data)?;

        self.pushed_verify(address, &words, attributes)
            .map_err(|e| e.at(address, AccessDirection::Read, DataSize::U32))
    }

    fn pushed_verify(
        &mut self,
        address: u32,
        words: &[u32],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        self.prepare_transfer(DataSize::U32, attributes)?;
        self.write_ap(TAR::ADDRESS, address)?;

        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_sticky_err(false);
        ctrl.set_sticky_orun(false);
        ctrl.set_w_data_err(false);
        ctrl.set_sticky_cmp(true);
        ctrl.set_transfer_mode(TransferMode::PushedVerify);
        self.write_dp_register(ctrl)?;

        let outcome = self.compare_words(words);

        ctrl.set_sticky_cmp(false);
        ctrl.set_transfer_mode(TransferMode::Normal);
        let restored = self.write_dp_register(ctrl);

        let outcome = outcome?;
        restored?;

        Ok(outcome)
    }

    fn compare_words(&mut self, words: &[u32]) -> Result<VerifyOutcome, ArmError> {
        self.write_ap_block_compare(DRW::ADDRESS, words)?;

        let status: Ctrl = self.read_dp_register()?;
        if status.sticky_cmp() || self.sticky_error(status) {
            self.clear_compare()?;
        }

        if self.sticky_error(status) {
            return Err(ArmError::MemoryFault);
        }

        Ok(if status.sticky_cmp() {
            VerifyOutcome::Mismatch
        } else {
            VerifyOutcome::Match
        })
    }

    /// Read `data.len()` bytes at any alignment.
    ///
    /// The request is split into a leading byte and half-word, page sized word blocks and a
    /// trailing half-word and byte. A block that faults is retried word by word.
    pub fn read_arm_mem(
        &mut self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        let page = self.current_rw_page();
        let mut address = address;
        let mut offset = 0;

        if address & 0x1 != 0 && offset < data.len() {
            data[offset] = self.read_8(address, attributes)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U8)?;
            address = address.wrapping_add(1);
            offset += 1;
        }

        if address & 0x2 != 0 && data.len() - offset >= 2 {
            let value = self.read_16(address, attributes)?;
            data.pwrite_with(value, offset, LE)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U16)?;
            address = address.wrapping_add(2);
            offset += 2;
        }

        while data.len() - offset >= 4 {
            let chunk = block_len(address, data.len() - offset, page);
            let block = &mut data[offset..offset + chunk];

            match self.read_block(address, block, attributes) {
                Ok(()) => {}
                Err(e) if e.is_memory_error() => {
                    tracing::debug!(
                        "Block read at {:#010x} failed, falling back to word reads",
                        address
                    );
                    for (index, word) in block.chunks_exact_mut(4).enumerate() {
                        let value = self.read_32(address + index as u32 * 4, attributes)?;
                        word.pwrite_with(value, 0, LE)?;
                    }
                    self.sticky_after(address, AccessDirection::Read, DataSize::U32)?;
                }
                Err(e) => return Err(e),
            }

            address = address.wrapping_add(chunk as u32);
            offset += chunk;
        }

        if data.len() - offset >= 2 {
            let value = self.read_16(address, attributes)?;
            data.pwrite_with(value, offset, LE)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U16)?;
            address = address.wrapping_add(2);
            offset += 2;
        }

        if offset < data.len() {
            data[offset] = self.read_8(address, attributes)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U8)?;
        }

        Ok(())
    }

    /// Write `data` at any alignment, split the same way as [`DapInterface::read_arm_mem`].
    pub fn write_arm_mem(
        &mut self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        let page = self.current_rw_page();
        let mut address = address;
        let mut offset = 0;

        if address & 0x1 != 0 && offset < data.len() {
            self.write_8(address, data[offset], attributes)?;
            self.sticky_after(address, AccessDirection::Write, DataSize::U8)?;
            address = address.wrapping_add(1);
            offset += 1;
        }

        if address & 0x2 != 0 && data.len() - offset >= 2 {
            let value: u16 = data.pread_with(offset, LE)?;
            self.write_16(address, value, attributes)?;
            self.sticky_after(address, AccessDirection::Write, DataSize::U16)?;
            address = address.wrapping_add(2);
            offset += 2;
        }

        while data.len() - offset >= 4 {
            let chunk = block_len(address, data.len() - offset, page);
            let block = &data[offset..offset + chunk];

            match self.write_block(address, block, attributes) {
                Ok(()) => {}
                Err(e) if e.is_memory_error() => {
                    tracing::debug!(
                        "Block write at {:#010x} failed, falling back to word writes",
                        address
                    );
                    for (index, word) in block.chunks_exact(4).enumerate() {
                        let value: u32 = word.pread_with(0, LE)?;
                        self.write_32(address + index as u32 * 4, value, attributes)?;
                    }
                    self.sticky_after(address, AccessDirection::Write, DataSize::U32)?;
                }
                Err(e) => return Err(e),
            }

            address = address.wrapping_add(chunk as u32);
            offset += chunk;
        }

        if data.len() - offset >= 2 {
            let value: u16 = data.pread_with(offset, LE)?;
            self.write_16(address, value, attributes)?;
            self.sticky_after(address, AccessDirection::Write, DataSize::U16)?;
            address = address.wrapping_add(2);
            offset += 2;
        }

        if offset < data.len() {
            self.write_8(address, data[offset], attributes)?;
            self.sticky_after(address, AccessDirection::Write, DataSize::U8)?;
        }

        Ok(())
    }

    /// Compare `data` against target memory at any alignment.
    ///
    /// Stops at the first chunk that differs and replaces that chunk of `data` with the
    /// target content.
    pub fn verify_arm_mem(
        &mut self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        let page = self.current_rw_page();
        let mut address = address;
        let mut offset = 0;

        if address & 0x1 != 0 && offset < data.len() {
            let value = self.read_8(address, attributes)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U8)?;
            if value != data[offset] {
                data[offset] = value;
                return Ok(VerifyOutcome::Mismatch);
            }
            address = address.wrapping_add(1);
            offset += 1;
        }

        if address & 0x2 != 0 && data.len() - offset >= 2 {
            if self.verify_half_word(address, &mut data[offset..offset + 2], attributes)?
                == VerifyOutcome::Mismatch
            {
                return Ok(VerifyOutcome::Mismatch);
            }
            address = address.wrapping_add(2);
            offset += 2;
        }

        while data.len() - offset >= 4 {
            let chunk = block_len(address, data.len() - offset, page);
            let block = &mut data[offset..offset + chunk];

            match self.verify_block(address, block, attributes) {
                Ok(VerifyOutcome::Match) => {}
                Ok(VerifyOutcome::Mismatch) => {
                    self.read_block(address, block, attributes)?;
                    return Ok(VerifyOutcome::Mismatch);
                }
                Err(e) if e.is_memory_error() => {
                    tracing::debug!(
                        "Block verify at {:#010x} failed, falling back to word reads",
                        address
                    );
                    let mut outcome = VerifyOutcome::Match;
                    for (index, word) in block.chunks_exact_mut(4).enumerate() {
                        let value = self.read_32(address + index as u32 * 4, attributes)?;
                        let expected: u32 = word.pread_with(0, LE)?;
                        if value != expected {
                            word.pwrite_with(value, 0, LE)?;
                            outcome = VerifyOutcome::Mismatch;
                        }
                    }
                    self.sticky_after(address, AccessDirection::Read, DataSize::U32)?;
                    if outcome == VerifyOutcome::Mismatch {
                        return Ok(outcome);
                    }
                }
                Err(e) => return Err(e),
            }

            address = address.wrapping_add(chunk as u32);
            offset += chunk;
        }

        if data.len() - offset >= 2 {
            if self.verify_half_word(address, &mut data[offset..offset + 2], attributes)?
                == VerifyOutcome::Mismatch
            {
                return Ok(VerifyOutcome::Mismatch);
            }
            address = address.wrapping_add(2);
            offset += 2;
        }

        if offset < data.len() {
            let value = self.read_8(address, attributes)?;
            self.sticky_after(address, AccessDirection::Read, DataSize::U8)?;
            if value != data[offset] {
                data[offset] = value;
                return Ok(VerifyOutcome::Mismatch);
            }
        }

        Ok(VerifyOutcome::Match)
    }

    fn verify_half_word(
        &mut self,
        address: u32,
        expected: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        let value = self.read_16(address, attributes)?;
        self.sticky_after(address, AccessDirection::Read, DataSize::U16)?;

        if value != expected.pread_with::<u16>(0, LE)? {
            expected.pwrite_with(value, 0, LE)?;
            return Ok(VerifyOutcome::Mismatch);
        }

        Ok(VerifyOutcome::Match)
    }

    fn sticky_after(
        &mut self,
        address: u32,
        direction: AccessDirection,
        size: DataSize,
    ) -> Result<(), ArmError> {
        self.check_sticky()
            .map_err(|e| e.at(address, direction, size))
    }
}

/// Length of the next block of an ARM memory transfer: the rest of the page, or all
/// remaining whole words if they end before it.
fn block_len(address: u32, remaining: usize, page: u32) -> usize {
    let to_page_end = (page - (address & (page - 1))) as usize;
    if remaining < to_page_end {
        remaining & !0x3
    } else {
        to_page_end
    }
}

fn to_words(data: &[u8]) -> Result<Vec<u32>, ArmError> {
    data.chunks_exact(4)
        .map(|chunk| chunk.pread_with::<u32>(0, LE).map_err(ArmError::from))
        .collect()
}

impl MemoryInterface for DapInterface {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
        self.read_32(address, AccessAttributes::default())
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError> {
        self.write_32(address, data, AccessAttributes::default())
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError> {
        self.read_16(address, AccessAttributes::default())
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError> {
        self.write_16(address, data, AccessAttributes::default())
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError> {
        self.read_8(address, AccessAttributes::default())
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError> {
        self.write_8(address, data, AccessAttributes::default())
    }
}

impl ArmCommunicationInterface {
    pub fn read_32(&self, address: u32, attributes: AccessAttributes) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.read_32(address, attributes))
    }

    pub fn read_16(&self, address: u32, attributes: AccessAttributes) -> Result<u16, ArmError> {
        self.transaction(|interface| interface.read_16(address, attributes))
    }

    pub fn read_8(&self, address: u32, attributes: AccessAttributes) -> Result<u8, ArmError> {
        self.transaction(|interface| interface.read_8(address, attributes))
    }

    pub fn write_32(
        &self,
        address: u32,
        value: u32,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_32(address, value, attributes))
    }

    pub fn write_16(
        &self,
        address: u32,
        value: u16,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_16(address, value, attributes))
    }

    pub fn write_8(
        &self,
        address: u32,
        value: u8,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_8(address, value, attributes))
    }

    pub fn read_block(
        &self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.read_block(address, data, attributes))
    }

    pub fn write_block(
        &self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_block(address, data, attributes))
    }

    pub fn verify_block(
        &self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        self.transaction(|interface| interface.verify_block(address, data, attributes))
    }

    pub fn read_arm_mem(
        &self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.read_arm_mem(address, data, attributes))
    }

    pub fn write_arm_mem(
        &self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_arm_mem(address, data, attributes))
    }

    pub fn verify_arm_mem(
        &self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, ArmError> {
        self.transaction(|interface| interface.verify_arm_mem(address, data, attributes))
    }
}

impl MemoryInterface for ArmCommunicationInterface {
    fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.read_word_32(address))
    }

    fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_word_32(address, data))
    }

    fn read_word_16(&mut self, address: u32) -> Result<u16, ArmError> {
        self.transaction(|interface| interface.read_word_16(address))
    }

    fn write_word_16(&mut self, address: u32, data: u16) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_word_16(address, data))
    }

    fn read_word_8(&mut self, address: u32) -> Result<u8, ArmError> {
        self.transaction(|interface| interface.read_word_8(address))
    }

    fn write_word_8(&mut self, address: u32, data: u8) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_word_8(address, data))
    }
}
