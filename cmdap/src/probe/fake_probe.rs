//! A simulated debug port with memory access ports and a Cortex-M core behind them.
//!
//! The simulation works on the register level, so everything the engine does on the wire
//! can be observed: SELECT and CSW writes, aborts, IDR reads. Faults, timeouts and missing
//! power acknowledges can be injected.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::architecture::arm::ap::csw;
use crate::architecture::arm::core::DBGKEY;
use crate::architecture::arm::dp::Abort;
use crate::architecture::arm::{DapError, PortType, RawDapAccess};

/// IDR of the AHB-AP in front of a Cortex-M3 or Cortex-M4.
pub const CORTEX_M4_AHB_AP: u32 = 0x2477_0011;
/// CPUID of a Cortex-M4 r0p1.
pub const CORTEX_M4_CPUID: u32 = 0x410F_C241;

const DPIDR: u32 = 0x2BA0_1477;

const CPUID: u32 = 0xE000_ED00;
const DHCSR: u32 = 0xE000_EDF0;
const DCRSR: u32 = 0xE000_EDF4;
const DCRDR: u32 = 0xE000_EDF8;

const S_REGRDY: u32 = 1 << 16;
const S_HALT: u32 = 1 << 17;
const REGWNR: u32 = 1 << 16;

const STICKYORUN: u32 = 1 << 1;
const STICKYCMP: u32 = 1 << 4;
const STICKYERR: u32 = 1 << 5;
const WDATAERR: u32 = 1 << 7;
/// CTRL/STAT bits that are cleared by writing one.
const CTRL_STICKY: u32 = STICKYORUN | STICKYCMP | STICKYERR | WDATAERR;
const TRNMODE: u32 = 0x0000_000C;
const PUSHED_VERIFY: u32 = 0x0000_0004;
const CDBGPWRUPREQ: u32 = 1 << 28;
const CDBGPWRUPACK: u32 = 1 << 29;
const CSYSPWRUPREQ: u32 = 1 << 30;
const CSYSPWRUPACK: u32 = 1 << 31;

const AP_CSW: u8 = 0x00;
const AP_TAR: u8 = 0x04;
const AP_DRW: u8 = 0x0C;
const AP_IDR: u8 = 0xFC;

/// One simulated memory access port.
#[derive(Debug, Clone)]
pub struct FakeAp {
    pub idr: u32,
    /// Byte transfers stick in CSW.SIZE.
    pub bytes: bool,
    pub half_words: bool,
    /// Packed address increment sticks in CSW.ADDRINC.
    pub packed: bool,
    /// CSW.SPIDEN as reported by a CoreSight AP.
    pub spiden: bool,
    /// Size of the TAR auto-increment window.
    pub page: u32,
    csw: u32,
    tar: u32,
}

impl FakeAp {
    pub fn new(idr: u32) -> Self {
        Self {
            idr,
            bytes: true,
            half_words: true,
            packed: true,
            spiden: true,
            page: 0x400,
            csw: csw::DEFAULT_BASE | csw::SIZE32,
            tar: 0,
        }
    }

    /// The AHB-AP of a Cortex-M4, with its 4 KiB increment window.
    pub fn cortex_m4() -> Self {
        Self {
            page: 0x1000,
            ..Self::new(CORTEX_M4_AHB_AP)
        }
    }

    /// An AP that only does 32 bit transfers.
    pub fn word_only(mut self) -> Self {
        self.bytes = false;
        self.half_words = false;
        self
    }

    pub fn unpacked(mut self) -> Self {
        self.packed = false;
        self
    }

    pub fn without_spiden(mut self) -> Self {
        self.spiden = false;
        self
    }

    fn transfer_bytes(&self) -> u32 {
        match self.csw & csw::SIZE {
            csw::SIZE8 => 1,
            csw::SIZE16 => 2,
            _ => 4,
        }
    }

    /// Unimplemented sizes and increment modes read back as something else.
    fn write_csw(&mut self, value: u32) {
        let mut value = value & !csw::SPIDEN;

        let size = value & csw::SIZE;
        if (size == csw::SIZE8 && !self.bytes) || (size == csw::SIZE16 && !self.half_words) {
            value = (value & !csw::SIZE) | csw::SIZE32;
        }

        if value & csw::ADDRINC == csw::PADDRINC && !self.packed {
            value &= !csw::ADDRINC;
        }

        self.csw = value;
    }

    fn read_csw(&self) -> u32 {
        if self.spiden {
            self.csw | csw::SPIDEN
        } else {
            self.csw
        }
    }

    /// TAR increments by the transfer size and wraps inside its page.
    fn advance(&mut self) {
        if self.csw & csw::ADDRINC == csw::NADDRINC {
            return;
        }

        let window = self.page - 1;
        self.tar = (self.tar & !window) | (self.tar.wrapping_add(self.transfer_bytes()) & window);
    }
}

/// What went over the wire since the last [`FakeProbe::reset_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub select_writes: usize,
    pub csw_writes: usize,
    pub tar_writes: usize,
    pub idr_reads: usize,
    /// Single DRW transfers, including the ones of block transfers.
    pub drw_transfers: usize,
    pub block_transfers: usize,
    pub dp_switches: usize,
    pub ctrl_reads: usize,
    /// Every value written to ABORT, in order.
    pub aborts: Vec<u32>,
    /// Every write to DHCSR that carried the debug key.
    pub dhcsr_writes: Vec<u32>,
}

impl FakeStats {
    /// Number of aborted AP transactions.
    pub fn dap_aborts(&self) -> usize {
        self.aborts
            .iter()
            .filter(|value| *value & Abort::DAPABORT != 0)
            .count()
    }
}

#[derive(Debug, Default)]
struct FakeDp {
    ctrl: u32,
    select: u32,
    rdbuff: u32,
}

#[derive(Debug)]
struct FakeTarget {
    dp: u8,
    dps: HashMap<u8, FakeDp>,
    aps: HashMap<(u8, u8), FakeAp>,
    memory: HashMap<u32, u8>,
    read_only: Vec<Range<u32>>,
    faults: Vec<Range<u32>>,
    fail_blocks: bool,
    drw_timeouts: u32,
    power_ack: bool,
    core_registers: HashMap<u8, u32>,
    dhcsr: u32,
    dcrdr: u32,
    stats: FakeStats,
}

impl FakeTarget {
    fn new() -> Self {
        let mut target = Self {
            dp: 0,
            dps: HashMap::new(),
            aps: HashMap::new(),
            memory: HashMap::new(),
            read_only: Vec::new(),
            faults: Vec::new(),
            fail_blocks: false,
            drw_timeouts: 0,
            power_ack: true,
            core_registers: HashMap::new(),
            dhcsr: 0,
            dcrdr: 0,
            stats: FakeStats::default(),
        };

        target.dps.insert(0, FakeDp::default());
        target.aps.insert((0, 0), FakeAp::cortex_m4());
        target.store(CPUID, &CORTEX_M4_CPUID.to_le_bytes());
        target
    }

    fn dp(&mut self) -> &mut FakeDp {
        self.dps.entry(self.dp).or_default()
    }

    fn ctrl(&mut self) -> u32 {
        let power_ack = self.power_ack;
        let ctrl = self.dp().ctrl;

        let mut acks = 0;
        if power_ack && ctrl & CDBGPWRUPREQ != 0 {
            acks |= CDBGPWRUPACK;
        }
        if power_ack && ctrl & CSYSPWRUPREQ != 0 {
            acks |= CSYSPWRUPACK;
        }

        ctrl | acks
    }

    fn raise(&mut self, flags: u32) {
        self.dp().ctrl |= flags;
    }

    fn abort(&mut self, value: u32) {
        self.stats.aborts.push(value);

        let mut cleared = 0;
        if value & Abort::STKCMPCLR != 0 {
            cleared |= STICKYCMP;
        }
        if value & Abort::STKERRCLR != 0 {
            cleared |= STICKYERR;
        }
        if value & Abort::WDERRCLR != 0 {
            cleared |= WDATAERR;
        }
        if value & Abort::ORUNERRCLR != 0 {
            cleared |= STICKYORUN;
        }
        self.dp().ctrl &= !cleared;
    }

    fn read_dp(&mut self, address: u8) -> u32 {
        match address & 0xC {
            0x0 => DPIDR,
            0x4 => {
                self.stats.ctrl_reads += 1;
                self.ctrl()
            }
            0x8 => self.dp().select,
            _ => self.dp().rdbuff,
        }
    }

    fn write_dp(&mut self, address: u8, value: u32) {
        match address & 0xC {
            0x0 => self.abort(value),
            0x4 => {
                let dp = self.dp();
                let sticky = dp.ctrl & CTRL_STICKY & !value;
                dp.ctrl = sticky | (value & !CTRL_STICKY & !(CDBGPWRUPACK | CSYSPWRUPACK));
            }
            0x8 => {
                self.stats.select_writes += 1;
                self.dp().select = value;
            }
            _ => {}
        }
    }

    /// The selected AP and the full register address from SELECT.
    fn ap_address(&mut self, address: u8) -> ((u8, u8), u8) {
        let dp = self.dp;
        let select = self.dp().select;
        let ap = (select >> 24) as u8;
        let bank = ((select >> 4) & 0xF) as u8;

        ((dp, ap), (bank << 4) | (address & 0xC))
    }

    fn pushed_verify(&mut self) -> bool {
        self.dp().ctrl & TRNMODE == PUSHED_VERIFY
    }

    fn check_fault(&mut self, address: u32) -> Result<(), DapError> {
        if self.faults.iter().any(|range| range.contains(&address)) {
            self.raise(STICKYERR);
            return Err(DapError::StickyError);
        }

        Ok(())
    }

    fn take_timeout(&mut self) -> Result<(), DapError> {
        if self.drw_timeouts > 0 {
            self.drw_timeouts -= 1;
            return Err(DapError::Timeout);
        }

        Ok(())
    }

    fn read_ap(&mut self, address: u8) -> Result<u32, DapError> {
        let (key, address) = self.ap_address(address);

        let value = match address {
            AP_CSW => self.aps.get(&key).map_or(0, FakeAp::read_csw),
            AP_TAR => self.aps.get(&key).map_or(0, |ap| ap.tar),
            AP_DRW => self.read_drw(key)?,
            0x10..=0x1C => self.read_banked(key, address)?,
            AP_IDR => {
                self.stats.idr_reads += 1;
                self.aps.get(&key).map_or(0, |ap| ap.idr)
            }
            _ => 0,
        };

        self.dp().rdbuff = value;
        Ok(value)
    }

    fn write_ap(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        let (key, address) = self.ap_address(address);

        match address {
            AP_CSW => {
                self.stats.csw_writes += 1;
                if let Some(ap) = self.aps.get_mut(&key) {
                    ap.write_csw(value);
                }
            }
            AP_TAR => {
                self.stats.tar_writes += 1;
                if let Some(ap) = self.aps.get_mut(&key) {
                    ap.tar = value;
                }
            }
            AP_DRW => self.write_drw(key, value)?,
            0x10..=0x1C => self.write_banked(key, address, value)?,
            _ => {}
        }

        Ok(())
    }

    fn read_drw(&mut self, key: (u8, u8)) -> Result<u32, DapError> {
        self.take_timeout()?;
        let Some(address) = self.aps.get(&key).map(|ap| ap.tar) else {
            return Ok(0);
        };

        self.stats.drw_transfers += 1;
        self.check_fault(address)?;
        let value = self.read_bus(address);

        if let Some(ap) = self.aps.get_mut(&key) {
            ap.advance();
        }

        Ok(value)
    }

    fn write_drw(&mut self, key: (u8, u8), value: u32) -> Result<(), DapError> {
        self.take_timeout()?;
        let Some((address, size)) = self.aps.get(&key).map(|ap| (ap.tar, ap.transfer_bytes()))
        else {
            return Ok(());
        };

        self.stats.drw_transfers += 1;
        self.check_fault(address)?;

        let result = if self.pushed_verify() {
            let lanes = lane_mask(address, size);
            if (self.read_bus(address) ^ value) & lanes != 0 {
                self.raise(STICKYCMP);
                Err(DapError::StickyError)
            } else {
                Ok(())
            }
        } else {
            self.write_bus(address, value, size);
            Ok(())
        };

        if let Some(ap) = self.aps.get_mut(&key) {
            ap.advance();
        }

        result
    }

    fn banked_address(&self, key: (u8, u8), address: u8) -> Option<u32> {
        self.aps
            .get(&key)
            .map(|ap| (ap.tar & !0xF) + u32::from(address - 0x10))
    }

    fn read_banked(&mut self, key: (u8, u8), address: u8) -> Result<u32, DapError> {
        let Some(address) = self.banked_address(key, address) else {
            return Ok(0);
        };

        self.check_fault(address)?;
        Ok(self.read_bus(address))
    }

    fn write_banked(&mut self, key: (u8, u8), address: u8, value: u32) -> Result<(), DapError> {
        let Some(address) = self.banked_address(key, address) else {
            return Ok(());
        };

        self.check_fault(address)?;
        self.write_bus(address, value, 4);
        Ok(())
    }

    /// The word containing `address`, as the AHB returns it on all byte lanes.
    fn read_bus(&self, address: u32) -> u32 {
        let word = address & !0x3;
        match word {
            DHCSR => self.dhcsr | S_REGRDY | S_HALT,
            DCRDR => self.dcrdr,
            _ => (0..4).fold(0, |acc, lane| {
                let byte = self.memory.get(&(word + lane)).copied().unwrap_or(0);
                acc | (u32::from(byte) << (lane * 8))
            }),
        }
    }

    /// Write the `size` bytes starting at `address`, taken from their byte lanes of `value`.
    fn write_bus(&mut self, address: u32, value: u32, size: u32) {
        match address & !0x3 {
            DHCSR => {
                if value & 0xFFFF_0000 == DBGKEY {
                    self.stats.dhcsr_writes.push(value);
                    self.dhcsr = value & 0xFFFF;
                }
            }
            DCRSR => {
                let regsel = (value & 0x7F) as u8;
                if value & REGWNR != 0 {
                    self.core_registers.insert(regsel, self.dcrdr);
                } else {
                    self.dcrdr = self.core_registers.get(&regsel).copied().unwrap_or(0);
                }
            }
            DCRDR => self.dcrdr = value,
            _ => {
                for offset in 0..size {
                    let byte_address = address.wrapping_add(offset);
                    if self
                        .read_only
                        .iter()
                        .any(|range| range.contains(&byte_address))
                    {
                        continue;
                    }

                    let lane = (byte_address & 0x3) * 8;
                    self.memory.insert(byte_address, (value >> lane) as u8);
                }
            }
        }
    }

    fn store(&mut self, address: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(offset as u32), *byte);
        }
    }

    fn start_block(&mut self, port: PortType) -> Result<(), DapError> {
        if port == PortType::AccessPort {
            self.stats.block_transfers += 1;
            if self.fail_blocks {
                self.raise(STICKYERR);
                return Err(DapError::StickyError);
            }
        }

        Ok(())
    }
}

fn lane_mask(address: u32, size: u32) -> u32 {
    if size >= 4 {
        u32::MAX
    } else {
        ((1u32 << (size * 8)) - 1) << ((address & 0x3) * 8)
    }
}

/// A register transport backed by a simulated target.
///
/// Clones share the target, so a test can hand one clone to the session and inspect the
/// other.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    target: Arc<Mutex<FakeTarget>>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProbe {
    /// A powered Cortex-M4 behind AP 0 of DP 0.
    pub fn new() -> Self {
        Self {
            target: Arc::new(Mutex::new(FakeTarget::new())),
        }
    }

    pub fn boxed(&self) -> Box<dyn RawDapAccess> {
        Box::new(self.clone())
    }

    /// Add or replace an access port, creating its debug port if needed.
    pub fn add_ap(&self, dp: u8, ap: u8, fake: FakeAp) {
        let mut target = self.target.lock();
        target.dps.entry(dp).or_default();
        target.aps.insert((dp, ap), fake);
    }

    /// Whether the power domains acknowledge a power-up request.
    pub fn set_power_ack(&self, ack: bool) {
        self.target.lock().power_ack = ack;
    }

    /// Make every AP block transfer fault, single transfers still work.
    pub fn fail_blocks(&self, fail: bool) {
        self.target.lock().fail_blocks = fail;
    }

    /// Make every transfer to an address in `range` fault.
    pub fn add_fault(&self, range: Range<u32>) {
        self.target.lock().faults.push(range);
    }

    /// Ignore writes to `range`, like flash.
    pub fn add_read_only(&self, range: Range<u32>) {
        self.target.lock().read_only.push(range);
    }

    /// Let the next `count` DRW transfers time out.
    pub fn timeout_drw(&self, count: u32) {
        self.target.lock().drw_timeouts = count;
    }

    pub fn write_memory(&self, address: u32, data: &[u8]) {
        self.target.lock().store(address, data);
    }

    pub fn write_word(&self, address: u32, value: u32) {
        self.write_memory(address, &value.to_le_bytes());
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        let target = self.target.lock();
        (0..len)
            .map(|offset| {
                target
                    .memory
                    .get(&address.wrapping_add(offset as u32))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn read_word(&self, address: u32) -> u32 {
        self.target.lock().read_bus(address)
    }

    /// A core register by its DCRSR selector.
    pub fn core_register(&self, regsel: u8) -> u32 {
        self.target
            .lock()
            .core_registers
            .get(&regsel)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_core_register(&self, regsel: u8, value: u32) {
        self.target.lock().core_registers.insert(regsel, value);
    }

    /// CTRL/STAT of the selected DP.
    pub fn ctrl(&self) -> u32 {
        self.target.lock().ctrl()
    }

    pub fn csw(&self, dp: u8, ap: u8) -> Option<u32> {
        self.target.lock().aps.get(&(dp, ap)).map(|ap| ap.csw)
    }

    pub fn stats(&self) -> FakeStats {
        self.target.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.target.lock().stats = FakeStats::default();
    }
}

impl RawDapAccess for FakeProbe {
    fn select_dp(&mut self, dp: u8) -> Result<(), DapError> {
        let mut target = self.target.lock();
        if !target.dps.contains_key(&dp) {
            return Err(DapError::Failure);
        }

        target.stats.dp_switches += 1;
        target.dp = dp;
        Ok(())
    }

    fn raw_read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DapError> {
        let mut target = self.target.lock();
        match port {
            PortType::DebugPort => Ok(target.read_dp(addr)),
            PortType::AccessPort => target.read_ap(addr),
        }
    }

    fn raw_read_block(
        &mut self,
        port: PortType,
        addr: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        let mut target = self.target.lock();
        target.start_block(port)?;

        for value in values {
            *value = match port {
                PortType::DebugPort => target.read_dp(addr),
                PortType::AccessPort => target.read_ap(addr)?,
            };
        }

        Ok(())
    }

    fn raw_write_register(&mut self, port: PortType, addr: u8, value: u32) -> Result<(), DapError> {
        let mut target = self.target.lock();
        match port {
            PortType::DebugPort => {
                target.write_dp(addr, value);
                Ok(())
            }
            PortType::AccessPort => target.write_ap(addr, value),
        }
    }

    fn raw_write_block(&mut self, port: PortType, addr: u8, values: &[u32]) -> Result<(), DapError> {
        let mut target = self.target.lock();
        target.start_block(port)?;

        for value in values {
            match port {
                PortType::DebugPort => target.write_dp(addr, *value),
                PortType::AccessPort => target.write_ap(addr, *value)?,
            }
        }

        Ok(())
    }

    fn raw_abort(&mut self, value: u32) -> Result<(), DapError> {
        self.target.lock().abort(value);
        Ok(())
    }
}
