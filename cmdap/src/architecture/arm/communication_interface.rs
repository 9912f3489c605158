use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use static_assertions::assert_impl_all;

use super::ap::{AddressIncrement, ApContext, ApContextTable, DataSize, CSW, IDR};
use super::core::cortex_m::{CpuInfo, DHCSR_ADDRESS};
use super::dp::{Ctrl, DebugPortId, Select, DPIDR};
use super::memory::AccessAttributes;
use super::{ArmError, DapError, DapProtocol, PortType, RawDapAccess, Register};
use crate::config::WireProtocol;

/// The auto-increment page assumed for every AP but the one the CPU is debugged through.
pub const DEFAULT_RW_PAGE: u32 = 0x400;

const POWER_UP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A background observer of the core debug state, e.g. a thread polling DHCSR.
///
/// The interface suspends it while DHCSR itself is accessed, because reading DHCSR clears
/// some of its sticky status bits.
pub trait DeviceMonitor: Send + Sync {
    fn suspend(&self);
    fn resume(&self);
}

/// Keeps the [`DeviceMonitor`] suspended while alive.
pub(crate) struct MonitorSuspend {
    monitor: Option<Arc<dyn DeviceMonitor>>,
}

impl MonitorSuspend {
    fn new(monitor: Option<Arc<dyn DeviceMonitor>>) -> Self {
        if let Some(monitor) = &monitor {
            monitor.suspend();
        }

        Self { monitor }
    }
}

impl Drop for MonitorSuspend {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.resume();
        }
    }
}

/// The DP, AP and AP register bank the transport is currently pointed at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub dp: u8,
    pub ap: u8,
    /// `None` until the next SELECT write.
    pub bank: Option<u8>,
}

/// The state behind the transport lock.
///
/// All methods assume the caller holds the lock, see [`ArmCommunicationInterface::transaction`].
pub struct DapInterface {
    probe: Box<dyn RawDapAccess>,
    protocol: Box<dyn DapProtocol>,
    selection: Selection,
    contexts: ApContextTable,
    pub(crate) cpu_dp: u8,
    pub(crate) cpu_ap: u8,
    pub(crate) cpu: Option<CpuInfo>,
    /// Address of the core debug block, i.e. DHCSR.
    pub(crate) dbg_addr: u32,
    pub(crate) register_poll_retries: u32,
    monitor: Option<Arc<dyn DeviceMonitor>>,
}

impl Debug for DapInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapInterface")
            .field("protocol", &self.protocol)
            .field("selection", &self.selection)
            .field("cpu_dp", &self.cpu_dp)
            .field("cpu_ap", &self.cpu_ap)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

impl DapInterface {
    pub fn new(probe: Box<dyn RawDapAccess>, protocol: WireProtocol, dp: u8, ap: u8) -> Self {
        Self {
            probe,
            protocol: protocol.into(),
            // Transports start out talking to DP 0.
            selection: Selection {
                dp: 0,
                ap,
                bank: None,
            },
            contexts: ApContextTable::default(),
            cpu_dp: dp,
            cpu_ap: ap,
            cpu: None,
            dbg_addr: DHCSR_ADDRESS,
            register_poll_retries: 100,
            monitor: None,
        }
    }

    pub fn wire_protocol(&self) -> WireProtocol {
        self.protocol.wire_protocol()
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn cpu_info(&self) -> Option<&CpuInfo> {
        self.cpu.as_ref()
    }

    /// Whether the debugged CPU implements ARMv8-M.
    pub fn is_v8m(&self) -> bool {
        self.cpu.as_ref().map_or(false, |cpu| cpu.model.is_v8m())
    }

    pub(crate) fn set_monitor(&mut self, monitor: Option<Arc<dyn DeviceMonitor>>) {
        self.monitor = monitor;
    }

    /// Suspend the device monitor if `len` bytes at `address` touch DHCSR.
    pub(crate) fn suspend_monitor(&self, address: u32, len: u32) -> MonitorSuspend {
        let end = u64::from(address) + u64::from(len);
        let dhcsr = u64::from(self.dbg_addr);

        if u64::from(address) <= dhcsr && end > dhcsr {
            MonitorSuspend::new(self.monitor.clone())
        } else {
            MonitorSuspend::new(None)
        }
    }

    /// Route the following transfers to debug port `dp`.
    pub fn switch_dp(&mut self, dp: u8) -> Result<(), ArmError> {
        if dp == self.selection.dp {
            return Ok(());
        }

        tracing::debug!("Switching to DP {}", dp);
        if let Err(e) = self.probe.select_dp(dp) {
            return Err(self.protocol.recover(self.probe.as_mut(), e));
        }

        self.selection.dp = dp;
        self.selection.bank = None;

        Ok(())
    }

    /// Route the following AP transfers to access port `ap`.
    pub fn select_ap(&mut self, ap: u8) {
        if ap != self.selection.ap {
            tracing::debug!("Selecting AP {}", ap);
            self.selection.ap = ap;
            self.selection.bank = None;
        }
    }

    /// Point the transport back at the AP the CPU is debugged through.
    pub fn select_cpu_ap(&mut self) -> Result<(), ArmError> {
        self.switch_dp(self.cpu_dp)?;
        self.select_ap(self.cpu_ap);
        Ok(())
    }

    fn dp_transfer<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn RawDapAccess) -> Result<T, DapError>,
    ) -> Result<T, ArmError> {
        let error = match op(self.probe.as_mut()) {
            Ok(value) => return Ok(value),
            Err(e) => self.protocol.recover(self.probe.as_mut(), e),
        };

        if !error.is_memory_error() {
            return Err(error);
        }

        tracing::debug!("DP transfer failed, retrying once");
        op(self.probe.as_mut()).map_err(|e| self.protocol.recover(self.probe.as_mut(), e))
    }

    fn ap_transfer<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn RawDapAccess) -> Result<T, DapError>,
    ) -> Result<T, ArmError> {
        match op(self.probe.as_mut()) {
            Ok(value) => Ok(value),
            Err(DapError::Timeout) => {
                let error = self.protocol.recover(self.probe.as_mut(), DapError::Timeout);
                if !error.is_memory_error() {
                    return Err(error);
                }

                tracing::debug!("AP transfer timed out, retrying once");
                op(self.probe.as_mut()).map_err(|e| self.protocol.recover(self.probe.as_mut(), e))
            }
            Err(e) => Err(self.protocol.recover(self.probe.as_mut(), e)),
        }
    }

    pub fn read_dp(&mut self, address: u8) -> Result<u32, ArmError> {
        self.dp_transfer(|probe| probe.raw_read_register(PortType::DebugPort, address))
    }

    pub fn write_dp(&mut self, address: u8, value: u32) -> Result<(), ArmError> {
        self.dp_transfer(|probe| probe.raw_write_register(PortType::DebugPort, address, value))
    }

    pub fn read_dp_register<R: Register>(&mut self) -> Result<R, ArmError> {
        Ok(R::from(self.read_dp(R::ADDRESS)?))
    }

    pub fn write_dp_register<R: Register>(&mut self, register: R) -> Result<(), ArmError> {
        self.write_dp(R::ADDRESS, register.into())
    }

    /// Write the ABORT register.
    pub fn abort(&mut self, value: u32) -> Result<(), ArmError> {
        self.probe.raw_abort(value).map_err(ArmError::from)
    }

    fn select_ap_bank(&mut self, address: u8) -> Result<(), ArmError> {
        let bank = address & 0xF0;
        if self.selection.bank == Some(bank) {
            return Ok(());
        }

        let mut select = Select::from(0);
        select.set_ap_sel(self.selection.ap);
        select.set_ap_bank_sel(bank >> 4);

        tracing::trace!("Changing AP to {}, AP_BANK_SEL to {:#x}", self.selection.ap, bank);

        self.selection.bank = None;
        self.write_dp_register(select)?;
        self.selection.bank = Some(bank);

        Ok(())
    }

    pub fn read_ap(&mut self, address: u8) -> Result<u32, ArmError> {
        self.select_ap_bank(address)?;
        self.ap_transfer(|probe| probe.raw_read_register(PortType::AccessPort, address & 0xC))
    }

    pub fn write_ap(&mut self, address: u8, value: u32) -> Result<(), ArmError> {
        self.select_ap_bank(address)?;
        self.ap_transfer(|probe| {
            probe.raw_write_register(PortType::AccessPort, address & 0xC, value)
        })
    }

    /// Read the same AP register `values.len()` times. Failures are not retried.
    pub fn read_ap_block(&mut self, address: u8, values: &mut [u32]) -> Result<(), ArmError> {
        self.select_ap_bank(address)?;
        self.probe
            .raw_read_block(PortType::AccessPort, address & 0xC, values)
            .map_err(|e| self.protocol.recover(self.probe.as_mut(), e))
    }

    /// Write the same AP register once per value. Failures are not retried.
    pub fn write_ap_block(&mut self, address: u8, values: &[u32]) -> Result<(), ArmError> {
        self.select_ap_bank(address)?;
        self.probe
            .raw_write_block(PortType::AccessPort, address & 0xC, values)
            .map_err(|e| self.protocol.recover(self.probe.as_mut(), e))
    }

    /// Write a block in pushed verify mode.
    ///
    /// A mismatch makes the transport report a sticky error, which is left for the caller
    /// to inspect in CTRL/STAT.
    pub(crate) fn write_ap_block_compare(
        &mut self,
        address: u8,
        values: &[u32],
    ) -> Result<(), ArmError> {
        self.select_ap_bank(address)?;
        match self
            .probe
            .raw_write_block(PortType::AccessPort, address & 0xC, values)
        {
            Ok(()) | Err(DapError::StickyError) => Ok(()),
            Err(e) => Err(self.protocol.recover(self.probe.as_mut(), e)),
        }
    }

    pub fn flush(&mut self) -> Result<(), ArmError> {
        self.probe.raw_flush().map_err(ArmError::from)
    }

    /// Check CTRL/STAT for sticky error flags, clearing them if set.
    pub fn check_sticky(&mut self) -> Result<(), ArmError> {
        let ctrl: Ctrl = self.read_dp_register()?;

        if self.protocol.sticky_error(ctrl) {
            tracing::debug!("Sticky error flag set, CTRL/STAT = {:#010x}", u32::from(ctrl));
            self.protocol.clear_sticky(self.probe.as_mut())?;
            return Err(ArmError::MemoryFault);
        }

        Ok(())
    }

    /// Clear the sticky flags through the protocol specific path.
    pub(crate) fn clear_sticky(&mut self) -> Result<(), ArmError> {
        self.protocol
            .clear_sticky(self.probe.as_mut())
            .map_err(ArmError::from)
    }

    /// Clear the sticky flags left behind by a pushed verify.
    pub(crate) fn clear_compare(&mut self) -> Result<(), ArmError> {
        self.protocol
            .clear_compare(self.probe.as_mut())
            .map_err(ArmError::from)
    }

    pub(crate) fn sticky_error(&self, ctrl: Ctrl) -> bool {
        self.protocol.sticky_error(ctrl)
    }

    /// The context of the currently selected AP, probed or not.
    pub fn ap_current_ctx(&self) -> Result<&ApContext, ArmError> {
        self.contexts
            .get(self.selection.dp.into(), self.selection.ap.into())
    }

    pub(crate) fn ap_current_ctx_mut(&mut self) -> Result<&mut ApContext, ArmError> {
        self.contexts
            .get_mut(self.selection.dp.into(), self.selection.ap.into())
    }

    /// The context of the AP the CPU is debugged through.
    pub fn ap_cpu_ctx(&self) -> Result<&ApContext, ArmError> {
        self.contexts.get(self.cpu_dp.into(), self.cpu_ap.into())
    }

    /// Drop every cached AP context, e.g. after the target was reconnected.
    pub fn reset_contexts(&mut self) {
        self.contexts.reset();
        self.selection.bank = None;
    }

    /// Make sure the selected AP is probed and return its context.
    pub fn ap_switch(&mut self) -> Result<&ApContext, ArmError> {
        if !self.ap_current_ctx()?.is_probed() {
            let plan = self.read_ap_id()?;
            if plan.sizes {
                self.test_sizes()?;
            }
        }

        self.ap_current_ctx()
    }

    /// Read and classify the IDR of the selected AP.
    fn read_ap_id(&mut self) -> Result<super::ap::context::ProbePlan, ArmError> {
        let idr = self.read_ap(IDR::ADDRESS)?;
        tracing::debug!(
            "DP {} AP {}: IDR = {:#010x}",
            self.selection.dp,
            self.selection.ap,
            idr
        );

        let plan = self.ap_current_ctx_mut()?.classify(idr);

        if plan.spiden {
            let status = self.read_ap(CSW::ADDRESS)?;
            self.ap_current_ctx_mut()?.apply_spiden(status);
        }

        Ok(plan)
    }

    /// Find out which transfer sizes and whether packed transfers stick in CSW.
    fn test_sizes(&mut self) -> Result<(), ArmError> {
        for size in [DataSize::U8, DataSize::U16] {
            let probe = self.ap_current_ctx_mut()?.size_probe_value(size);
            self.ap_current_ctx_mut()?.last_csw = None;

            self.write_ap(CSW::ADDRESS, probe)?;
            let readback = self.read_ap(CSW::ADDRESS)?;

            self.ap_current_ctx_mut()?.record_size_probe(size, readback);
        }

        let ctx = self.ap_current_ctx()?;
        tracing::debug!(
            "AP {} supports {:?}, packed transfers: {}",
            self.selection.ap,
            ctx.access_sizes,
            ctx.packed
        );

        Ok(())
    }

    /// Program CSW for a transfer of `size`, skipping the write if CSW already holds the value.
    pub(crate) fn write_csw(
        &mut self,
        size: DataSize,
        increment: AddressIncrement,
    ) -> Result<(), ArmError> {
        let ctx = self.ap_current_ctx_mut()?;
        let value = ctx.csw_value(size, increment);
        if ctx.last_csw == Some(value) {
            return Ok(());
        }

        ctx.last_csw = None;
        tracing::trace!("Writing CSW {:#010x}", value);
        self.write_ap(CSW::ADDRESS, value)?;
        self.ap_current_ctx_mut()?.last_csw = Some(value);

        Ok(())
    }

    /// Probe the selected AP if needed and program it for a memory transfer.
    pub(crate) fn prepare_transfer(
        &mut self,
        size: DataSize,
        attributes: AccessAttributes,
    ) -> Result<(), ArmError> {
        self.ap_switch()?;

        let v8m = self.is_v8m();
        let ctx = self.ap_current_ctx_mut()?;
        ctx.check_size(size)?;
        if v8m {
            ctx.apply_security(attributes.security());
        }

        let increment = if attributes.no_increment() {
            AddressIncrement::Off
        } else {
            AddressIncrement::Packed
        };

        self.write_csw(size, increment)
    }

    /// The auto-increment page of the selected AP.
    pub fn current_rw_page(&self) -> u32 {
        if self.selection.dp == self.cpu_dp && self.selection.ap == self.cpu_ap {
            self.cpu
                .as_ref()
                .map_or(DEFAULT_RW_PAGE, |cpu| cpu.model.rw_page())
        } else {
            DEFAULT_RW_PAGE
        }
    }

    /// Power up the debug and system domains and program the CPU AP for word transfers.
    pub fn debug_init(&mut self, timeout: Duration) -> Result<DebugPortId, ArmError> {
        let dpidr: DPIDR = self.read_dp_register()?;
        let dp_id = DebugPortId::from(dpidr);
        tracing::info!("DebugPort ID: {:#x?}", dp_id);

        self.protocol
            .clear_errors(self.probe.as_mut())
            .map_err(ArmError::from)?;

        self.select_cpu_ap()?;
        self.selection.bank = None;
        self.select_ap_bank(0)?;

        let mut request = Ctrl::default();
        request.set_cdbgpwrupreq(true);
        request.set_csyspwrupreq(true);
        self.write_dp_register(request)?;

        tracing::debug!("Requesting debug power");
        let start = Instant::now();
        loop {
            let ctrl: Ctrl = self.read_dp_register()?;
            if ctrl.powered_up() {
                break;
            }

            if start.elapsed() >= timeout {
                tracing::error!("Debug power request failed");
                return Err(ArmError::PowerUpTimeout);
            }

            std::thread::sleep(POWER_UP_POLL_INTERVAL);
        }

        let ctrl = self.protocol.powered_ctrl();
        self.write_dp_register(ctrl)?;

        self.protocol
            .clear_errors(self.probe.as_mut())
            .map_err(ArmError::from)?;

        self.ap_switch()?;
        self.write_csw(DataSize::U32, AddressIncrement::Single)?;

        Ok(dp_id)
    }

    /// Power the debug domain down.
    ///
    /// The APs lose their CSW with the power, the probe results stay valid.
    pub fn debug_uninit(&mut self) -> Result<(), ArmError> {
        self.write_dp_register(Ctrl::from(0))?;
        self.contexts.invalidate_csw();
        Ok(())
    }
}

/// Serializes all DAP traffic of a session.
///
/// Every operation takes the lock for its whole duration. Several operations form one
/// transaction inside [`ArmCommunicationInterface::transaction`], or while the caller holds
/// [`ArmCommunicationInterface::lock`].
pub struct ArmCommunicationInterface {
    inner: ReentrantMutex<RefCell<DapInterface>>,
}

assert_impl_all!(ArmCommunicationInterface: Send, Sync);

impl Debug for ArmCommunicationInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmCommunicationInterface")
            .finish_non_exhaustive()
    }
}

impl ArmCommunicationInterface {
    pub fn new(interface: DapInterface) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(interface)),
        }
    }

    /// Hold the transport for the current thread.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<DapInterface>> {
        self.inner.lock()
    }

    /// Run `f` with exclusive access to the DAP state.
    ///
    /// Calling this again from inside `f` fails with [`ArmError::Reentrant`].
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut DapInterface) -> Result<T, ArmError>,
    ) -> Result<T, ArmError> {
        let guard = self.inner.lock();
        let mut interface = guard.try_borrow_mut().map_err(|_| ArmError::Reentrant)?;
        f(&mut interface)
    }

    pub fn set_device_monitor(
        &self,
        monitor: Option<Arc<dyn DeviceMonitor>>,
    ) -> Result<(), ArmError> {
        self.transaction(|interface| {
            interface.set_monitor(monitor);
            Ok(())
        })
    }

    pub fn ap_switch(&self) -> Result<ApContext, ArmError> {
        self.transaction(|interface| interface.ap_switch().cloned())
    }

    pub fn ap_current_ctx(&self) -> Result<ApContext, ArmError> {
        self.transaction(|interface| interface.ap_current_ctx().cloned())
    }

    pub fn ap_cpu_ctx(&self) -> Result<ApContext, ArmError> {
        self.transaction(|interface| interface.ap_cpu_ctx().cloned())
    }

    pub fn read_dp(&self, address: u8) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.read_dp(address))
    }

    pub fn write_dp(&self, address: u8, value: u32) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_dp(address, value))
    }

    pub fn read_ap(&self, address: u8) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.read_ap(address))
    }

    pub fn write_ap(&self, address: u8, value: u32) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_ap(address, value))
    }

    pub fn abort(&self, value: u32) -> Result<(), ArmError> {
        self.transaction(|interface| interface.abort(value))
    }
}
