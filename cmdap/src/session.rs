use std::sync::Arc;

use crate::architecture::arm::core::{CpuInfo, RegisterFile};
use crate::architecture::arm::dp::DebugPortId;
use crate::architecture::arm::memory::{AccessAttributes, VerifyOutcome};
use crate::architecture::arm::{
    ArmCommunicationInterface, DapInterface, DeviceMonitor, RawDapAccess,
};
use crate::breakpoints::{AllocMode, AllocOutcome, Breakpoint, BreakpointManager};
use crate::config::{DebugTopology, SessionConfig};
use crate::Error;

/// A connected target: the powered debug port, the identified CPU and its breakpoint
/// resources.
///
/// Memory and register access take `&self` and may be used from any thread. Breakpoint
/// bookkeeping belongs to whoever drives run control and takes `&mut self`.
#[derive(Debug)]
pub struct Session {
    interface: ArmCommunicationInterface,
    breakpoints: BreakpointManager,
    config: SessionConfig,
    topology: DebugTopology,
    dp_id: DebugPortId,
    cpu: CpuInfo,
}

impl Session {
    /// Power up the debug port behind `probe`, identify the CPU and read its breakpoint and
    /// watchpoint capabilities.
    pub fn connect(
        probe: Box<dyn RawDapAccess>,
        config: SessionConfig,
        topology: DebugTopology,
    ) -> Result<Self, Error> {
        let mut dap = DapInterface::new(probe, config.protocol, config.dp, config.ap);
        dap.dbg_addr = topology.dbg;
        dap.register_poll_retries = config.register_poll_retries;

        tracing::debug!(
            "Connecting over {} to DP {} AP {}",
            config.protocol,
            config.dp,
            config.ap
        );
        let dp_id = dap.debug_init(config.power_up_timeout())?;

        let mut interface = ArmCommunicationInterface::new(dap);
        let cpu = interface.detect_cpu()?;

        let mut breakpoints = BreakpointManager::new();
        breakpoints.detect_break_resources(&mut interface, &topology)?;
        breakpoints.detect_dwt_resources(&mut interface, &topology, cpu.model.is_v8m())?;
        breakpoints.init_break_resources(&config, &topology);

        let access_sizes = interface.ap_cpu_ctx()?.access_sizes;
        for region in &config.sw_break_regions {
            breakpoints.add_sw_break_config(region.clone(), access_sizes, &[])?;
        }

        Ok(Self {
            interface,
            breakpoints,
            config,
            topology,
            dp_id,
            cpu,
        })
    }

    pub fn interface(&self) -> &ArmCommunicationInterface {
        &self.interface
    }

    pub fn cpu_info(&self) -> &CpuInfo {
        &self.cpu
    }

    pub fn debug_port_id(&self) -> &DebugPortId {
        &self.dp_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn topology(&self) -> &DebugTopology {
        &self.topology
    }

    pub fn read_32(&self, address: u32) -> Result<u32, Error> {
        Ok(self
            .interface
            .read_32(address, AccessAttributes::default())?)
    }

    pub fn write_32(&self, address: u32, value: u32) -> Result<(), Error> {
        Ok(self
            .interface
            .write_32(address, value, AccessAttributes::default())?)
    }

    /// Read `data.len()` bytes at any address and alignment.
    pub fn read_arm_mem(
        &self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<(), Error> {
        Ok(self.interface.read_arm_mem(address, data, attributes)?)
    }

    pub fn write_arm_mem(
        &self,
        address: u32,
        data: &[u8],
        attributes: AccessAttributes,
    ) -> Result<(), Error> {
        Ok(self.interface.write_arm_mem(address, data, attributes)?)
    }

    /// Compare `data` against target memory. On a mismatch the differing chunk of `data` is
    /// replaced with what the target holds.
    pub fn verify_arm_mem(
        &self,
        address: u32,
        data: &mut [u8],
        attributes: AccessAttributes,
    ) -> Result<VerifyOutcome, Error> {
        Ok(self.interface.verify_arm_mem(address, data, attributes)?)
    }

    pub fn get_arm_regs(&self, mask: u64, registers: &mut RegisterFile) -> Result<(), Error> {
        Ok(self.interface.get_arm_regs(mask, registers)?)
    }

    pub fn set_arm_regs(&self, mask: u64, registers: &RegisterFile) -> Result<(), Error> {
        Ok(self.interface.set_arm_regs(mask, registers)?)
    }

    pub fn syscall_exec(&self, registers: &RegisterFile) -> Result<(), Error> {
        Ok(self.interface.syscall_exec(registers)?)
    }

    pub fn syscall_result(&self) -> Result<u32, Error> {
        Ok(self.interface.syscall_result()?)
    }

    pub fn set_device_monitor(&self, monitor: Option<Arc<dyn DeviceMonitor>>) -> Result<(), Error> {
        Ok(self.interface.set_device_monitor(monitor)?)
    }

    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    pub fn breakpoints_mut(&mut self) -> &mut BreakpointManager {
        &mut self.breakpoints
    }

    /// Allocate, free or adjust the resources for `breakpoint`, see
    /// [`BreakpointManager::alloc_breakpoint`].
    pub fn alloc_breakpoint(
        &mut self,
        mode: AllocMode,
        breakpoint: &Breakpoint,
        others: &[Breakpoint],
    ) -> Result<AllocOutcome, Error> {
        Ok(self
            .breakpoints
            .alloc_breakpoint(&mut self.interface, mode, breakpoint, others)?)
    }

    /// Whether a BKPT instruction can be placed at `address`.
    pub fn can_sw_break(&mut self, address: u32) -> bool {
        self.breakpoints.can_sw_break(&mut self.interface, address)
    }

    /// The target started or stopped executing.
    pub fn set_running(&mut self, running: bool) {
        self.breakpoints.set_running(running);
    }

    /// The target halted: allocate the breakpoints that were set while it ran.
    pub fn halted(&mut self, breakpoints: &mut [Breakpoint]) -> Result<(), Error> {
        self.breakpoints.set_running(false);
        Ok(self
            .breakpoints
            .merge_run_breaks(&mut self.interface, breakpoints)?)
    }

    /// Power the debug domain down.
    pub fn disconnect(self) -> Result<(), Error> {
        tracing::debug!("Disconnecting");
        Ok(self
            .interface
            .transaction(|interface| interface.debug_uninit())?)
    }
}
