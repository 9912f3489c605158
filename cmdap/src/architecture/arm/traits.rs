use super::DapError;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

/// Low-level DAP register access.
///
/// Operations on this trait closely match the transactions on the wire. Implementors
/// only do basic error handling, such as retrying WAIT responses.
///
/// Almost everything is the responsibility of the caller. For example, the caller must
/// handle bank switching, AP selection and clearing sticky errors.
pub trait RawDapAccess: Send {
    /// Route the following transfers to another debug port, either a different device on
    /// the JTAG chain or a different target on a multidrop SWD bus.
    fn select_dp(&mut self, dp: u8) -> Result<(), DapError> {
        if dp == 0 {
            Ok(())
        } else {
            Err(DapError::Failure)
        }
    }

    /// Read a DAP register.
    ///
    /// Only bits [3:2] of `addr` reach the wire. Bank switching is the caller's responsibility.
    fn raw_read_register(&mut self, port: PortType, addr: u8) -> Result<u32, DapError>;

    /// Read multiple values from the same DAP register.
    ///
    /// If possible, this uses optimized read functions, otherwise it
    /// falls back to the `raw_read_register` function.
    fn raw_read_block(
        &mut self,
        port: PortType,
        addr: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        for val in values {
            *val = self.raw_read_register(port, addr)?;
        }

        Ok(())
    }

    /// Write a value to a DAP register.
    ///
    /// Only bits [3:2] of `addr` reach the wire. Bank switching is the caller's responsibility.
    fn raw_write_register(&mut self, port: PortType, addr: u8, value: u32)
        -> Result<(), DapError>;

    /// Write multiple values to the same DAP register.
    ///
    /// If possible, this uses optimized write functions, otherwise it
    /// falls back to the `raw_write_register` function.
    fn raw_write_block(&mut self, port: PortType, addr: u8, values: &[u32]) -> Result<(), DapError> {
        for val in values {
            self.raw_write_register(port, addr, *val)?;
        }

        Ok(())
    }

    /// Write the DP ABORT register.
    ///
    /// On JTAG this is a separate scan chain, so transports may override it.
    fn raw_abort(&mut self, value: u32) -> Result<(), DapError> {
        self.raw_write_register(PortType::DebugPort, 0x0, value)
    }

    /// Flush any outstanding writes.
    ///
    /// By default, this does nothing -- but in probes that implement write
    /// batching, this needs to flush any pending writes.
    fn raw_flush(&mut self) -> Result<(), DapError> {
        Ok(())
    }
}
