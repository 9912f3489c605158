use std::time::Duration;

use cmdap::architecture::arm::ap::{csw, AccessSizes, DataSize};
use cmdap::architecture::arm::core::CpuModel;
use cmdap::architecture::arm::memory::{AccessAttributes, SecurityType};
use cmdap::architecture::arm::{ArmCommunicationInterface, ArmError, DapError, DapInterface};
use cmdap::config::WireProtocol;
use cmdap::probe::{FakeAp, FakeProbe};
use cmdap::ErrorKind;
use pretty_assertions::assert_eq;

fn connect(probe: &FakeProbe) -> ArmCommunicationInterface {
    let mut dap = DapInterface::new(probe.boxed(), WireProtocol::Swd, 0, 0);
    dap.debug_init(Duration::from_millis(100))
        .expect("Failed to power up the fake target");
    ArmCommunicationInterface::new(dap)
}

#[test]
fn power_up_programs_the_cpu_ap() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);

    let stats = probe.stats();
    assert_eq!(stats.idr_reads, 1);
    assert_eq!(probe.ctrl() & 0xF000_0000, 0xF000_0000);
    assert_eq!(
        probe.csw(0, 0),
        Some(csw::DEFAULT_BASE | csw::SIZE32 | csw::SADDRINC)
    );

    let ctx = interface.ap_cpu_ctx().unwrap();
    assert!(ctx.is_probed());
    assert_eq!(
        ctx.access_sizes,
        AccessSizes::BYTE | AccessSizes::HWORD | AccessSizes::WORD
    );
    assert!(ctx.packed);
    assert!(!ctx.keep_sprot);
}

#[test]
fn power_up_times_out_without_acknowledge() {
    let probe = FakeProbe::new();
    probe.set_power_ack(false);

    let mut dap = DapInterface::new(probe.boxed(), WireProtocol::Swd, 0, 0);
    let error = dap.debug_init(Duration::from_millis(10)).unwrap_err();

    assert!(matches!(error, ArmError::PowerUpTimeout));
    assert_eq!(error.kind(), ErrorKind::TransportTimeout);

    // CTRL/STAT is polled at an interval, not in a busy loop.
    let reads = probe.stats().ctrl_reads;
    assert!(reads > 1 && reads <= 20, "{reads} CTRL/STAT reads");
}

#[test]
fn access_port_is_probed_once() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();

    for address in [0x2000_0000, 0x2000_0004, 0x2000_0008] {
        interface.read_32(address, attributes).unwrap();
        interface.read_8(address + 1, attributes).unwrap();
    }

    assert_eq!(probe.stats().idr_reads, 1);
}

#[test]
fn unchanged_csw_is_not_rewritten() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();
    probe.reset_stats();

    interface.read_32(0x2000_0000, attributes).unwrap();
    interface.read_32(0x2000_0004, attributes).unwrap();
    assert_eq!(probe.stats().csw_writes, 1);

    interface.read_8(0x2000_0001, attributes).unwrap();
    interface.write_8(0x2000_0002, 0x55, attributes).unwrap();
    assert_eq!(probe.stats().csw_writes, 2);

    interface.read_32(0x2000_0000, attributes).unwrap();
    assert_eq!(probe.stats().csw_writes, 3);
}

#[test]
fn unchanged_bank_is_not_reselected() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    probe.reset_stats();

    for address in [0x2000_0000, 0x2000_0004] {
        interface
            .read_32(address, AccessAttributes::default())
            .unwrap();
    }

    assert_eq!(probe.stats().select_writes, 0);
}

#[test]
fn power_cycle_rewrites_csw() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    probe.reset_stats();

    interface
        .transaction(|dap| {
            dap.debug_uninit()?;
            dap.debug_init(Duration::from_millis(100))
        })
        .unwrap();

    let stats = probe.stats();
    assert_eq!(stats.csw_writes, 1);
    assert_eq!(stats.idr_reads, 0);
}

#[test]
fn each_access_port_has_its_own_context() {
    let probe = FakeProbe::new();
    probe.add_ap(0, 1, FakeAp::new(0x0477_0001).word_only().unpacked());
    let interface = connect(&probe);
    probe.reset_stats();

    let other = interface
        .transaction(|dap| {
            dap.select_ap(1);
            let ctx = dap.ap_switch()?.clone();
            dap.read_32(0x2000_0000, AccessAttributes::default())?;
            Ok(ctx)
        })
        .unwrap();

    assert_eq!(other.access_sizes, AccessSizes::WORD);
    assert!(!other.packed);
    assert_eq!(other.csw_base & csw::MSTRDBG, 0);

    let error = interface
        .transaction(|dap| dap.read_8(0x2000_0000, AccessAttributes::default()))
        .unwrap_err();
    assert!(matches!(error, ArmError::UnsupportedAccessSize(DataSize::U8)));
    assert_eq!(error.kind(), ErrorKind::UnsupportedAccessSize);

    // Back on the CPU AP, nothing is probed again.
    interface
        .transaction(|dap| {
            dap.select_cpu_ap()?;
            dap.read_8(0x2000_0000, AccessAttributes::default())
        })
        .unwrap();
    assert_eq!(probe.stats().idr_reads, 1);
    assert_eq!(
        probe.csw(0, 1).map(|value| value & csw::ADDRINC),
        Some(csw::SADDRINC)
    );
}

#[test]
fn coresight_ahb_ap_without_secure_debug() {
    let probe = FakeProbe::new();
    probe.add_ap(0, 2, FakeAp::new(0x0477_0001).without_spiden());
    let interface = connect(&probe);

    let ctx = interface
        .transaction(|dap| {
            dap.select_ap(2);
            dap.ap_switch().cloned()
        })
        .unwrap();

    assert!(ctx.keep_sprot);
    assert_eq!(ctx.csw_base & csw::SPROT, csw::SPROT);

    // Asking for any security state leaves the pinned non-secure bit alone.
    interface
        .transaction(|dap| dap.write_32(0x2000_0000, 1, AccessAttributes::default()))
        .unwrap();
    assert_eq!(
        probe.csw(0, 2).map(|value| value & csw::SPROT),
        Some(csw::SPROT)
    );
}

#[test]
fn debug_ports_are_switched_on_demand() {
    let probe = FakeProbe::new();
    probe.add_ap(1, 0, FakeAp::new(0x0477_0021));
    probe.write_word(0x2000_0000, 0x1234_5678);
    let interface = connect(&probe);
    probe.reset_stats();

    let value = interface
        .transaction(|dap| {
            dap.switch_dp(1)?;
            dap.switch_dp(1)?;
            dap.select_ap(0);
            dap.read_32(0x2000_0000, AccessAttributes::default())
        })
        .unwrap();

    assert_eq!(value, 0x1234_5678);
    let stats = probe.stats();
    assert_eq!(stats.dp_switches, 1);
    assert_eq!(stats.idr_reads, 1);

    interface.transaction(|dap| dap.select_cpu_ap()).unwrap();
    assert_eq!(probe.stats().dp_switches, 2);

    let error = interface
        .transaction(|dap| dap.switch_dp(5))
        .unwrap_err();
    assert!(matches!(error, ArmError::Dap(DapError::Failure)));
    assert_eq!(interface.transaction(|dap| Ok(dap.selection().dp)).unwrap(), 0);
}

#[test]
fn contexts_can_be_reset() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);

    interface
        .transaction(|dap| {
            dap.reset_contexts();
            Ok(())
        })
        .unwrap();
    assert!(!interface.ap_cpu_ctx().unwrap().is_probed());

    interface
        .read_32(0x2000_0000, AccessAttributes::default())
        .unwrap();
    assert_eq!(probe.stats().idr_reads, 2);
}

#[test]
fn unknown_cpu_is_rejected() {
    let probe = FakeProbe::new();
    // Cortex-A9
    probe.write_word(0xE000_ED00, 0x413F_C090);
    let interface = connect(&probe);

    let error = interface.detect_cpu().unwrap_err();
    assert!(matches!(error, ArmError::UnsupportedCpu(0x413F_C090)));
    assert_eq!(error.kind(), ErrorKind::UnsupportedTarget);
}

#[test]
fn cached_cpu_gets_cacheable_transfers() {
    let probe = FakeProbe::new();
    probe.write_word(0xE000_ED00, 0x411F_C272);
    let interface = connect(&probe);

    let cpu = interface.detect_cpu().unwrap();
    assert_eq!(cpu.model, CpuModel::M7);

    interface
        .read_32(0x2000_0000, AccessAttributes::default())
        .unwrap();
    assert_eq!(
        probe.csw(0, 0).map(|value| value & csw::HPROT_CACHE),
        Some(csw::HPROT_CACHE)
    );
}

#[test]
fn v8m_accesses_follow_the_security_attribute() {
    let probe = FakeProbe::new();
    probe.write_word(0xE000_ED00, 0x410F_D213);
    let interface = connect(&probe);

    let cpu = interface.detect_cpu().unwrap();
    assert_eq!(cpu.model, CpuModel::M33);
    assert!(interface.transaction(|dap| Ok(dap.is_v8m())).unwrap());

    interface
        .read_32(0x2000_0000, AccessAttributes::new(SecurityType::NonSecure))
        .unwrap();
    assert_eq!(
        probe.csw(0, 0).map(|value| value & csw::SPROT),
        Some(csw::SPROT)
    );

    interface
        .read_32(0x2000_0000, AccessAttributes::new(SecurityType::Secure))
        .unwrap();
    assert_eq!(probe.csw(0, 0).map(|value| value & csw::SPROT), Some(0));
}

#[test]
fn page_follows_the_detected_cpu() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let mut data = [0u8; 8];

    // Not yet known, the conservative 1 KiB page applies.
    assert!(interface
        .read_block(0x2000_03FC, &mut data, AccessAttributes::default())
        .is_err());

    interface.detect_cpu().unwrap();
    assert_eq!(
        interface.transaction(|dap| Ok(dap.current_rw_page())).unwrap(),
        0x1000
    );
    interface
        .read_block(0x2000_03FC, &mut data, AccessAttributes::default())
        .unwrap();
}
