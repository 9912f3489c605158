use cmdap::architecture::arm::core::CpuModel;
use cmdap::architecture::arm::dp::DebugPortVersion;
use cmdap::architecture::arm::memory::AccessAttributes;
use cmdap::breakpoints::{AllocMode, Breakpoint, ResourceKind, SwBreakConfigItem};
use cmdap::probe::FakeProbe;
use cmdap::{DebugTopology, ErrorKind, Session, SessionConfig};
use pretty_assertions::assert_eq;

const FLASH: std::ops::Range<u32> = 0x0800_0000..0x0810_0000;

/// A Cortex-M4 with a revision 0 FPB (6 code comparators) and a DWT with 4 comparators.
fn target() -> FakeProbe {
    let _ = pretty_env_logger::try_init();

    let probe = FakeProbe::new();
    probe.write_word(0xE000_2000, 0x0000_0260);
    probe.write_word(0xE000_1000, 0x4000_0000);
    probe.add_read_only(FLASH);
    probe
}

fn connect(probe: &FakeProbe, config: SessionConfig) -> Session {
    Session::connect(probe.boxed(), config, DebugTopology::default())
        .expect("Failed to connect to the fake target")
}

fn allocate(session: &mut Session, breakpoint: &mut Breakpoint, others: &[Breakpoint]) {
    let outcome = session
        .alloc_breakpoint(AllocMode::Allocate, breakpoint, others)
        .unwrap();
    breakpoint.apply(&outcome);
}

#[test]
fn connect_reads_the_capabilities() {
    let probe = target();
    let session = connect(&probe, SessionConfig::default());

    assert_eq!(session.cpu_info().model, CpuModel::M4);
    assert_eq!(session.debug_port_id().version, DebugPortVersion::DPv1);
    assert_eq!(session.breakpoints().break_comparator_count(), 6);
    assert_eq!(session.breakpoints().dwt_comparator_count(), 4);
}

#[test]
fn breakpoints_in_flash_and_ram() {
    let probe = target();
    let mut session = connect(&probe, SessionConfig::default());

    let mut flash = Breakpoint::execution(0x0800_0100);
    allocate(&mut session, &mut flash, &[]);
    assert!(flash.allocated);
    assert!(!flash.software);

    let mut ram = Breakpoint::execution(0x2000_0200);
    allocate(&mut session, &mut ram, &[flash.clone()]);
    assert!(ram.allocated);
    assert!(ram.software);
    // The BKPT test left the memory as it was.
    assert_eq!(probe.read_memory(0x2000_0200, 2), vec![0, 0]);

    let mut watch = Breakpoint::watch(0x2000_1000, 4, 1);
    allocate(&mut session, &mut watch, &[flash.clone(), ram.clone()]);
    assert!(watch.allocated);

    let allocated = session.breakpoints().resources().allocated().clone();
    assert_eq!(allocated.breaks, 1);
    assert_eq!(allocated.sw_breaks, 1);
    assert_eq!(allocated.comps, 1);

    let outcome = session
        .alloc_breakpoint(AllocMode::Free, &flash, &[ram, watch])
        .unwrap();
    assert!(!outcome.allocated);
    assert_eq!(session.breakpoints().resources().allocated().breaks, 0);
}

#[test]
fn breakpoints_set_while_running_are_merged_on_halt() {
    let probe = target();
    let mut session = connect(&probe, SessionConfig::default());

    let mut first = Breakpoint::execution(0x0800_0100);
    allocate(&mut session, &mut first, &[]);

    session.set_running(true);
    let second = Breakpoint::execution(0x0800_0200);
    let outcome = session
        .alloc_breakpoint(AllocMode::Allocate, &second, &[first.clone()])
        .unwrap();
    assert!(outcome.run_break);
    assert!(!outcome.allocated);
    assert_eq!(session.breakpoints().run_breaks(), vec![0x0800_0200]);
    assert_eq!(session.breakpoints().resources().allocated().breaks, 1);

    let mut breakpoints = vec![first, second];
    session.halted(&mut breakpoints).unwrap();

    assert!(breakpoints[1].allocated);
    assert!(!breakpoints[1].software);
    assert_eq!(session.breakpoints().resources().allocated().breaks, 2);
    assert!(session.breakpoints().run_breaks().is_empty());
}

#[test]
fn disabled_region_refuses_software_breakpoints() {
    let probe = target();
    let config = SessionConfig {
        sw_break_regions: vec![SwBreakConfigItem::new(0x2000_0000, 0x2000_0FFF, false)],
        ..SessionConfig::default()
    };
    let mut session = connect(&probe, config);

    assert!(!session.can_sw_break(0x2000_0200));
    assert!(session.can_sw_break(0x2000_2000));
    assert_eq!(session.breakpoints().sw_break_configs().len(), 1);
}

#[test]
fn ram_breakpoint_needs_software_breakpoints() {
    let probe = target();
    let config = SessionConfig {
        allow_software_breakpoints: false,
        ..SessionConfig::default()
    };
    let mut session = connect(&probe, config);

    // A revision 0 FPB only covers the code region.
    let error = session
        .alloc_breakpoint(AllocMode::Allocate, &Breakpoint::execution(0x2000_0200), &[])
        .unwrap_err();
    assert_eq!(
        error.kind(),
        ErrorKind::UnsupportedConfiguration(ResourceKind::Break)
    );
}

#[test]
fn unknown_cpu_fails_the_connect() {
    let probe = target();
    probe.write_word(0xE000_ED00, 0x413F_C090);

    let error = Session::connect(
        probe.boxed(),
        SessionConfig::default(),
        DebugTopology::default(),
    )
    .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::UnsupportedTarget);
}

#[test]
fn memory_through_the_session() {
    let probe = target();
    let session = connect(&probe, SessionConfig::default());

    session.write_32(0x2000_0400, 0xDEAD_BEEF).unwrap();
    assert_eq!(session.read_32(0x2000_0400).unwrap(), 0xDEAD_BEEF);

    let mut data = [0u8; 3];
    session
        .read_arm_mem(0x2000_0401, &mut data, AccessAttributes::default())
        .unwrap();
    assert_eq!(data, [0xBE, 0xAD, 0xDE]);
}

#[test]
fn disconnect_powers_down() {
    let probe = target();
    let session = connect(&probe, SessionConfig::default());
    assert_ne!(probe.ctrl(), 0);

    session.disconnect().unwrap();
    assert_eq!(probe.ctrl(), 0);
}
