use std::time::Duration;

use cmdap::architecture::arm::memory::{AccessAttributes, AccessDirection, VerifyOutcome};
use cmdap::architecture::arm::{ArmCommunicationInterface, ArmError, DapInterface};
use cmdap::config::WireProtocol;
use cmdap::probe::FakeProbe;
use cmdap::ErrorKind;
use pretty_assertions::assert_eq;
use test_case::test_case;

fn connect(probe: &FakeProbe) -> ArmCommunicationInterface {
    let mut dap = DapInterface::new(probe.boxed(), WireProtocol::Swd, 0, 0);
    dap.debug_init(Duration::from_millis(100))
        .expect("Failed to power up the fake target");
    ArmCommunicationInterface::new(dap)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

#[test]
fn single_accesses_use_byte_lanes() {
    let probe = FakeProbe::new();
    probe.write_word(0x2000_0000, 0x4433_2211);
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();

    assert_eq!(interface.read_8(0x2000_0003, attributes).unwrap(), 0x44);
    assert_eq!(interface.read_16(0x2000_0002, attributes).unwrap(), 0x4433);

    interface.write_8(0x2000_0001, 0xAA, attributes).unwrap();
    interface.write_16(0x2000_0002, 0xBBCC, attributes).unwrap();
    assert_eq!(interface.read_32(0x2000_0000, attributes).unwrap(), 0xBBCC_AA11);
}

#[test]
fn unaligned_single_access_is_rejected() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);

    let error = interface
        .read_32(0x2000_0002, AccessAttributes::default())
        .unwrap_err();
    assert!(matches!(
        error,
        ArmError::MemoryNotAligned {
            address: 0x2000_0002,
            alignment: 4
        }
    ));
    assert_eq!(error.kind(), ErrorKind::InvalidRequest);
}

#[test]
fn round_trip_at_any_alignment() {
    let probe = FakeProbe::new();
    probe.write_memory(0x2000_03F8, &[0xAA]);
    probe.write_memory(0x2000_0807, &[0xBB]);
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();

    // Leading byte and half-word, blocks split at the 1 KiB page, trailing half-word and byte.
    let data = pattern(0x40E);
    interface
        .write_arm_mem(0x2000_03F9, &data, attributes)
        .unwrap();
    assert_eq!(probe.read_memory(0x2000_03F9, data.len()), data);
    assert_eq!(probe.read_memory(0x2000_03F8, 1), vec![0xAA]);
    assert_eq!(probe.read_memory(0x2000_0807, 1), vec![0xBB]);

    let mut readback = vec![0; data.len()];
    interface
        .read_arm_mem(0x2000_03F9, &mut readback, attributes)
        .unwrap();
    assert_eq!(readback, data);
}

#[test_case(1; "one byte")]
#[test_case(3; "three bytes")]
#[test_case(5; "five bytes")]
fn short_transfers(len: usize) {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let data = pattern(len);

    interface
        .write_arm_mem(0x2000_0101, &data, AccessAttributes::default())
        .unwrap();
    assert_eq!(probe.read_memory(0x2000_0101, len), data);
    assert_eq!(probe.read_memory(0x2000_0100, 1), vec![0]);
    assert_eq!(probe.read_memory(0x2000_0101 + len as u32, 1), vec![0]);
}

#[test]
fn faulting_blocks_fall_back_to_words() {
    let probe = FakeProbe::new();
    probe.fail_blocks(true);
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();
    let data = pattern(0x40);

    interface
        .write_arm_mem(0x2000_0200, &data, attributes)
        .unwrap();
    let mut readback = vec![0; data.len()];
    interface
        .read_arm_mem(0x2000_0200, &mut readback, attributes)
        .unwrap();

    assert_eq!(readback, data);
    assert_eq!(probe.read_memory(0x2000_0200, data.len()), data);
    assert!(probe.stats().block_transfers >= 2);
    assert_eq!(probe.ctrl() & 0x20, 0);
}

#[test]
fn block_rules() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let attributes = AccessAttributes::default();
    let mut data = [0u8; 8];

    let error = interface
        .read_block(0x2000_0002, &mut data, attributes)
        .unwrap_err();
    assert!(matches!(error, ArmError::MemoryNotAligned { .. }));

    let error = interface
        .read_block(0x2000_0000, &mut data[..6], attributes)
        .unwrap_err();
    assert!(matches!(error, ArmError::InvalidBlockLength { len: 6, .. }));

    let error = interface
        .read_block(0x2000_03FC, &mut data, attributes)
        .unwrap_err();
    assert!(matches!(
        error,
        ArmError::InvalidBlockLength {
            address: 0x2000_03FC,
            page: 0x400,
            ..
        }
    ));
    assert_eq!(error.kind(), ErrorKind::InvalidRequest);

    // Without increment the page does not matter.
    interface
        .read_block(0x2000_03FC, &mut data, AccessAttributes::fixed_address())
        .unwrap();
}

#[test]
fn fixed_address_block_hits_one_word() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    let mut data = Vec::new();
    data.extend_from_slice(&0x1111_1111u32.to_le_bytes());
    data.extend_from_slice(&0x2222_2222u32.to_le_bytes());

    interface
        .write_block(0x2000_0000, &data, AccessAttributes::fixed_address())
        .unwrap();

    assert_eq!(probe.read_word(0x2000_0000), 0x2222_2222);
    assert_eq!(probe.read_word(0x2000_0004), 0);
}

#[test]
fn faulting_access_reports_its_address() {
    let probe = FakeProbe::new();
    probe.add_fault(0x4000_0000..0x4000_1000);
    let interface = connect(&probe);

    let error = interface
        .read_32(0x4000_0010, AccessAttributes::default())
        .unwrap_err();
    assert!(matches!(
        error,
        ArmError::MemoryAccess {
            address: 0x4000_0010,
            direction: AccessDirection::Read,
            size: 4
        }
    ));
    assert_eq!(error.kind(), ErrorKind::MemoryAccess);

    // The sticky flag was cleared, the next access works.
    assert_eq!(probe.ctrl() & 0x20, 0);
    interface
        .read_32(0x2000_0000, AccessAttributes::default())
        .unwrap();
}

#[test]
fn faulting_arm_mem_names_the_failed_chunk() {
    let probe = FakeProbe::new();
    probe.add_fault(0x2000_0300..0x2000_0400);
    let interface = connect(&probe);

    let mut data = vec![0; 0x20];
    let error = interface
        .read_arm_mem(0x2000_02F1, &mut data, AccessAttributes::default())
        .unwrap_err();

    assert!(matches!(
        error,
        ArmError::MemoryAccess {
            address: 0x2000_0300,
            direction: AccessDirection::Read,
            ..
        }
    ));
}

#[test]
fn timeout_is_retried_once() {
    let probe = FakeProbe::new();
    probe.write_word(0x2000_0000, 0xCAFE_F00D);
    let interface = connect(&probe);
    probe.reset_stats();

    probe.timeout_drw(1);
    let value = interface
        .read_32(0x2000_0000, AccessAttributes::default())
        .unwrap();

    assert_eq!(value, 0xCAFE_F00D);
    assert_eq!(probe.stats().dap_aborts(), 1);
}

#[test]
fn repeated_timeout_fails_the_access() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);
    probe.reset_stats();

    probe.timeout_drw(2);
    let error = interface
        .write_32(0x2000_0000, 1, AccessAttributes::default())
        .unwrap_err();

    assert!(matches!(
        error,
        ArmError::MemoryAccess {
            address: 0x2000_0000,
            direction: AccessDirection::Write,
            size: 4
        }
    ));
    assert_eq!(probe.stats().dap_aborts(), 2);
    assert_eq!(probe.read_word(0x2000_0000), 0);
}

#[test]
fn verify_matching_memory() {
    let probe = FakeProbe::new();
    let data = pattern(0x41);
    probe.write_memory(0x2000_0101, &data);
    let interface = connect(&probe);

    let mut expected = data.clone();
    let outcome = interface
        .verify_arm_mem(0x2000_0101, &mut expected, AccessAttributes::default())
        .unwrap();

    assert_eq!(outcome, VerifyOutcome::Match);
    assert_eq!(expected, data);
    // The verify left the target untouched and the DP in normal transfer mode.
    assert_eq!(probe.read_memory(0x2000_0101, data.len()), data);
    assert_eq!(probe.ctrl() & 0x3C, 0);
}

#[test]
fn verify_reports_target_content_on_mismatch() {
    let probe = FakeProbe::new();
    let data = pattern(0x40);
    probe.write_memory(0x2000_0100, &data);
    probe.write_memory(0x2000_0120, &[0xFF]);
    let interface = connect(&probe);

    let mut expected = data.clone();
    let outcome = interface
        .verify_arm_mem(0x2000_0100, &mut expected, AccessAttributes::default())
        .unwrap();

    assert_eq!(outcome, VerifyOutcome::Mismatch);
    assert_eq!(expected, probe.read_memory(0x2000_0100, data.len()));
    assert_eq!(expected[0x20], 0xFF);
    assert_eq!(probe.ctrl() & 0x3C, 0);
}

#[test]
fn verify_block_without_block_transfers() {
    let probe = FakeProbe::new();
    let data = pattern(0x10);
    probe.write_memory(0x2000_0100, &data);
    probe.write_memory(0x2000_0104, &[0x00]);
    probe.fail_blocks(true);
    let interface = connect(&probe);

    let mut expected = data.clone();
    let outcome = interface
        .verify_arm_mem(0x2000_0100, &mut expected, AccessAttributes::default())
        .unwrap();

    assert_eq!(outcome, VerifyOutcome::Mismatch);
    assert_eq!(expected[4], 0x00);
}

#[test]
fn reentrant_transaction_is_refused() {
    let probe = FakeProbe::new();
    let interface = connect(&probe);

    let result = interface.transaction(|_| {
        interface.read_32(0x2000_0000, AccessAttributes::default())
    });

    assert!(matches!(result, Err(ArmError::Reentrant)));
}

#[test]
fn jtag_clears_sticky_flags_in_ctrl() {
    let probe = FakeProbe::new();
    probe.add_fault(0x4000_0000..0x4000_0004);
    let mut dap = DapInterface::new(probe.boxed(), WireProtocol::Jtag, 0, 0);
    dap.debug_init(Duration::from_millis(100)).unwrap();
    let interface = ArmCommunicationInterface::new(dap);
    probe.reset_stats();

    let error = interface
        .read_32(0x4000_0000, AccessAttributes::default())
        .unwrap_err();

    assert!(error.is_memory_error());
    assert_eq!(probe.ctrl() & 0x20, 0);
    assert!(probe.stats().aborts.is_empty());
    assert_eq!(probe.ctrl() & 0x5000_0000, 0x5000_0000);
}
