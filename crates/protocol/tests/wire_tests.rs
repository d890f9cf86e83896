//! Wire format integration tests
//!
//! Pin the exact byte layout of every message against the field offsets
//! the Linux kernel's vhci driver expects, and exercise full
//! request/reply sequences the way they appear on a live connection:
//! back-to-back frames on one stream, handshake followed by URB traffic.
//!
//! Run with: `cargo test -p protocol --test wire_tests`

use bytes::Bytes;
use protocol::{
    BUS_ID_LEN, CmdSubmit, CmdUnlink, DeviceRecord, DeviceSpeed, Direction, InterfaceRecord,
    OpHeader, OpRepDevlist, OpRepImport, OpReqImport, ProtocolError, RetSubmit, RetUnlink,
    USBIP_CMD_SUBMIT, USBIP_VERSION, UrbRequest,
};
use std::io::Cursor;

fn be32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn device_record(busid: &str) -> DeviceRecord {
    DeviceRecord {
        path: format!("/sys/bus/usb/devices/{busid}"),
        busid: busid.to_string(),
        busnum: 3,
        devnum: 11,
        speed: DeviceSpeed::High,
        vendor_id: 0x04f9,
        product_id: 0x0027,
        bcd_device: 0x0100,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 2,
        interfaces: vec![
            InterfaceRecord {
                class: 0x07,
                subclass: 0x01,
                protocol: 0x02,
            },
            InterfaceRecord {
                class: 0xff,
                subclass: 0x00,
                protocol: 0x00,
            },
        ],
    }
}

// ============================================================================
// Byte layout
// ============================================================================

#[test]
fn test_op_import_request_layout() {
    let bytes = OpReqImport {
        busid: "3-1.4".to_string(),
    }
    .to_bytes()
    .unwrap();

    assert_eq!(bytes.len(), 8 + BUS_ID_LEN);
    assert_eq!(be16(&bytes, 0), USBIP_VERSION);
    assert_eq!(be16(&bytes, 2), 0x8003);
    assert_eq!(be32(&bytes, 4), 0); // status
    assert_eq!(&bytes[8..13], b"3-1.4");
    assert!(bytes[13..].iter().all(|&b| b == 0), "busid is null-padded");
}

#[test]
fn test_devlist_reply_layout() {
    let reply = OpRepDevlist {
        status: 0,
        devices: vec![device_record("3-1.4")],
    };
    let bytes = reply.to_bytes().unwrap();

    // Header, count, one 0x138 block, two 4-byte interface entries
    assert_eq!(bytes.len(), 8 + 4 + 0x138 + 2 * 4);
    assert_eq!(be16(&bytes, 2), 0x0005);
    assert_eq!(be32(&bytes, 8), 1); // device count

    let block = &bytes[12..];
    assert_eq!(&block[..22], b"/sys/bus/usb/devices/3"); // path field
    assert_eq!(&block[256..261], b"3-1.4"); // busid field
    assert_eq!(be32(block, 288), 3); // busnum
    assert_eq!(be32(block, 292), 11); // devnum
    assert_eq!(be32(block, 296), 3); // speed: high
    assert_eq!(be16(block, 300), 0x04f9); // idVendor
    assert_eq!(be16(block, 302), 0x0027); // idProduct

    // First interface entry sits right after the device block
    assert_eq!(&block[0x138..0x13c], &[0x07, 0x01, 0x02, 0x00]);
}

#[test]
fn test_cmd_submit_layout() {
    let cmd = CmdSubmit {
        seqnum: 0x11223344,
        devid: 0x0003000b,
        direction: Direction::In,
        ep: 1,
        transfer_flags: 0x0200,
        transfer_buffer_length: 64,
        start_frame: 0,
        number_of_packets: 0,
        interval: 8,
        setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00],
        payload: Bytes::new(),
    };
    let bytes = cmd.to_bytes().unwrap();

    assert_eq!(bytes.len(), 48);
    assert_eq!(be32(&bytes, 0), USBIP_CMD_SUBMIT);
    assert_eq!(be32(&bytes, 4), 0x11223344); // seqnum
    assert_eq!(be32(&bytes, 8), 0x0003000b); // devid
    assert_eq!(be32(&bytes, 12), 1); // direction IN
    assert_eq!(be32(&bytes, 16), 1); // ep
    assert_eq!(be32(&bytes, 20), 0x0200); // transfer_flags
    assert_eq!(be32(&bytes, 24), 64); // transfer_buffer_length
    assert_eq!(be32(&bytes, 36), 8); // interval
    assert_eq!(&bytes[40..48], &cmd.setup); // setup packet
}

#[test]
fn test_ret_submit_layout() {
    let cmd = CmdSubmit {
        seqnum: 7,
        devid: 0x0003000b,
        direction: Direction::In,
        ep: 1,
        transfer_flags: 0,
        transfer_buffer_length: 8,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
        payload: Bytes::new(),
    };
    let ret = RetSubmit::success(&cmd, 8, Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]));
    let bytes = ret.to_bytes().unwrap();

    assert_eq!(bytes.len(), 48 + 8);
    assert_eq!(be32(&bytes, 0), 0x0003); // RET_SUBMIT
    assert_eq!(be32(&bytes, 4), 7); // seqnum echoed
    assert_eq!(be32(&bytes, 20) as i32, 0); // status
    assert_eq!(be32(&bytes, 24), 8); // actual_length
    assert_eq!(&bytes[48..], &[1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_ret_unlink_layout() {
    let cmd = CmdUnlink {
        seqnum: 21,
        devid: 0x0003000b,
        direction: Direction::Out,
        ep: 0,
        unlink_seqnum: 7,
    };
    let bytes = RetUnlink::new(&cmd, -2).to_bytes().unwrap();

    assert_eq!(bytes.len(), 48);
    assert_eq!(be32(&bytes, 0), 0x0004); // RET_UNLINK
    assert_eq!(be32(&bytes, 4), 21); // seqnum of the unlink command
    assert_eq!(be32(&bytes, 8), 0); // devid zeroed in unlink replies
    assert_eq!(be32(&bytes, 20) as i32, -2); // status
    assert!(bytes[24..].iter().all(|&b| b == 0));
}

// ============================================================================
// Sequenced frames
// ============================================================================

#[test]
fn test_back_to_back_requests_on_one_stream() {
    // A client pipelines: two submits, then an unlink for the first
    let mut stream = Vec::new();
    let first = CmdSubmit {
        seqnum: 1,
        devid: 0x0003000b,
        direction: Direction::Out,
        ep: 2,
        transfer_flags: 0,
        transfer_buffer_length: 3,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
        payload: Bytes::from_static(&[9, 8, 7]),
    };
    let second = CmdSubmit {
        seqnum: 2,
        direction: Direction::In,
        transfer_buffer_length: 64,
        payload: Bytes::new(),
        ..first.clone()
    };
    let third = CmdUnlink {
        seqnum: 3,
        devid: 0x0003000b,
        direction: Direction::Out,
        ep: 0,
        unlink_seqnum: 1,
    };
    stream.extend_from_slice(&first.to_bytes().unwrap());
    stream.extend_from_slice(&second.to_bytes().unwrap());
    stream.extend_from_slice(&third.to_bytes().unwrap());

    let mut cursor = Cursor::new(&stream[..]);
    match UrbRequest::read_from(&mut cursor).unwrap() {
        UrbRequest::Submit(cmd) => {
            assert_eq!(cmd.seqnum, 1);
            assert_eq!(cmd.payload.as_ref(), &[9, 8, 7]);
        }
        other => panic!("expected submit, got {:?}", other),
    }
    match UrbRequest::read_from(&mut cursor).unwrap() {
        UrbRequest::Submit(cmd) => {
            assert_eq!(cmd.seqnum, 2);
            assert!(cmd.payload.is_empty(), "IN submit carries no payload");
        }
        other => panic!("expected submit, got {:?}", other),
    }
    match UrbRequest::read_from(&mut cursor).unwrap() {
        UrbRequest::Unlink(cmd) => assert_eq!(cmd.unlink_seqnum, 1),
        other => panic!("expected unlink, got {:?}", other),
    }

    // Stream fully consumed; a further read sees a clean EOF
    assert!(matches!(
        UrbRequest::read_from(&mut cursor),
        Err(ProtocolError::Io(_))
    ));
}

#[test]
fn test_import_reply_then_urb_traffic() {
    // After a successful import the same stream carries URB replies;
    // the client must be able to split them at the right boundaries
    let mut record = device_record("3-1.4");
    record.interfaces.clear();

    let mut stream = Vec::new();
    stream.extend_from_slice(&OpRepImport::success(record).to_bytes().unwrap());
    let cmd = CmdSubmit {
        seqnum: 1,
        devid: 0x0003000b,
        direction: Direction::In,
        ep: 1,
        transfer_flags: 0,
        transfer_buffer_length: 4,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: [0u8; 8],
        payload: Bytes::new(),
    };
    stream.extend_from_slice(
        &RetSubmit::success(&cmd, 4, Bytes::from_static(&[1, 2, 3, 4]))
            .to_bytes()
            .unwrap(),
    );

    let mut cursor = Cursor::new(&stream[..]);
    let import = OpRepImport::read_from(&mut cursor).unwrap();
    assert_eq!(import.status, 0);
    assert_eq!(import.device.unwrap().busid, "3-1.4");

    let ret = RetSubmit::read_from(&mut cursor).unwrap();
    assert_eq!(ret.seqnum, 1);
    assert_eq!(ret.payload.as_ref(), &[1, 2, 3, 4]);
}

// ============================================================================
// Extremes
// ============================================================================

#[test]
fn test_maximal_field_values_roundtrip() {
    let record = DeviceRecord {
        path: "p".repeat(256),
        busid: "b".repeat(32),
        busnum: u32::MAX,
        devnum: u32::MAX,
        speed: DeviceSpeed::SuperPlus,
        vendor_id: u16::MAX,
        product_id: u16::MAX,
        bcd_device: u16::MAX,
        device_class: u8::MAX,
        device_subclass: u8::MAX,
        device_protocol: u8::MAX,
        configuration_value: u8::MAX,
        num_configurations: u8::MAX,
        // Import blocks never carry interface entries, whatever the count
        num_interfaces: u8::MAX,
        interfaces: Vec::new(),
    };

    let reply = OpRepImport {
        status: 0,
        device: Some(record.clone()),
    };
    let bytes = reply.to_bytes().unwrap();
    let decoded = OpRepImport::read_from(&mut Cursor::new(&bytes[..])).unwrap();
    assert_eq!(decoded.device.unwrap(), record);
}

#[test]
fn test_minimal_device_block() {
    let record = DeviceRecord {
        path: String::new(),
        busid: String::new(),
        busnum: 0,
        devnum: 0,
        speed: DeviceSpeed::Unknown,
        vendor_id: 0,
        product_id: 0,
        bcd_device: 0,
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        configuration_value: 0,
        num_configurations: 0,
        num_interfaces: 0,
        interfaces: Vec::new(),
    };

    let mut buf = Vec::new();
    record.write_to(&mut buf).unwrap();
    assert_eq!(buf.len(), DeviceRecord::SIZE);
    assert!(buf.iter().all(|&b| b == 0));

    let decoded = DeviceRecord::read_from(&mut Cursor::new(&buf)).unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn test_header_version_pinned() {
    let mut buf = Vec::new();
    OpHeader::new(0x8005, 0).write_to(&mut buf).unwrap();
    assert_eq!(&buf[..2], &[0x01, 0x11]);
}

#[test]
fn test_unlink_of_unlink_is_representable() {
    // unlink_seqnum may itself name an unlink command's seqnum; the
    // codec carries it without judgement
    let cmd = CmdUnlink {
        seqnum: 5,
        devid: 0,
        direction: Direction::Out,
        ep: 0,
        unlink_seqnum: 4,
    };
    let bytes = cmd.to_bytes().unwrap();
    match UrbRequest::read_from(&mut Cursor::new(&bytes[..])).unwrap() {
        UrbRequest::Unlink(decoded) => assert_eq!(decoded, cmd),
        other => panic!("expected unlink, got {:?}", other),
    }
}
