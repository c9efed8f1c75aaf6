use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::{OutboundMessage, Priority};
use byteorder::{BigEndian, ByteOrder};
use zcore::{cls, NodeId};

pub const GET: u8 = 0x04;
pub const REPORT: u8 = 0x05;

pub fn get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(
        target,
        cls::MANUFACTURER_SPECIFIC,
        GET,
        profile.query_priority(),
    );
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::MANUFACTURER_SPECIFIC, REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Our manufacturer/type/product report, synthesised from the configured
/// ids. The master asks for this during replication; answering it promptly
/// matters, so it goes out at reply priority.
pub fn report(target: NodeId, man_ids: u64, secure: bool) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::MANUFACTURER_SPECIFIC, REPORT, Priority::Reply);
    msg.push((man_ids >> 40) as u8);
    msg.push((man_ids >> 32) as u8);
    msg.push((man_ids >> 24) as u8);
    msg.push((man_ids >> 16) as u8);
    msg.push((man_ids >> 8) as u8);
    msg.push(man_ids as u8);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, secure);
    msg
}

/// Manufacturer id, product type and product id from a report.
pub fn parse_report(frame: &InboundFrame) -> Option<(u16, u16, u16)> {
    match frame.app_cmd() {
        Some((cls::MANUFACTURER_SPECIFIC, REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 6 {
                return None;
            }
            Some((
                BigEndian::read_u16(&args[0..2]),
                BigEndian::read_u16(&args[2..4]),
                BigEndian::read_u16(&args[4..6]),
            ))
        }
        _ => None,
    }
}
