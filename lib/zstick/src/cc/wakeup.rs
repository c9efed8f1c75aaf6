use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::{OutboundMessage, Priority};
use zcore::{cls, NodeId};

pub const INTERVAL_SET: u8 = 0x04;
pub const INTERVAL_GET: u8 = 0x05;
pub const INTERVAL_REPORT: u8 = 0x06;
pub const NOTIFICATION: u8 = 0x07;
pub const NO_MORE_INFORMATION: u8 = 0x08;

pub fn interval_get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::WAKE_UP, INTERVAL_GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::WAKE_UP, INTERVAL_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Sets the wakeup interval and the node to notify. The interval is a
/// 24 bit big endian second count.
pub fn interval_set(
    target: NodeId,
    seconds: u32,
    receiver: NodeId,
    profile: TargetProfile,
) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::WAKE_UP, INTERVAL_SET, profile.command_priority());
    msg.push((seconds >> 16) as u8);
    msg.push((seconds >> 8) as u8);
    msg.push(seconds as u8);
    msg.push(receiver);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Tells an awake node we are done with it so it can go back to sleep.
/// Always at wakeup priority; the node will not stay up for long.
pub fn no_more_information(target: NodeId, secure: bool) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::WAKE_UP, NO_MORE_INFORMATION, Priority::Wakeup);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, secure);
    msg
}

/// The interval and notified node from an interval report.
pub fn parse_interval_report(frame: &InboundFrame) -> Option<(u32, NodeId)> {
    match frame.app_cmd() {
        Some((cls::WAKE_UP, INTERVAL_REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 4 {
                return None;
            }
            let seconds =
                (u32::from(args[0]) << 16) | (u32::from(args[1]) << 8) | u32::from(args[2]);
            Some((seconds, args[3]))
        }
        _ => None,
    }
}

/// True when the frame is a wakeup notification from the node.
pub fn is_notification(frame: &InboundFrame) -> bool {
    frame.app_cmd() == Some((cls::WAKE_UP, NOTIFICATION))
}
