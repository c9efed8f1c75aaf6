use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::OutboundMessage;
use zcore::{cls, NodeId};

pub const GET: u8 = 0x11;
pub const REPORT: u8 = 0x12;
pub const COMMAND_CLASS_GET: u8 = 0x13;
pub const COMMAND_CLASS_REPORT: u8 = 0x14;

#[derive(Debug, Eq, PartialEq)]
pub struct VersionReport {
    pub library: u8,
    pub protocol: (u8, u8),
    pub application: (u8, u8),
}

pub fn get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::VERSION, GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::VERSION, REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Probes the version of one supported class. Callers walk the node's
/// class list with this, one class at a time.
pub fn class_get(target: NodeId, class_id: u8, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::VERSION, COMMAND_CLASS_GET, profile.query_priority());
    msg.push(class_id);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::VERSION, COMMAND_CLASS_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn parse_report(frame: &InboundFrame) -> Option<VersionReport> {
    match frame.app_cmd() {
        Some((cls::VERSION, REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 5 {
                return None;
            }
            Some(VersionReport {
                library: args[0],
                protocol: (args[1], args[2]),
                application: (args[3], args[4]),
            })
        }
        _ => None,
    }
}

/// The probed class and its version.
pub fn parse_class_report(frame: &InboundFrame) -> Option<(u8, u8)> {
    match frame.app_cmd() {
        Some((cls::VERSION, COMMAND_CLASS_REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 2 {
                return None;
            }
            Some((args[0], args[1]))
        }
        _ => None,
    }
}
