use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::OutboundMessage;
use zcore::{cls, NodeId};

pub const SET: u8 = 0x04;
pub const GET: u8 = 0x05;
pub const REPORT: u8 = 0x06;

/// The value widths the configuration class supports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParamSize {
    One = 1,
    Two = 2,
    Four = 4,
}

/// Writes a parameter. The value is sent as a signed big endian field of
/// the requested width; out of range values are truncated the way the
/// devices themselves do it.
pub fn param_set(
    target: NodeId,
    param: u8,
    value: i32,
    size: ParamSize,
    profile: TargetProfile,
) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::CONFIGURATION, SET, profile.command_priority());
    msg.push(param);
    msg.push(size as u8);

    let bytes = value.to_be_bytes();
    msg.push_bytes(&bytes[4 - size as usize..]);

    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn param_get(target: NodeId, param: u8, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::CONFIGURATION, GET, profile.query_priority());
    msg.push(param);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::CONFIGURATION, REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// The parameter and its sign extended value from a report. The field
/// width comes from the size byte in the reply.
pub fn parse_report(frame: &InboundFrame) -> Option<(u8, i64)> {
    match frame.app_cmd() {
        Some((cls::CONFIGURATION, REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 3 {
                return None;
            }

            let param = args[0];
            let size = (args[1] & 0x07) as usize;
            if size == 0 || args.len() < 2 + size {
                return None;
            }

            let field = &args[2..2 + size];
            let mut value = i64::from(field[0] as i8);
            for &byte in &field[1..] {
                value = (value << 8) | i64::from(byte);
            }
            Some((param, value))
        }
        _ => None,
    }
}
