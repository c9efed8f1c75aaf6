use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::OutboundMessage;
use zcore::{cls, NodeId};

pub const NAME_SET: u8 = 0x01;
pub const NAME_GET: u8 = 0x02;
pub const NAME_REPORT: u8 = 0x03;

// Charset byte for plain ASCII
const CHARSET_ASCII: u8 = 0x00;
const MAX_NAME_LEN: usize = 16;

pub fn name_get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::NODE_NAMING, NAME_GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::NODE_NAMING, NAME_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Stores a name on the node. Names are capped at sixteen ASCII bytes by
/// the class.
pub fn name_set(target: NodeId, name: &str, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::NODE_NAMING, NAME_SET, profile.command_priority());
    msg.push(CHARSET_ASCII);
    for byte in name.bytes().take(MAX_NAME_LEN) {
        msg.push(byte);
    }
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn parse_name_report(frame: &InboundFrame) -> Option<String> {
    match frame.app_cmd() {
        Some((cls::NODE_NAMING, NAME_REPORT)) => {
            let args = frame.cc_args();
            if args.is_empty() {
                return None;
            }
            // Byte zero is the charset; we only deal in ASCII
            Some(
                args[1..]
                    .iter()
                    .take(MAX_NAME_LEN)
                    .map(|&byte| byte as char)
                    .collect(),
            )
        }
        _ => None,
    }
}
