use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::OutboundMessage;
use zcore::{cls, NodeId};

pub const SUPPORTED_GET: u8 = 0x04;
pub const SUPPORTED_REPORT: u8 = 0x05;

/// The three thermostat classes share the same supported-get/report
/// command ids; only the class byte differs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    Mode,
    FanMode,
    Setpoint,
}

impl Kind {
    #[inline]
    fn class_id(self) -> u8 {
        match self {
            Kind::Mode => cls::THERMOSTAT_MODE,
            Kind::FanMode => cls::THERMOSTAT_FAN_MODE,
            Kind::Setpoint => cls::THERMOSTAT_SETPOINT,
        }
    }
}

pub fn supported_get(target: NodeId, kind: Kind, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, kind.class_id(), SUPPORTED_GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(kind.class_id(), SUPPORTED_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// The supported bitmask from a report: little endian, up to two bytes.
pub fn parse_supported_report(frame: &InboundFrame, kind: Kind) -> Option<u16> {
    match frame.app_cmd() {
        Some((class, SUPPORTED_REPORT)) if class == kind.class_id() => {
            let args = frame.cc_args();
            if args.is_empty() {
                return None;
            }
            let low = u16::from(args[0]);
            let high = args.get(1).map_or(0, |&byte| u16::from(byte) << 8);
            Some(high | low)
        }
        _ => None,
    }
}
