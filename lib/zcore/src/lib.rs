#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// An addressable endpoint on the Z-Wave network.
pub type NodeId = u8;

pub const NODE_BROADCAST: NodeId = 0xFF;
pub const MAX_NODES: usize = 232;

// Frame level bytes
pub const SOF: u8 = 0x01;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const CAN: u8 = 0x18;

pub const REQUEST: u8 = 0x00;
pub const RESPONSE: u8 = 0x01;

// Default transmit options: ack, auto-route, explore
pub const TRANSMIT_OPTIONS: u8 = 0x25;

/// Serial API function ids used by the engine and its callers.
pub mod func {
    pub const SERIAL_API_GET_INIT_DATA: u8 = 0x02;
    pub const SERIAL_API_APPL_NODE_INFORMATION: u8 = 0x03;
    pub const APPLICATION_COMMAND_HANDLER: u8 = 0x04;
    pub const ZW_GET_CONTROLLER_CAPABILITIES: u8 = 0x05;
    pub const SERIAL_API_SET_TIMEOUTS: u8 = 0x06;
    pub const SERIAL_API_GET_CAPABILITIES: u8 = 0x07;
    pub const ZW_SEND_NODE_INFORMATION: u8 = 0x12;
    pub const ZW_SEND_DATA: u8 = 0x13;
    pub const ZW_GET_VERSION: u8 = 0x15;
    pub const ZW_MEMORY_GET_ID: u8 = 0x20;
    pub const ZW_SET_DEFAULT: u8 = 0x42;
    pub const ZW_APPLICATION_UPDATE: u8 = 0x49;
    pub const ZW_SET_LEARN_MODE: u8 = 0x50;
    pub const ZW_ENABLE_SUC: u8 = 0x52;
    pub const ZW_SET_SUC_NODE_ID: u8 = 0x54;
    pub const ZW_GET_SUC_NODE_ID: u8 = 0x56;
}

/// Command class ids for the classes the engine itself understands.
pub mod cls {
    pub const NO_OPERATION: u8 = 0x00;
    pub const BASIC: u8 = 0x20;
    pub const SWITCH_BINARY: u8 = 0x25;
    pub const THERMOSTAT_MODE: u8 = 0x40;
    pub const THERMOSTAT_SETPOINT: u8 = 0x43;
    pub const THERMOSTAT_FAN_MODE: u8 = 0x44;
    pub const MULTI_CHANNEL: u8 = 0x60;
    pub const CONFIGURATION: u8 = 0x70;
    pub const MANUFACTURER_SPECIFIC: u8 = 0x72;
    pub const NODE_NAMING: u8 = 0x77;
    pub const WAKE_UP: u8 = 0x84;
    pub const ASSOCIATION: u8 = 0x85;
    pub const VERSION: u8 = 0x86;
    pub const MULTI_CHANNEL_ASSOCIATION: u8 = 0x8E;
    pub const SECURITY: u8 = 0x98;
}

/// Learn mode callback status bytes.
pub mod learn {
    pub const STARTED: u8 = 0x01;
    pub const DONE: u8 = 0x06;
    pub const FAILED: u8 = 0x07;
}

/// Device type bytes we announce in our own node information frame.
pub mod devtype {
    pub const GENERIC_STATIC_CONTROLLER: u8 = 0x02;
    pub const SPECIFIC_PC_CONTROLLER: u8 = 0x01;
}

pub const SUC_FUNC_BASIC: u8 = 0x00;

pub mod crypto;
pub mod logging;
pub mod time;
