//! Operation-code constants and classifiers.
//!
//! The first payload byte of every data frame identifies the message kind.
//! Only the codes this node acts on (or deliberately ignores) are listed;
//! anything else falls through the dispatcher's silent-ignore path.

/// Command-station status request; not applicable to accessory nodes.
pub const RSTAT: u8 = 0x0C;
/// Query all nodes; answered with [`PNN`] when a node number is assigned.
pub const QNN: u8 = 0x0D;
/// Request node parameters during a mode transition.
pub const RQNP: u8 = 0x10;
/// Request module name during a mode transition.
pub const RQMN: u8 = 0x11;

/// Set node number (configuration tool → node in transition).
pub const SNN: u8 = 0x42;

/// Node requests a node number (entering the transition state).
pub const RQNN: u8 = 0x50;
/// Node releases its node number (reverting to lean mode).
pub const NNREL: u8 = 0x51;
/// Node number acknowledge.
pub const NNACK: u8 = 0x52;
/// Enter learn mode.
pub const NNLRN: u8 = 0x53;
/// Leave learn mode.
pub const NNULN: u8 = 0x54;
/// Clear all stored events (learn mode only).
pub const NNCLR: u8 = 0x55;
/// Request the number of free event slots.
pub const NNEVN: u8 = 0x56;
/// Request a readout of every stored event.
pub const NERD: u8 = 0x57;
/// Request the number of stored events.
pub const RQEVN: u8 = 0x58;
/// Write acknowledge.
pub const WRACK: u8 = 0x59;
/// Enter bootloader; ignored by this core.
pub const BOOT: u8 = 0x5C;
/// Force a bus-identifier self-enumeration.
pub const ENUM: u8 = 0x5D;

/// Command error response; payload carries one of the `CMDERR_*` codes.
pub const CMDERR: u8 = 0x6F;

/// Free event slot count response.
pub const EVNLF: u8 = 0x70;
/// Read a node variable.
pub const NVRD: u8 = 0x71;
/// Request a parameter by index.
pub const RQNPN: u8 = 0x73;
/// Stored event count response.
pub const NUMEV: u8 = 0x74;
/// Force a specific bus identifier.
pub const CANID: u8 = 0x75;

/// Accessory ON, long form.
pub const ACON: u8 = 0x90;
/// Accessory OFF, long form.
pub const ACOF: u8 = 0x91;
/// Accessory response ON.
pub const ARON: u8 = 0x93;
/// Accessory response OFF.
pub const AROF: u8 = 0x94;
/// Unlearn an event (learn mode only).
pub const EVULN: u8 = 0x95;
/// Set a node variable.
pub const NVSET: u8 = 0x96;
/// Node variable value response.
pub const NVANS: u8 = 0x97;
/// Accessory ON, short form.
pub const ASON: u8 = 0x98;
/// Accessory OFF, short form.
pub const ASOF: u8 = 0x99;
/// Parameter value response.
pub const PARAN: u8 = 0x9B;
/// Read an event variable by stored-event index.
pub const REVAL: u8 = 0x9C;

/// Accessory ON, long form, one data byte.
pub const ACON1: u8 = 0xB0;
/// Accessory OFF, long form, one data byte.
pub const ACOF1: u8 = 0xB1;
/// Event variable value response.
pub const NEVAL: u8 = 0xB5;
/// Node presence response to [`QNN`].
pub const PNN: u8 = 0xB6;
/// Accessory ON, short form, one data byte.
pub const ASON1: u8 = 0xB8;
/// Accessory OFF, short form, one data byte.
pub const ASOF1: u8 = 0xB9;

/// Accessory ON, long form, two data bytes.
pub const ACON2: u8 = 0xD0;
/// Accessory OFF, long form, two data bytes.
pub const ACOF2: u8 = 0xD1;
/// Learn an event (learn mode only).
pub const EVLRN: u8 = 0xD2;
/// Accessory ON, short form, two data bytes.
pub const ASON2: u8 = 0xD8;
/// Accessory OFF, short form, two data bytes.
pub const ASOF2: u8 = 0xD9;

/// Module name response.
pub const NAME: u8 = 0xE2;
/// Long-message fragment; forwarded to the fragment service when present.
pub const DTXC: u8 = 0xE9;
/// Node parameters response (during mode transition).
pub const PARAMS: u8 = 0xEF;

/// Accessory ON, long form, three data bytes.
pub const ACON3: u8 = 0xF0;
/// Accessory OFF, long form, three data bytes.
pub const ACOF3: u8 = 0xF1;
/// Stored event readout response.
pub const ENRSP: u8 = 0xF2;
/// Accessory ON, short form, three data bytes.
pub const ASON3: u8 = 0xF8;
/// Accessory OFF, short form, three data bytes.
pub const ASOF3: u8 = 0xF9;

/// CMDERR code: invalid event index.
pub const CMDERR_INVALID_EVENT: u8 = 6;
/// CMDERR code: invalid bus identifier.
pub const CMDERR_INVALID_IDENTIFIER: u8 = 7;
/// CMDERR code: parameter index out of range.
pub const CMDERR_INVALID_PARAM: u8 = 9;
/// CMDERR code: node-variable index out of range, event not found on
/// unlearn, or event storage exhausted.
pub const CMDERR_INVALID_NV: u8 = 10;

/// Long-form accessory opcodes: the event is keyed on (node number,
/// event number).
const LONG_ACCESSORY: [u8; 10] = [
    ACON, ACOF, ARON, AROF, ACON1, ACOF1, ACON2, ACOF2, ACON3, ACOF3,
];

/// Short-form accessory opcodes: the event is keyed on (0, event number).
const SHORT_ACCESSORY: [u8; 8] = [ASON, ASOF, ASON1, ASOF1, ASON2, ASOF2, ASON3, ASOF3];

/// Is this a long-form accessory event opcode?
#[inline]
pub fn is_long_accessory(opc: u8) -> bool {
    LONG_ACCESSORY.contains(&opc)
}

/// Is this a short-form accessory event opcode?
#[inline]
pub fn is_short_accessory(opc: u8) -> bool {
    SHORT_ACCESSORY.contains(&opc)
}

/// Is this any accessory event opcode?
#[inline]
pub fn is_accessory(opc: u8) -> bool {
    is_long_accessory(opc) || is_short_accessory(opc)
}

/// Polarity of an accessory opcode: even opcodes are ON events.
#[inline]
pub fn is_on_event(opc: u8) -> bool {
    opc % 2 == 0
}
