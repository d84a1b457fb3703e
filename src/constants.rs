
/// Capacity of a single packet buffer on every transport. Neither the CTO nor the DTO
/// size negotiated at CONNECT may exceed this.
pub const MAX_PACKET_SIZE: usize = 255;

/// Number of CONNECT attempts before giving up.
pub const CONNECT_RETRIES: usize = 5;

pub mod commands {
    pub const CONNECT: u8 = 0xff;
    pub const DISCONNECT: u8 = 0xfe;
    pub const GET_STATUS: u8 = 0xfd;
    pub const GET_SEED: u8 = 0xf8;
    pub const UNLOCK: u8 = 0xf7;
    pub const SET_MTA: u8 = 0xf6;
    pub const UPLOAD: u8 = 0xf5;
    pub const PROGRAM_START: u8 = 0xd2;
    pub const PROGRAM_CLEAR: u8 = 0xd1;
    pub const PROGRAM: u8 = 0xd0;
    pub const PROGRAM_RESET: u8 = 0xcf;
    pub const PROGRAM_MAX: u8 = 0xc9;
}

/// Packet identifiers of slave responses.
pub mod pid {
    pub const RES: u8 = 0xff;
    pub const ERR: u8 = 0xfe;
}

/// Resource protection bits, as reported by GET_STATUS and used by GET_SEED.
pub mod resource {
    pub const CALPAG: u8 = 0x01;
    pub const DAQ: u8 = 0x04;
    pub const STIM: u8 = 0x08;
    pub const PGM: u8 = 0x10;
}

/// Default USB identifiers of an OpenBLT compatible bootloader.
pub const USB_VENDOR_ID: u16 = 0x1d50;
pub const USB_PRODUCT_ID: u16 = 0x60ac;

/// Default TCP port of the XCP-on-TCP bootloader.
pub const NET_DEFAULT_PORT: u16 = 1000;
