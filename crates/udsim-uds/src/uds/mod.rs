//! UDS (Unified Diagnostic Services, ISO 14229) protocol layer
//!
//! Request encoding, response decoding and the SID / NRC symbol tables.

pub mod codec;
mod nrc;
mod services;

pub use nrc::{nrc_description, NegativeResponseCode};
pub use services::service_name;

/// Offset added to a request SID to form its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const READ_DATA_BY_PERIODIC_ID: u8 = 0x2A;
    pub const DYNAMICALLY_DEFINE_DATA_ID: u8 = 0x2C;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) sub-functions
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// SecurityAccess (0x27) sub-functions
///
/// Odd values request a seed, the following even value sends the key.
pub mod security_sub_function {
    pub const REQUEST_SEED_SUPPLIER: u8 = 0x01;
    pub const SEND_KEY_SUPPLIER: u8 = 0x02;
    pub const REQUEST_SEED_OEM: u8 = 0x03;
    pub const SEND_KEY_OEM: u8 = 0x04;

    pub fn is_request_seed(sub_function: u8) -> bool {
        sub_function % 2 == 1
    }
}
