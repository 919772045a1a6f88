//! UDS Negative Response Codes (NRC)

use std::fmt;

/// A UDS negative response code
///
/// Any byte is a valid code; the associated constants name the ones defined
/// by ISO 14229-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegativeResponseCode(pub u8);

/// (code, symbolic name, description)
const NRC_TABLE: &[(u8, &str, &str)] = &[
    (0x10, "GeneralReject", "General reject"),
    (0x11, "ServiceNotSupported", "Service not supported"),
    (0x12, "SubFunctionNotSupported", "Sub-function not supported"),
    (0x13, "IncorrectMessageLengthOrFormat", "Incorrect message length or invalid format"),
    (0x14, "ResponseTooLong", "Response too long"),
    (0x21, "BusyRepeatRequest", "Busy, repeat request"),
    (0x22, "ConditionsNotCorrect", "Conditions not correct"),
    (0x24, "RequestSequenceError", "Request sequence error"),
    (0x25, "NoResponseFromSubnet", "No response from subnet component"),
    (0x26, "FailurePreventsExecution", "Failure prevents execution of requested action"),
    (0x31, "RequestOutOfRange", "Request out of range"),
    (0x33, "SecurityAccessDenied", "Security access denied"),
    (0x35, "InvalidKey", "Invalid key"),
    (0x36, "ExceededNumberOfAttempts", "Exceeded number of attempts"),
    (0x37, "RequiredTimeDelayNotExpired", "Required time delay not expired"),
    (0x70, "UploadDownloadNotAccepted", "Upload/download not accepted"),
    (0x71, "TransferDataSuspended", "Transfer data suspended"),
    (0x72, "GeneralProgrammingFailure", "General programming failure"),
    (0x73, "WrongBlockSequenceCounter", "Wrong block sequence counter"),
    (0x78, "ResponsePending", "Request correctly received, response pending"),
    (0x7E, "SubFunctionNotSupportedInActiveSession", "Sub-function not supported in active session"),
    (0x7F, "ServiceNotSupportedInActiveSession", "Service not supported in active session"),
    (0x81, "RpmTooHigh", "RPM too high"),
    (0x82, "RpmTooLow", "RPM too low"),
    (0x83, "EngineRunning", "Engine is running"),
    (0x84, "EngineNotRunning", "Engine is not running"),
    (0x85, "EngineRunTimeTooLow", "Engine run time too low"),
    (0x86, "TemperatureTooHigh", "Temperature too high"),
    (0x87, "TemperatureTooLow", "Temperature too low"),
    (0x88, "VehicleSpeedTooHigh", "Vehicle speed too high"),
    (0x89, "VehicleSpeedTooLow", "Vehicle speed too low"),
    (0x8A, "ThrottleTooHigh", "Throttle/pedal too high"),
    (0x8B, "ThrottleTooLow", "Throttle/pedal too low"),
    (0x8C, "TransmissionNotInNeutral", "Transmission range not in neutral"),
    (0x8D, "TransmissionNotInGear", "Transmission range not in gear"),
    (0x8F, "BrakeSwitchNotClosed", "Brake switch(es) not closed"),
    (0x90, "ShifterNotInPark", "Shifter lever not in park"),
    (0x91, "TorqueConverterClutchLocked", "Torque converter clutch locked"),
    (0x92, "VoltageTooHigh", "Voltage too high"),
    (0x93, "VoltageTooLow", "Voltage too low"),
];

/// Description returned for codes missing from the table
pub const UNKNOWN_NRC_DESCRIPTION: &str = "Unknown negative response code";

impl NegativeResponseCode {
    pub const GENERAL_REJECT: Self = Self(0x10);
    pub const SERVICE_NOT_SUPPORTED: Self = Self(0x11);
    pub const SUB_FUNCTION_NOT_SUPPORTED: Self = Self(0x12);
    pub const INCORRECT_MESSAGE_LENGTH: Self = Self(0x13);
    pub const CONDITIONS_NOT_CORRECT: Self = Self(0x22);
    pub const REQUEST_SEQUENCE_ERROR: Self = Self(0x24);
    pub const REQUEST_OUT_OF_RANGE: Self = Self(0x31);
    pub const SECURITY_ACCESS_DENIED: Self = Self(0x33);
    pub const INVALID_KEY: Self = Self(0x35);
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: Self = Self(0x36);
    pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: Self = Self(0x37);
    pub const RESPONSE_PENDING: Self = Self(0x78);

    fn entry(&self) -> Option<&'static (u8, &'static str, &'static str)> {
        NRC_TABLE.iter().find(|(code, _, _)| *code == self.0)
    }

    /// Symbolic name, `None` for codes outside the ISO table
    pub fn name(&self) -> Option<&'static str> {
        self.entry().map(|(_, name, _)| *name)
    }

    /// Human-readable description, falling back to [`UNKNOWN_NRC_DESCRIPTION`]
    pub fn description(&self) -> &'static str {
        self.entry()
            .map(|(_, _, description)| *description)
            .unwrap_or(UNKNOWN_NRC_DESCRIPTION)
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc.0
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown(0x{:02X})", self.0),
        }
    }
}

/// Description of a raw NRC byte; never fails
pub fn nrc_description(code: u8) -> &'static str {
    NegativeResponseCode(code).description()
}
