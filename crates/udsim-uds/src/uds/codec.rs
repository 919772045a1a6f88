//! Request encoding and response decoding
//!
//! The codec is pure: no validation beyond type shape happens here, range
//! checks belong to the scenario builder and the engine.

use std::collections::BTreeSet;

use udsim_core::{CodecError, UdsServiceRequest, UdsServiceResponse};

use super::{service_id, POSITIVE_RESPONSE_OFFSET};

/// Lowest service id accepted by [`is_valid_sid`]
pub const MIN_SID: u8 = 0x10;

/// Highest service id in practical use by the simulator
pub const MAX_PRACTICAL_SID: u8 = 0x85;

/// Encode a request as `[sid, subFunction?, ...data]`
pub fn encode(request: &UdsServiceRequest) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + request.data.len());
    bytes.push(request.sid);
    if let Some(sub_function) = request.sub_function {
        bytes.push(sub_function);
    }
    bytes.extend_from_slice(&request.data);
    bytes
}

/// Decode raw response bytes
///
/// `7F sid nrc` is a negative response; anything else is positive with
/// `sid = bytes[0] - 0x40`.
pub fn decode(bytes: &[u8]) -> Result<UdsServiceResponse, CodecError> {
    let Some(&first) = bytes.first() else {
        return Err(CodecError::EmptyResponse);
    };

    if first == service_id::NEGATIVE_RESPONSE {
        if bytes.len() < 3 {
            return Err(CodecError::MalformedNegativeResponse { len: bytes.len() });
        }
        return Ok(UdsServiceResponse::negative(bytes[1], bytes[2]));
    }

    Ok(UdsServiceResponse::positive(
        first.wrapping_sub(POSITIVE_RESPONSE_OFFSET),
        &bytes[1..],
    ))
}

/// Whether `sid` is within the request range `0x10..=0xFF`
pub fn is_valid_sid(sid: u8) -> bool {
    sid >= MIN_SID
}

/// Whether `sid` is within the range the simulator actually serves (`0x10..=0x85`)
pub fn is_practical_sid(sid: u8) -> bool {
    (MIN_SID..=MAX_PRACTICAL_SID).contains(&sid)
}

/// Whether a response matches the set of expected NRCs
///
/// A positive response matches only an empty set; a negative response
/// matches when its NRC is a member.
pub fn matches_expected_nrc(response: &UdsServiceResponse, expected: &BTreeSet<u8>) -> bool {
    if response.is_positive {
        return expected.is_empty();
    }
    response.nrc.is_some_and(|nrc| expected.contains(&nrc))
}

/// Build positive response bytes for a service
pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(sid.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    response.extend_from_slice(data);
    response
}

/// Build negative response bytes
pub fn negative_response(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc]
}
