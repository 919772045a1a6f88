//! Assertion evaluation against decoded responses
//!
//! Assertions address the JSON view of a [`UdsServiceResponse`]:
//! `sid`, `isPositive`, `nrc`, `data`, and single bytes as `data.N` or
//! `data[N]`.

use serde_json::Value;
use udsim_core::{AssertionDescriptor, AssertionFailure, UdsServiceResponse};

/// Evaluate every assertion in order, collecting all failures
pub fn evaluate_all(
    assertions: &[AssertionDescriptor],
    response: &UdsServiceResponse,
) -> Vec<AssertionFailure> {
    if assertions.is_empty() {
        return Vec::new();
    }
    let view = serde_json::to_value(response).unwrap_or(Value::Null);
    assertions
        .iter()
        .enumerate()
        .filter_map(|(index, assertion)| {
            evaluate(assertion, response, &view)
                .err()
                .map(|message| AssertionFailure {
                    index,
                    kind: assertion.kind(),
                    message,
                })
        })
        .collect()
}

fn evaluate(
    assertion: &AssertionDescriptor,
    response: &UdsServiceResponse,
    view: &Value,
) -> Result<(), String> {
    match assertion {
        AssertionDescriptor::Equal {
            path,
            expected_value,
        } => {
            let actual = resolve(view, path).ok_or_else(|| format!("path '{}' not found", path))?;
            if actual == expected_value {
                Ok(())
            } else {
                Err(format!("'{}' is {}, expected {}", path, actual, expected_value))
            }
        }
        AssertionDescriptor::Range { path, min, max } => {
            let actual = resolve(view, path).ok_or_else(|| format!("path '{}' not found", path))?;
            let value = actual
                .as_f64()
                .ok_or_else(|| format!("'{}' is {}, not a number", path, actual))?;
            if (*min..=*max).contains(&value) {
                Ok(())
            } else {
                Err(format!("'{}' is {}, outside [{}, {}]", path, value, min, max))
            }
        }
        AssertionDescriptor::Nrc { expected_value } => match response.nrc {
            Some(nrc) if !response.is_positive && nrc == *expected_value => Ok(()),
            Some(nrc) if !response.is_positive => Err(format!(
                "NRC is 0x{:02X}, expected 0x{:02X}",
                nrc, expected_value
            )),
            _ => Err(format!(
                "response is positive, expected NRC 0x{:02X}",
                expected_value
            )),
        },
    }
}

/// Resolve a dotted path, accepting `[N]` as an index segment
fn resolve<'a>(view: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.replace('[', ".").replace(']', "");
    normalized
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(view, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
