use serde::Serialize;

/// Standard success envelope: `{"data": ...}`.
///
/// Every successful JSON response wraps its payload in this envelope so
/// clients can distinguish data responses from `{error, code}` failures.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}
