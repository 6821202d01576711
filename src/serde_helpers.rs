//! Decoding of peer payloads.
//!
//! When the `tracing` feature is enabled, unknown fields in acknowledgements
//! are logged as warnings and decode failures are logged with the JSON path
//! that broke, which helps spot a server speaking a newer protocol.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Decode a peer payload into `T`.
///
/// Any mismatch with the expected shape is a [`Kind::Protocol`](crate::error::Kind::Protocol)
/// error; callers treat it as a negative response.
#[cfg(feature = "tracing")]
pub fn decode_payload<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(type_name = %type_name::<T>(), json = %value, "decoding payload");

    let original = value.clone();
    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .inspect_err(|_| {
        let path_result: Result<T, _> = serde_path_to_error::deserialize(original.clone());
        if let Err(path_err) = path_result {
            tracing::error!(
                type_name = %type_name::<T>(),
                path = %path_err.path(),
                json = %original,
                error = %path_err.inner(),
                "payload violates wire contract"
            );
        }
    })?;

    for path in unknown_paths {
        tracing::warn!(
            type_name = %type_name::<T>(),
            field = %path,
            "unknown field in payload"
        );
    }

    Ok(result)
}

/// Pass-through decoding when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn decode_payload<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}
