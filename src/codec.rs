//! Codec interface: a total, pure, thread-safe mapping between a typed
//! payload and the opaque bytes carried on the wire (§3, §6).

use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::Arc;

/// Encode/decode a typed payload to/from the length-delimited byte buffer a
/// `Payload` frame carries. Both directions are total: failures surface as
/// `Error::Codec` (mapped to `StatusCode::Internal`) during call execution
/// rather than as a distinct error channel (§6).
///
/// Implementations MUST be pure and thread-safe (§6) — `muxrpc-core` calls
/// `encode`/`decode` from whichever task owns the call's state machine, with
/// no serialisation of calls to the same codec instance.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> crate::Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> crate::Result<T>;
}

/// A codec erased to a common trait object, as stored in a
/// [`crate::contract::MethodContract`]. The registry enforces the static
/// type of `T` at registration time (via the generic `Codec<T>` the caller
/// supplies); once erased, the state machine only ever calls through this
/// object, never re-deriving `T` (§3: "the registry enforces type
/// consistency at registration").
pub type BoxedCodec<T> = Arc<dyn Codec<T>>;

/// A no-op codec for payloads that are already `Bytes` — useful for
/// transports or tests that want to move raw frames through the call state
/// machines unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> crate::Result<Bytes> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> crate::Result<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Wraps a pair of plain functions as a `Codec<T>`, for tests and small
/// in-process services that don't want to name a struct for every method.
pub struct FnCodec<T, E, D> {
    encode: E,
    decode: D,
    _marker: PhantomData<fn() -> T>,
}

impl<T, E, D> FnCodec<T, E, D>
where
    E: Fn(&T) -> crate::Result<Bytes> + Send + Sync,
    D: Fn(&[u8]) -> crate::Result<T> + Send + Sync,
{
    pub fn new(encode: E, decode: D) -> Self {
        FnCodec { encode, decode, _marker: PhantomData }
    }
}

impl<T, E, D> Codec<T> for FnCodec<T, E, D>
where
    T: Send + Sync,
    E: Fn(&T) -> crate::Result<Bytes> + Send + Sync,
    D: Fn(&[u8]) -> crate::Result<T> + Send + Sync,
{
    fn encode(&self, value: &T) -> crate::Result<Bytes> {
        (self.encode)(value)
    }

    fn decode(&self, bytes: &[u8]) -> crate::Result<T> {
        (self.decode)(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_codec_round_trips() {
        let codec = BytesCodec;
        let original = Bytes::from_static(b"hello");
        let encoded = codec.encode(&original).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn fn_codec_round_trips_strings() {
        let codec = FnCodec::new(
            |s: &String| Ok(Bytes::copy_from_slice(s.as_bytes())),
            |b: &[u8]| {
                String::from_utf8(b.to_vec())
                    .map_err(|e| crate::Error::Codec(e.to_string()))
            },
        );
        let encoded = codec.encode(&"hi".to_string()).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), "hi");
    }
}
