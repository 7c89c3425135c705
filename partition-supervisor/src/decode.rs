//! Decoding capabilities handed to connectors when streams are opened.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::error::DecodeError;

/// Turns a raw payload into a typed record.
pub trait Decoder<R>: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<R, DecodeError>;
}

/// Payloads as owned bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl Decoder<Vec<u8>> for BytesDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(payload.to_vec())
    }
}

/// Payloads as UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl Decoder<String> for Utf8Decoder {
    fn decode(&self, payload: &[u8]) -> Result<String, DecodeError> {
        Ok(String::from_utf8(payload.to_vec())?)
    }
}

/// Payloads as JSON documents deserialized into `T`.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> Decoder<T> for JsonDecoder<T> {
    fn decode(&self, payload: &[u8]) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Adapts a plain function into a [`Decoder`].
pub struct FnDecoder<F>(F);

pub fn decode_with<R, F>(f: F) -> FnDecoder<F>
where
    F: Fn(&[u8]) -> Result<R, DecodeError> + Send + Sync + 'static,
{
    FnDecoder(f)
}

impl<R, F> Decoder<R> for FnDecoder<F>
where
    F: Fn(&[u8]) -> Result<R, DecodeError> + Send + Sync + 'static,
{
    fn decode(&self, payload: &[u8]) -> Result<R, DecodeError> {
        (self.0)(payload)
    }
}
