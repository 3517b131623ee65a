//! Conversion between typed keys and values and the byte ranges stored in
//! entry blocks.
//!
//! The cache itself only sees opaque bytes. A [`CacheSerializer`] reports how
//! many bytes a value needs so the block can be allocated at its final size,
//! then writes the value straight into the block.

/// Errors returned when stored bytes cannot be turned back into a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SerializeError {
    #[error("expected {expected} bytes, found {actual}")]
    Length { expected: usize, actual: usize },

    #[error("stored bytes are not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

pub trait CacheSerializer<T> {
    /// Exact number of bytes [`serialize`](Self::serialize) writes for `value`.
    fn serialized_size(&self, value: &T) -> u64;

    /// Write `value` into `out`, which is exactly `serialized_size(value)` long.
    fn serialize(&self, value: &T, out: &mut [u8]);

    fn deserialize(&self, bytes: &[u8]) -> Result<T, SerializeError>;
}

/// Raw bytes, stored as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl CacheSerializer<Vec<u8>> for BytesSerializer {
    fn serialized_size(&self, value: &Vec<u8>) -> u64 {
        value.len() as u64
    }

    fn serialize(&self, value: &Vec<u8>, out: &mut [u8]) {
        out.copy_from_slice(value);
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, SerializeError> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 strings, without length prefix or terminator.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringSerializer;

impl CacheSerializer<String> for StringSerializer {
    fn serialized_size(&self, value: &String) -> u64 {
        value.len() as u64
    }

    fn serialize(&self, value: &String, out: &mut [u8]) {
        out.copy_from_slice(value.as_bytes());
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, SerializeError> {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }
}

macro_rules! big_endian_serializer {
    ($(#[$doc:meta])* $name:ident, $ty:ty) => {
        $(#[$doc])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        impl CacheSerializer<$ty> for $name {
            fn serialized_size(&self, _value: &$ty) -> u64 {
                std::mem::size_of::<$ty>() as u64
            }

            fn serialize(&self, value: &$ty, out: &mut [u8]) {
                out.copy_from_slice(&value.to_be_bytes());
            }

            fn deserialize(&self, bytes: &[u8]) -> Result<$ty, SerializeError> {
                let bytes = bytes.try_into().map_err(|_| SerializeError::Length {
                    expected: std::mem::size_of::<$ty>(),
                    actual: bytes.len(),
                })?;
                Ok(<$ty>::from_be_bytes(bytes))
            }
        }
    };
}

big_endian_serializer!(
    /// `u32` as 4 big-endian bytes.
    U32Serializer,
    u32
);
big_endian_serializer!(
    /// `i32` as 4 big-endian bytes.
    I32Serializer,
    i32
);
big_endian_serializer!(
    /// `u64` as 8 big-endian bytes.
    U64Serializer,
    u64
);
