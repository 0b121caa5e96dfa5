//! Conversion between typed messages and payload bytes.

use std::fmt::Display;

use bytes::Bytes;

use crate::error::{Error, Result};

/// A typed message that converts itself to and from payload bytes.
///
/// Implemented for every type with `TryFrom<Bytes>` and `TryInto<Bytes>`.
pub trait Message: Sized + Send + 'static {
    /// Serialize into a payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the conversion fails.
    fn encode(self) -> Result<Bytes>;

    /// Deserialize from a payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the conversion fails.
    fn decode(bytes: Bytes) -> Result<Self>;
}

impl<T> Message for T
where
    T: TryInto<Bytes> + TryFrom<Bytes> + Send + 'static,
    <T as TryInto<Bytes>>::Error: Display,
    <T as TryFrom<Bytes>>::Error: Display,
{
    fn encode(self) -> Result<Bytes> {
        self.try_into()
            .map_err(|e: <T as TryInto<Bytes>>::Error| Error::Codec(e.to_string()))
    }

    fn decode(bytes: Bytes) -> Result<Self> {
        Self::try_from(bytes)
            .map_err(|e: <T as TryFrom<Bytes>>::Error| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Name(String);

    impl TryFrom<Bytes> for Name {
        type Error = std::string::FromUtf8Error;

        fn try_from(value: Bytes) -> std::result::Result<Self, Self::Error> {
            String::from_utf8(value.to_vec()).map(Name)
        }
    }

    impl TryFrom<Name> for Bytes {
        type Error = std::convert::Infallible;

        fn try_from(value: Name) -> std::result::Result<Self, Self::Error> {
            Ok(Bytes::from(value.0))
        }
    }

    #[test]
    fn test_decode_failure_is_codec_error() {
        let error = Name::decode(Bytes::from_static(&[0xff, 0xfe])).unwrap_err();
        assert!(matches!(error, Error::Codec(_)));

        let bytes = Name("gopher".into()).encode().unwrap();
        assert_eq!(Name::decode(bytes).unwrap(), Name("gopher".into()));
    }
}
