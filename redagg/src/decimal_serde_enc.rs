use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Encodes a `Decimal` as its 16 byte in-memory representation so that the scale
/// survives the roundtrip exactly, independent of the serializer's number model.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecimalBytes;

impl serde_with::SerializeAs<Decimal> for DecimalBytes {
    fn serialize_as<S>(source: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        source.serialize().serialize(serializer)
    }
}

impl<'de> serde_with::DeserializeAs<'de, Decimal> for DecimalBytes {
    fn deserialize_as<D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 16]>::deserialize(deserializer)?;
        Ok(Decimal::deserialize(bytes))
    }
}
