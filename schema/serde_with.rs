//! Serde helpers for the keyed collections in the schema document.
//!
//! On the wire the schema stores models, fields and the like as arrays (the
//! element already carries its name); in memory we want them keyed for O(1)
//! lookup while keeping declaration order where it matters.

/// (De)serializes a map as a vec of its values, re-keying on `$key_field`.
#[macro_export]
macro_rules! serde_keyed_vec {
    (mod $mod:ident, $map:ident<$key:ty, $elem:ty>, $key_field:ident) => {
        pub mod $mod {
            use ::serde::de::{Deserialize, Deserializer};
            use ::serde::ser::{Serialize, Serializer};
            use super::*;

            pub fn serialize<S: Serializer>(
                map: &$map<$key, $elem>,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                map.values().collect::<Vec<&$elem>>().serialize(serializer)
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<$map<$key, $elem>, D::Error> {
                let elems = Vec::<$elem>::deserialize(deserializer)?;
                Ok(elems
                    .into_iter()
                    .map(|e| (e.$key_field.clone(), e))
                    .collect())
            }
        }
    };
}

/// (De)serializes a map as a vec of `(key, value)` pairs. Used where the
/// value does not embed its own key.
#[macro_export]
macro_rules! serde_pair_vec {
    (mod $mod:ident, $map:ident<$key:ty, $value:ty>) => {
        pub mod $mod {
            use ::serde::de::{Deserialize, Deserializer};
            use ::serde::ser::{Serialize, Serializer};
            use super::*;

            pub fn serialize<S: Serializer>(
                map: &$map<$key, $value>,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                map.iter()
                    .collect::<Vec<(&$key, &$value)>>()
                    .serialize(serializer)
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<$map<$key, $value>, D::Error> {
                let pairs = Vec::<($key, $value)>::deserialize(deserializer)?;
                Ok(pairs.into_iter().collect())
            }
        }
    };
}
