use core::fmt::{self, Formatter};

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::soul::Soul;

/// A field value: a JSON scalar or a relation edge.
///
/// Relations are singleton objects `{"#": soul}` and form the edges of the
/// graph. Any other JSON object (or an array) is not a legal value and is
/// rejected at decode time.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The tombstone: written under a newer state, it deletes a field.
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Edge to another node: `{"#": soul}`.
    Relation(Soul),
}

impl Value {
    /// Canonical string encoding used for deterministic tie-breaking when
    /// two writes carry the same state. Lexically larger encodings win.
    #[must_use]
    pub fn lexical(&self) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => {
                // JSON-style rendering so both sides of a tie agree.
                serde_json::Number::from_f64(*n)
                    .map_or_else(|| "null".to_owned(), |n| n.to_string())
            }
            Self::String(s) => serde_json::to_string(s).unwrap_or_default(),
            Self::Relation(soul) => format!("{{\"#\":{}}}", serde_json::to_string(soul.as_str()).unwrap_or_default()),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The target soul when this value is a relation.
    #[must_use]
    pub fn relation(&self) -> Option<&Soul> {
        match self {
            Self::Relation(soul) => Some(soul),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Soul> for Value {
    fn from(soul: Soul) -> Self {
        Self::Relation(soul)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::Relation(soul) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("#", soul.as_str())?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("null, a boolean, a number, a string, or {\"#\": soul}")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
                #[allow(clippy::cast_precision_loss, reason = "wire numbers are IEEE-754 doubles")]
                Ok(Value::Number(n as f64))
            }

            fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
                #[allow(clippy::cast_precision_loss, reason = "wire numbers are IEEE-754 doubles")]
                Ok(Value::Number(n as f64))
            }

            fn visit_f64<E: de::Error>(self, n: f64) -> Result<Value, E> {
                if !n.is_finite() {
                    return Err(E::custom("non-finite number"));
                }
                Ok(Value::Number(n))
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
                Ok(Value::String(s.to_owned()))
            }

            fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let Some(key) = map.next_key::<String>()? else {
                    return Err(de::Error::custom("plain objects are not values"));
                };
                if key != "#" {
                    return Err(de::Error::custom("plain objects are not values"));
                }
                let soul = map.next_value::<String>()?;
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("relation must be a singleton object"));
                }
                Ok(Value::Relation(Soul::from(soul)))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() -> eyre::Result<()> {
        for (json, value) in [
            ("null", Value::Null),
            ("true", Value::Bool(true)),
            ("false", Value::Bool(false)),
            ("3.25", Value::Number(3.25)),
            ("\"Mark\"", Value::String("Mark".to_owned())),
            ("{\"#\":\"mark\"}", Value::Relation(Soul::from("mark"))),
        ] {
            let decoded: Value = serde_json::from_str(json)?;
            assert_eq!(decoded, value);
            let encoded = serde_json::to_string(&value)?;
            let redecoded: Value = serde_json::from_str(&encoded)?;
            assert_eq!(redecoded, value);
        }
        Ok(())
    }

    #[test]
    fn rejects_plain_objects() {
        assert!(serde_json::from_str::<Value>("{\"a\":1}").is_err());
        assert!(serde_json::from_str::<Value>("{\"#\":\"x\",\"b\":2}").is_err());
        assert!(serde_json::from_str::<Value>("{}").is_err());
        assert!(serde_json::from_str::<Value>("[1,2]").is_err());
    }

    #[test]
    fn lexical_encoding_orders_deterministically() {
        let alpha = Value::from("alpha");
        let beta = Value::from("beta");
        assert!(beta.lexical() > alpha.lexical());

        // Relations and scalars never render identically.
        assert_ne!(
            Value::Relation(Soul::from("x")).lexical(),
            Value::from("x").lexical()
        );
    }
}
