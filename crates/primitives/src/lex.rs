use core::fmt::{self, Formatter};

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::soul::Soul;

/// A query against the graph: a soul plus a field selector.
///
/// Wire shape: `{"#": soul, ".": selector}` where the selector is a field
/// name, `{"*": prefix}`, `{">": lo, "<": hi}` (both endpoints inclusive),
/// or absent for the whole node. Numeric field names are coerced to their
/// string form on decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lex {
    pub soul: Soul,
    pub field: FieldSelector,
}

impl Lex {
    #[must_use]
    pub fn node(soul: impl Into<Soul>) -> Self {
        Self {
            soul: soul.into(),
            field: FieldSelector::All,
        }
    }

    #[must_use]
    pub fn field(soul: impl Into<Soul>, field: impl Into<String>) -> Self {
        Self {
            soul: soul.into(),
            field: FieldSelector::Exact(field.into()),
        }
    }

    #[must_use]
    pub fn prefix(soul: impl Into<Soul>, prefix: impl Into<String>) -> Self {
        Self {
            soul: soul.into(),
            field: FieldSelector::Prefix(prefix.into()),
        }
    }

    #[must_use]
    pub fn range(
        soul: impl Into<Soul>,
        lo: impl Into<Option<String>>,
        hi: impl Into<Option<String>>,
    ) -> Self {
        Self {
            soul: soul.into(),
            field: FieldSelector::Range {
                lo: lo.into(),
                hi: hi.into(),
            },
        }
    }
}

/// Which fields of a node a [`Lex`] selects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldSelector {
    /// The whole node.
    #[default]
    All,
    /// One field by exact name.
    Exact(String),
    /// All fields whose name starts with the prefix.
    Prefix(String),
    /// All fields with `lo <= name <= hi`; a missing endpoint is unbounded.
    Range {
        lo: Option<String>,
        hi: Option<String>,
    },
}

impl FieldSelector {
    /// Whether `field` satisfies this selector.
    #[must_use]
    pub fn matches(&self, field: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(name) => field == name,
            Self::Prefix(prefix) => field.starts_with(prefix.as_str()),
            Self::Range { lo, hi } => {
                lo.as_deref().map_or(true, |lo| field >= lo)
                    && hi.as_deref().map_or(true, |hi| field <= hi)
            }
        }
    }
}

impl Serialize for Lex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let entries = match self.field {
            FieldSelector::All => 1,
            _ => 2,
        };
        let mut map = serializer.serialize_map(Some(entries))?;
        map.serialize_entry("#", self.soul.as_str())?;
        match &self.field {
            FieldSelector::All => {}
            FieldSelector::Exact(name) => map.serialize_entry(".", name)?,
            FieldSelector::Prefix(prefix) => {
                map.serialize_entry(".", &PrefixRepr { prefix })?;
            }
            FieldSelector::Range { lo, hi } => {
                map.serialize_entry(".", &RangeRepr { lo, hi })?;
            }
        }
        map.end()
    }
}

#[derive(Serialize)]
struct PrefixRepr<'a> {
    #[serde(rename = "*")]
    prefix: &'a str,
}

#[derive(Serialize)]
struct RangeRepr<'a> {
    #[serde(rename = ">", skip_serializing_if = "Option::is_none")]
    lo: &'a Option<String>,
    #[serde(rename = "<", skip_serializing_if = "Option::is_none")]
    hi: &'a Option<String>,
}

impl<'de> Deserialize<'de> for Lex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LexVisitor;

        impl<'de> Visitor<'de> for LexVisitor {
            type Value = Lex;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a lex object {\"#\": soul, \".\": selector}")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Lex, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut soul = None::<String>;
                let mut field = FieldSelector::All;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "#" => soul = Some(map.next_value()?),
                        "." => field = map.next_value::<RawSelector>()?.into(),
                        _ => {
                            let _ = map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }

                let soul = soul.ok_or_else(|| de::Error::missing_field("#"))?;
                Ok(Lex {
                    soul: Soul::from(soul),
                    field,
                })
            }
        }

        deserializer.deserialize_map(LexVisitor)
    }
}

/// Accepts the loose wire forms of the `.` selector.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Name(String),
    // Numeric field names appear on the wire; coerce to string.
    Number(f64),
    Shape(RawShape),
}

#[derive(Deserialize)]
struct RawShape {
    #[serde(rename = "*")]
    prefix: Option<String>,
    #[serde(rename = ">")]
    lo: Option<String>,
    #[serde(rename = "<")]
    hi: Option<String>,
}

impl From<RawSelector> for FieldSelector {
    fn from(raw: RawSelector) -> Self {
        match raw {
            RawSelector::Name(name) => Self::Exact(name),
            RawSelector::Number(n) => {
                // Integral numbers render without a fraction, as they would
                // have been written by the sender.
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    #[allow(clippy::cast_possible_truncation, reason = "fraction checked above")]
                    Self::Exact((n as i64).to_string())
                } else {
                    Self::Exact(n.to_string())
                }
            }
            RawSelector::Shape(shape) => shape.prefix.map_or(
                Self::Range {
                    lo: shape.lo,
                    hi: shape.hi,
                },
                Self::Prefix,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_all_wire_shapes() -> eyre::Result<()> {
        let exact: Lex = serde_json::from_str(r##"{"#":"mark",".":"name"}"##)?;
        assert_eq!(exact, Lex::field("mark", "name"));

        let whole: Lex = serde_json::from_str(r##"{"#":"mark"}"##)?;
        assert_eq!(whole, Lex::node("mark"));

        let prefix: Lex = serde_json::from_str(r##"{"#":"mark",".":{"*":"na"}}"##)?;
        assert_eq!(prefix, Lex::prefix("mark", "na"));

        let range: Lex = serde_json::from_str(r##"{"#":"mark",".":{">":"a","<":"m"}}"##)?;
        assert_eq!(range, Lex::range("mark", "a".to_owned(), "m".to_owned()));
        Ok(())
    }

    #[test]
    fn coerces_numeric_field_names() -> eyre::Result<()> {
        let lex: Lex = serde_json::from_str(r##"{"#":"list",".":3}"##)?;
        assert_eq!(lex, Lex::field("list", "3"));
        Ok(())
    }

    #[test]
    fn round_trips_through_json() -> eyre::Result<()> {
        for lex in [
            Lex::node("s"),
            Lex::field("s", "f"),
            Lex::prefix("s", "p"),
            Lex::range("s", Some("a".to_owned()), None),
        ] {
            let json = serde_json::to_string(&lex)?;
            let decoded: Lex = serde_json::from_str(&json)?;
            assert_eq!(decoded, lex);
        }
        Ok(())
    }

    #[test]
    fn selector_matching() {
        assert!(FieldSelector::All.matches("anything"));
        assert!(FieldSelector::Exact("name".to_owned()).matches("name"));
        assert!(!FieldSelector::Exact("name".to_owned()).matches("nam"));
        assert!(FieldSelector::Prefix("na".to_owned()).matches("name"));

        let range = FieldSelector::Range {
            lo: Some("a".to_owned()),
            hi: Some("m".to_owned()),
        };
        assert!(range.matches("a"));
        assert!(range.matches("m"));
        assert!(!range.matches("n"));
    }
}
