//! Element datatypes.

mod conv;

pub use conv::ConvPath;

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub offset: usize,
    pub dtype: Datatype,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum Datatype {
    Integer {
        size: usize,
        signed: bool,
        order: ByteOrder,
    },
    Float {
        size: usize,
        order: ByteOrder,
    },
    Compound {
        size: usize,
        members: Vec<Member>,
    },
}

macro_rules! native_int {
    ($($name:ident => $size:expr, $signed:expr;)*) => {
        $(
            pub fn $name() -> Self {
                Datatype::Integer {
                    size: $size,
                    signed: $signed,
                    order: ByteOrder::Little,
                }
            }
        )*
    };
}

impl Datatype {
    native_int! {
        u8 => 1, false;
        i8 => 1, true;
        u16 => 2, false;
        i16 => 2, true;
        u32 => 4, false;
        i32 => 4, true;
        u64 => 8, false;
        i64 => 8, true;
    }

    pub fn f32() -> Self {
        Datatype::Float {
            size: 4,
            order: ByteOrder::Little,
        }
    }

    pub fn f64() -> Self {
        Datatype::Float {
            size: 8,
            order: ByteOrder::Little,
        }
    }

    /// The same atomic type in big-endian order. Compounds are returned as is.
    pub fn be(self) -> Self {
        match self {
            Datatype::Integer { size, signed, .. } => Datatype::Integer {
                size,
                signed,
                order: ByteOrder::Big,
            },
            Datatype::Float { size, .. } => Datatype::Float {
                size,
                order: ByteOrder::Big,
            },
            compound => compound,
        }
    }

    pub fn compound(size: usize, members: Vec<Member>) -> Result<Self> {
        let t = Datatype::Compound { size, members };
        t.validate()?;
        Ok(t)
    }

    pub fn size(&self) -> usize {
        match self {
            Datatype::Integer { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::Compound { size, .. } => *size,
        }
    }

    pub fn is_atomic(&self) -> bool {
        !matches!(self, Datatype::Compound { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Datatype::Integer { size, .. } if !matches!(size, 1 | 2 | 4 | 8) => Err(
                StorageError::invalid(format!("unsupported integer size {size}")),
            ),
            Datatype::Float { size, .. } if !matches!(size, 4 | 8) => Err(StorageError::invalid(
                format!("unsupported float size {size}"),
            )),
            Datatype::Compound { size, members } => {
                if *size == 0 {
                    return Err(StorageError::invalid("compound type has zero size"));
                }
                for (i, m) in members.iter().enumerate() {
                    m.dtype.validate()?;
                    if m.offset + m.dtype.size() > *size {
                        return Err(StorageError::invalid(format!(
                            "member {} overruns compound of size {size}",
                            m.name
                        )));
                    }
                    if members[..i].iter().any(|o| o.name == m.name) {
                        return Err(StorageError::invalid(format!(
                            "duplicate member name {}",
                            m.name
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Member {
    pub fn new(name: impl Into<String>, offset: usize, dtype: Datatype) -> Self {
        Self {
            name: name.into(),
            offset,
            dtype,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(Datatype::u8().size(), 1);
        assert_eq!(Datatype::i64().size(), 8);
        assert_eq!(Datatype::f32().be().size(), 4);
        assert!(Datatype::f64().is_atomic());
    }

    #[test]
    fn test_compound_validation() {
        let ok = Datatype::compound(
            12,
            vec![
                Member::new("a", 0, Datatype::i32()),
                Member::new("b", 4, Datatype::f64()),
            ],
        );
        assert!(ok.is_ok());

        let overrun = Datatype::compound(8, vec![Member::new("b", 4, Datatype::f64())]);
        assert!(overrun.is_err());

        let dup = Datatype::compound(
            8,
            vec![
                Member::new("a", 0, Datatype::i32()),
                Member::new("a", 4, Datatype::i32()),
            ],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let t = Datatype::i16().be();
        let yaml = serde_yaml::to_string(&t).unwrap();
        assert!(yaml.contains("class: integer"));
        assert_eq!(serde_yaml::from_str::<Datatype>(&yaml).unwrap(), t);
    }
}
