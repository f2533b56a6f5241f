//! Resolution of declared Rust type names.
//!
//! Type names in declarations are strings. They resolve to one of: a scalar
//! that sqlx can bind and decode natively, a converted type stored through a
//! registered converter, an entity, or a list of one of those.

use depot_schema::Affinity;

use crate::declaration::ConverterDecl;

/// Scalars stored without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    /// `bool`.
    Bool,
    /// `i8`.
    I8,
    /// `i16`.
    I16,
    /// `i32`.
    I32,
    /// `i64`.
    I64,
    /// `u8`.
    U8,
    /// `u16`.
    U16,
    /// `u32`.
    U32,
    /// `f32`.
    F32,
    /// `f64`.
    F64,
    /// `String`.
    String,
    /// `Vec<u8>`.
    Bytes,
}

impl Scalar {
    /// Parses a normalized type name.
    #[must_use]
    pub fn parse(ty: &str) -> Option<Self> {
        Some(match ty {
            "bool" => Self::Bool,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "f32" => Self::F32,
            "f64" => Self::F64,
            "String" => Self::String,
            "Vec<u8>" => Self::Bytes,
            _ => return None,
        })
    }

    /// Affinity used to store this scalar.
    #[must_use]
    pub const fn affinity(self) -> Affinity {
        match self {
            Self::Bool
            | Self::I8
            | Self::I16
            | Self::I32
            | Self::I64
            | Self::U8
            | Self::U16
            | Self::U32 => Affinity::Integer,
            Self::F32 | Self::F64 => Affinity::Real,
            Self::String => Affinity::Text,
            Self::Bytes => Affinity::Blob,
        }
    }

    /// Owned Rust type.
    #[must_use]
    pub const fn rust(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::String => "String",
            Self::Bytes => "Vec<u8>",
        }
    }

    /// Type used when the value is passed by reference.
    #[must_use]
    pub const fn borrowed(self) -> &'static str {
        match self {
            Self::String => "&str",
            Self::Bytes => "&[u8]",
            other => other.rust(),
        }
    }

    /// Whether the scalar is `Copy`.
    #[must_use]
    pub const fn is_copy(self) -> bool {
        !matches!(self, Self::String | Self::Bytes)
    }
}

/// A converter available to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converter {
    /// The converted Rust type, as written in declarations.
    pub rust_type: String,
    /// Path of the converter type.
    pub converter: String,
    /// The column scalar it converts to and from.
    pub column: Scalar,
}

impl Converter {
    /// Converter for `chrono::DateTime<chrono::Utc>`, stored as epoch milliseconds.
    #[must_use]
    pub fn date_time_millis() -> Self {
        Self {
            rust_type: "chrono::DateTime<chrono::Utc>".to_string(),
            converter: "depot_runtime::convert::DateTimeMillis".to_string(),
            column: Scalar::I64,
        }
    }

    /// Builds a converter from its declaration.
    ///
    /// Returns `None` when the column type is not a scalar.
    #[must_use]
    pub fn from_decl(decl: &ConverterDecl) -> Option<Self> {
        Some(Self {
            rust_type: normalize(&decl.ty),
            converter: normalize(&decl.converter),
            column: Scalar::parse(&normalize(&decl.column))?,
        })
    }
}

/// How a single value is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Native scalar.
    Scalar(Scalar),
    /// Converted through a registered converter.
    Converted(Converter),
}

/// A single, possibly nullable, value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueType {
    /// Storage.
    pub kind: ValueKind,
    /// Whether the type is `Option<_>`.
    pub nullable: bool,
}

impl ValueType {
    /// The stored scalar.
    #[must_use]
    pub fn column_scalar(&self) -> Scalar {
        match &self.kind {
            ValueKind::Scalar(s) => *s,
            ValueKind::Converted(c) => c.column,
        }
    }

    /// Affinity of the column storing this value.
    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.column_scalar().affinity()
    }

    /// Owned Rust type, without the `Option` wrapper.
    #[must_use]
    pub fn inner_rust(&self) -> String {
        match &self.kind {
            ValueKind::Scalar(s) => s.rust().to_string(),
            ValueKind::Converted(c) => c.rust_type.clone(),
        }
    }

    /// Owned Rust type.
    #[must_use]
    pub fn rust(&self) -> String {
        wrap_option(self.inner_rust(), self.nullable)
    }

    /// Rust type decoded from the row.
    #[must_use]
    pub fn column_rust(&self) -> String {
        wrap_option(self.column_scalar().rust().to_string(), self.nullable)
    }

    /// The converter, when the value is converted.
    #[must_use]
    pub const fn converter(&self) -> Option<&Converter> {
        match &self.kind {
            ValueKind::Scalar(_) => None,
            ValueKind::Converted(c) => Some(c),
        }
    }
}

fn wrap_option(ty: String, nullable: bool) -> String {
    if nullable {
        format!("Option<{ty}>")
    } else {
        ty
    }
}

/// Removes all whitespace from a type name.
#[must_use]
pub fn normalize(ty: &str) -> String {
    ty.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Returns the argument of `outer<...>` if `ty` has that shape.
#[must_use]
pub fn generic_argument<'a>(ty: &'a str, outer: &str) -> Option<&'a str> {
    ty.strip_prefix(outer)?
        .strip_prefix('<')?
        .strip_suffix('>')
}

/// Resolves value types against the known converters.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    converters: Vec<Converter>,
}

impl TypeResolver {
    /// Creates a resolver. The `chrono` millisecond converter is always
    /// available unless a declaration overrides its type.
    #[must_use]
    pub fn new(mut converters: Vec<Converter>) -> Self {
        let builtin = Converter::date_time_millis();
        if !converters.iter().any(|c| c.rust_type == builtin.rust_type) {
            converters.push(builtin);
        }
        Self { converters }
    }

    /// Resolves a single value type, including `Option<T>`.
    #[must_use]
    pub fn value(&self, ty: &str) -> Option<ValueType> {
        let ty = normalize(ty);
        let (inner, nullable) = match generic_argument(&ty, "Option") {
            Some(inner) => (inner.to_string(), true),
            None => (ty, false),
        };
        let kind = match Scalar::parse(&inner) {
            Some(scalar) => ValueKind::Scalar(scalar),
            None => ValueKind::Converted(
                self.converters
                    .iter()
                    .find(|c| c.rust_type == inner)?
                    .clone(),
            ),
        };
        Some(ValueType { kind, nullable })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scalars() {
        let resolver = TypeResolver::new(Vec::new());
        let ty = resolver.value("Option< String >").unwrap();
        assert!(ty.nullable);
        assert_eq!(ty.rust(), "Option<String>");
        assert_eq!(ty.affinity(), Affinity::Text);

        let bytes = resolver.value("Vec<u8>").unwrap();
        assert_eq!(bytes.affinity(), Affinity::Blob);
        assert!(resolver.value("Vec<i64>").is_none());
    }

    #[test]
    fn test_resolve_builtin_converter() {
        let resolver = TypeResolver::new(Vec::new());
        let ty = resolver.value("chrono::DateTime<chrono::Utc>").unwrap();
        assert_eq!(ty.affinity(), Affinity::Integer);
        assert_eq!(ty.column_rust(), "i64");
        assert_eq!(
            ty.converter().unwrap().converter,
            "depot_runtime::convert::DateTimeMillis"
        );
    }

    #[test]
    fn test_generic_argument() {
        assert_eq!(generic_argument("Vec<Word>", "Vec"), Some("Word"));
        assert_eq!(generic_argument("Option<Vec<u8>>", "Option"), Some("Vec<u8>"));
        assert_eq!(generic_argument("Word", "Vec"), None);
    }
}
