//! Value converters for field types that are not stored natively.
//!
//! Converters are registered as instances in a [`ConverterRegistry`] and
//! looked up by type by the generated code. A missing registration is a
//! typed [`Error::MissingTypeConverter`], not a panic.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Converts between a field type and the column type that stores it.
pub trait TypeConverter: Send + Sync + 'static {
    /// The field type.
    type Value;
    /// The stored column type.
    type Column;

    /// Converts a field value for storage.
    fn to_column(&self, value: &Self::Value) -> Self::Column;

    /// Converts a stored value back.
    fn from_column(&self, column: Self::Column) -> Result<Self::Value>;
}

/// Stores `DateTime<Utc>` as milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateTimeMillis;

impl TypeConverter for DateTimeMillis {
    type Value = DateTime<Utc>;
    type Column = i64;

    fn to_column(&self, value: &DateTime<Utc>) -> i64 {
        value.timestamp_millis()
    }

    fn from_column(&self, column: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(column)
            .ok_or_else(|| Error::Conversion(format!("{column} ms is out of the DateTime range")))
    }
}

/// Converter instances, keyed by type.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.converters.len())
            .finish()
    }
}

impl ConverterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().register(DateTimeMillis)
    }

    /// Registers a converter instance, replacing any earlier one of the same type.
    #[must_use]
    pub fn register<C: TypeConverter>(mut self, converter: C) -> Self {
        self.converters.insert(TypeId::of::<C>(), Arc::new(converter));
        self
    }

    /// Looks up the converter of type `C`.
    pub fn get<C: TypeConverter>(&self) -> Result<Arc<C>> {
        self.converters
            .get(&TypeId::of::<C>())
            .cloned()
            .and_then(|c| c.downcast::<C>().ok())
            .ok_or(Error::MissingTypeConverter(std::any::type_name::<C>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Flag;

    impl TypeConverter for Flag {
        type Value = bool;
        type Column = String;

        fn to_column(&self, value: &bool) -> String {
            if *value { "Y" } else { "N" }.to_string()
        }

        fn from_column(&self, column: String) -> Result<bool> {
            match column.as_str() {
                "Y" => Ok(true),
                "N" => Ok(false),
                other => Err(Error::Conversion(format!("invalid flag '{other}'"))),
            }
        }
    }

    #[test]
    fn test_date_time_millis() {
        let converter = DateTimeMillis;
        let t = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(converter.to_column(&t), 1_700_000_000_123);
        assert_eq!(converter.from_column(1_700_000_000_123).unwrap(), t);
        assert!(converter.from_column(i64::MAX).is_err());
    }

    #[test]
    fn test_lookup() {
        let registry = ConverterRegistry::with_defaults().register(Flag);
        assert!(registry.get::<DateTimeMillis>().is_ok());
        let flag = registry.get::<Flag>().unwrap();
        assert_eq!(flag.to_column(&true), "Y");
        assert!(flag.from_column("maybe".to_string()).is_err());
    }

    #[test]
    fn test_missing_converter() {
        let err = ConverterRegistry::new().get::<Flag>().unwrap_err();
        assert!(matches!(err, Error::MissingTypeConverter(name) if name.ends_with("Flag")));
    }
}
