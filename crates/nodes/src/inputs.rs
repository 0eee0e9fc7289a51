//! `HandlerInputs`: the named value bag handed to a node at execution time.
//!
//! Values are stored as JSON so that one node's outputs can be fed to the
//! next node's inputs unchanged, and so that the engine can fingerprint them.
//! Type checking happens on read through serde: a value either deserializes
//! into the requested type or the read fails with a typed [`InputError`].

use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::InputError;

/// A named, type-checked bag of values. Names are never blank.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HandlerInputs {
    values: BTreeMap<String, Value>,
}

/// Handlers produce outputs in the same shape they consume inputs.
pub type HandlerOutputs = HandlerInputs;

fn check_name(name: &str) -> Result<(), InputError> {
    if name.trim().is_empty() {
        return Err(InputError::InvalidName);
    }
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl HandlerInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any previous value.
    pub fn insert<V: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: V,
    ) -> Result<(), InputError> {
        let name = name.into();
        check_name(&name)?;
        let value =
            serde_json::to_value(value).map_err(|e| InputError::Serialization(e.to_string()))?;
        self.values.insert(name, value);
        Ok(())
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with<V: Serialize>(
        mut self,
        name: impl Into<String>,
        value: V,
    ) -> Result<Self, InputError> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Read `name` as `T`.
    ///
    /// # Errors
    /// - [`InputError::InvalidName`] for a blank name.
    /// - [`InputError::MissingInput`] if nothing is stored under `name`.
    /// - [`InputError::NullNotAllowed`] if the value is null and `T` cannot
    ///   hold null. Nullable types such as `Option<_>` read null successfully.
    /// - [`InputError::TypeMismatch`] if the value does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, InputError> {
        check_name(name)?;
        let value = self
            .values
            .get(name)
            .ok_or_else(|| InputError::MissingInput(name.to_owned()))?;

        if value.is_null() {
            return T::deserialize(&Value::Null)
                .map_err(|_| InputError::NullNotAllowed(name.to_owned(), std::any::type_name::<T>()));
        }

        T::deserialize(value).map_err(|_| InputError::TypeMismatch {
            name: name.to_owned(),
            expected: std::any::type_name::<T>(),
            found: kind_of(value),
        })
    }

    /// Read `name` as `T`, returning `fallback` when the value is missing,
    /// null or of the wrong type. Never fails.
    pub fn get_or_default<T: DeserializeOwned>(&self, name: &str, fallback: T) -> T {
        match self.values.get(name) {
            Some(value) if !value.is_null() && check_name(name).is_ok() => {
                T::deserialize(value).unwrap_or(fallback)
            }
            _ => fallback,
        }
    }

    /// Raw JSON access.
    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every entry of `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: &HandlerInputs) {
        for (name, value) in &other.values {
            if check_name(name).is_ok() {
                self.values.insert(name.clone(), value.clone());
            }
        }
    }

    /// Deserialize the whole bag into a typed input struct.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, InputError> {
        let object: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(Value::Object(object))
            .map_err(|e| InputError::Serialization(e.to_string()))
    }

    /// Build a bag from a typed struct whose fields become the entry names.
    pub fn from_struct<T: Serialize>(value: &T) -> Result<Self, InputError> {
        match serde_json::to_value(value).map_err(|e| InputError::Serialization(e.to_string()))? {
            Value::Object(object) => {
                if object.keys().any(|name| check_name(name).is_err()) {
                    return Err(InputError::InvalidName);
                }
                Ok(Self {
                    values: object.into_iter().collect(),
                })
            }
            _ => Err(InputError::NotAnObject(std::any::type_name::<T>())),
        }
    }
}

impl<'de> Deserialize<'de> for HandlerInputs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = BTreeMap::<String, Value>::deserialize(deserializer)?;
        if let Some(name) = values.keys().find(|name| check_name(name).is_err()) {
            return Err(D::Error::custom(format_args!(
                "{} (got {name:?})",
                InputError::InvalidName
            )));
        }
        Ok(Self { values })
    }
}

impl FromIterator<(String, Value)> for HandlerInputs {
    /// Entries with blank names are dropped.
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .filter(|(name, _)| check_name(name).is_ok())
                .collect(),
        }
    }
}
