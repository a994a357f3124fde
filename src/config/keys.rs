use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// Typed, named configuration declaration.
///
/// Defaults are produced by plain functions so keys can be declared as
/// constants next to the entity or policy that reads them.
pub struct ConfigKey<T> {
    name: &'static str,
    description: &'static str,
    default: Option<fn() -> Value>,
    required: bool,
    secret: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ConfigKey<T> {
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            default: None,
            required: false,
            secret: false,
            _marker: PhantomData,
        }
    }

    pub const fn with_default(self, default: fn() -> Value) -> Self {
        Self {
            name: self.name,
            description: self.description,
            default: Some(default),
            required: self.required,
            secret: self.secret,
            _marker: PhantomData,
        }
    }

    pub const fn required(self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            default: self.default,
            required: true,
            secret: self.secret,
            _marker: PhantomData,
        }
    }

    /// Value is a credential: bound as usual, masked in read-only projections
    pub const fn secret(self) -> Self {
        Self {
            name: self.name,
            description: self.description,
            default: self.default,
            required: self.required,
            secret: true,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    pub fn default_value(&self) -> Option<Value> {
        self.default.map(|f| f())
    }
}

impl<T: DeserializeOwned> ConfigKey<T> {
    /// Type-erased view used when binding a flag bag
    pub fn decl(&self) -> KeyDecl {
        KeyDecl {
            name: self.name,
            default: self.default,
            required: self.required,
            secret: self.secret,
            type_name: std::any::type_name::<T>(),
            accepts: accepts::<T>,
        }
    }

    pub(crate) fn decode(&self, value: &Value) -> Option<T> {
        if value.is_null() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

impl<T> Clone for ConfigKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ConfigKey<T> {}

impl<T> fmt::Debug for ConfigKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigKey")
            .field("name", &self.name)
            .field("required", &self.required)
            .finish()
    }
}

fn accepts<T: DeserializeOwned>(value: &Value) -> bool {
    serde_json::from_value::<T>(value.clone()).is_ok()
}

/// Declaration of a key without its static type
#[derive(Clone, Copy)]
pub struct KeyDecl {
    pub(crate) name: &'static str,
    pub(crate) default: Option<fn() -> Value>,
    pub(crate) required: bool,
    pub(crate) secret: bool,
    pub(crate) type_name: &'static str,
    pub(crate) accepts: fn(&Value) -> bool,
}

impl KeyDecl {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for KeyDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDecl")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .field("required", &self.required)
            .finish()
    }
}
