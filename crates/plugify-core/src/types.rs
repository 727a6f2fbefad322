// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! The cross-language type model: [`ValueType`], [`Property`], [`Method`].
//!
//! This is the lingua franca that the JIT trampoline builder (`crate::jit`)
//! and the orchestrator's plugin-loading phase (`crate::orchestrator`) both
//! speak: a [`Method`] is a signature any language module can describe its
//! exported functions with, independent of the language that implements
//! them.

use serde::{Deserialize, Serialize};

/// Closed enumeration of cross-language value types.
///
/// Scalars, the fixed-width math aggregates (`vector2/3/4`, `matrix4x4`),
/// and a parallel array-of-T family for each scalar plus `any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Void,
    Bool,
    Char8,
    Char16,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Pointer,
    String,
    Function,
    Vector2,
    Vector3,
    Vector4,
    Matrix4x4,
    Any,

    ArrayBool,
    ArrayChar8,
    ArrayChar16,
    ArrayInt8,
    ArrayInt16,
    ArrayInt32,
    ArrayInt64,
    ArrayUInt8,
    ArrayUInt16,
    ArrayUInt32,
    ArrayUInt64,
    ArrayFloat,
    ArrayDouble,
    ArrayString,
    ArrayAny,
}

impl ValueType {
    /// Scalars that may carry an [`Enum`] annotation on a [`Property`].
    pub fn is_integer_scalar(self) -> bool {
        matches!(
            self,
            ValueType::Int8
                | ValueType::Int16
                | ValueType::Int32
                | ValueType::Int64
                | ValueType::UInt8
                | ValueType::UInt16
                | ValueType::UInt32
                | ValueType::UInt64
        )
    }

    /// Whether this type, when passed or returned by value, exceeds one
    /// pointer-sized slot on every targeted ABI. Only the vector/matrix
    /// aggregates (vector/matrix) are exempt from the
    /// one-pointer-sized-slot rule the JIT builder otherwise enforces.
    pub fn is_wide_aggregate(self) -> bool {
        matches!(self, ValueType::Vector2 | ValueType::Vector3 | ValueType::Vector4 | ValueType::Matrix4x4)
    }
}

/// A named value in an [`Enum`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    pub value: i64,
}

/// An enumeration attachable to an integer-scalar [`Property`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    pub values: Vec<EnumValue>,
}

/// One parameter or return slot of a [`Method`].
///
/// `prototype` may only be set when `value_type == ValueType::Function`;
/// `enumerate` may only be set when `value_type.is_integer_scalar()`. Both
/// invariants are enforced by [`Property::new`] and by
/// [`Method::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub value_type: ValueType,
    #[serde(default)]
    pub by_reference: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prototype: Option<Box<Method>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerate: Option<Enum>,
}

/// Errors raised constructing or validating a [`Property`] or [`Method`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypeModelError {
    #[error("property of type {0:?} may not carry a function prototype")]
    PrototypeOnNonFunction(ValueType),

    #[error("property of type {0:?} may not carry an enum (integer scalars only)")]
    EnumOnNonIntegerScalar(ValueType),

    #[error("method '{0}' has a cyclic prototype reference through '{1}'")]
    CyclicPrototype(String, String),
}

impl Property {
    pub fn new(value_type: ValueType) -> Self {
        Self { value_type, by_reference: false, prototype: None, enumerate: None }
    }

    pub fn by_reference(mut self) -> Self {
        self.by_reference = true;
        self
    }

    pub fn with_prototype(mut self, method: Method) -> Result<Self, TypeModelError> {
        if self.value_type != ValueType::Function {
            return Err(TypeModelError::PrototypeOnNonFunction(self.value_type));
        }
        self.prototype = Some(Box::new(method));
        Ok(self)
    }

    pub fn with_enum(mut self, e: Enum) -> Result<Self, TypeModelError> {
        if !self.value_type.is_integer_scalar() {
            return Err(TypeModelError::EnumOnNonIntegerScalar(self.value_type));
        }
        self.enumerate = Some(e);
        Ok(self)
    }

}

/// 255 means "not variadic".
pub const NOT_VARIADIC: u8 = 255;

/// The canonical cross-language method signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub function_name: String,
    #[serde(default = "default_calling_convention")]
    pub calling_convention: String,
    #[serde(default)]
    pub parameters: Vec<Property>,
    #[serde(rename = "return")]
    pub return_type: Property,
    #[serde(default = "default_variadic_index")]
    pub variadic_index: u8,
}

fn default_calling_convention() -> String {
    "cdecl".to_string()
}

fn default_variadic_index() -> u8 {
    NOT_VARIADIC
}

impl Method {
    pub fn new(name: impl Into<String>, function_name: impl Into<String>, return_type: Property) -> Self {
        Self {
            name: name.into(),
            function_name: function_name.into(),
            calling_convention: default_calling_convention(),
            parameters: Vec::new(),
            return_type,
            variadic_index: NOT_VARIADIC,
        }
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic_index != NOT_VARIADIC
    }

    /// Structural validation: prototype/enum placement and parameter width.
    /// Called from the manifest validation phase (`crate::orchestrator`).
    pub fn validate(&self) -> Result<(), TypeModelError> {
        self.validate_no_cycles(&mut Vec::new())?;
        for p in self.parameters.iter().chain(std::iter::once(&self.return_type)) {
            if p.prototype.is_some() && p.value_type != ValueType::Function {
                return Err(TypeModelError::PrototypeOnNonFunction(p.value_type));
            }
            if p.enumerate.is_some() && !p.value_type.is_integer_scalar() {
                return Err(TypeModelError::EnumOnNonIntegerScalar(p.value_type));
            }
        }
        Ok(())
    }

    fn validate_no_cycles<'a>(&'a self, seen: &mut Vec<&'a str>) -> Result<(), TypeModelError> {
        if seen.iter().any(|n| *n == self.name) {
            return Err(TypeModelError::CyclicPrototype(
                seen.first().copied().unwrap_or(&self.name).to_string(),
                self.name.clone(),
            ));
        }
        seen.push(&self.name);
        for p in self.parameters.iter().chain(std::iter::once(&self.return_type)) {
            if let Some(proto) = &p.prototype {
                proto.validate_no_cycles(seen)?;
            }
        }
        seen.pop();
        Ok(())
    }

    /// Depth-first search through parameter and return-type prototypes for
    /// a method named `name`. Searches parameters before the return type.
    pub fn find_prototype(&self, name: &str) -> Option<&Method> {
        for param in &self.parameters {
            if let Some(proto) = &param.prototype {
                if proto.name == name {
                    return Some(proto);
                }
                if let Some(found) = proto.find_prototype(name) {
                    return Some(found);
                }
            }
        }
        if let Some(proto) = &self.return_type.prototype {
            if proto.name == name {
                return Some(proto);
            }
            if let Some(found) = proto.find_prototype(name) {
                return Some(found);
            }
        }
        None
    }
}

/// Calling convention selected by a [`Method`]'s `calling_convention`
/// string. Unrecognized strings fall back to [`CallingConvention::Host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
    Vectorcall,
    /// The platform's default host convention (System V AMD64 on
    /// Linux/macOS, the Microsoft x64 convention on Windows).
    Host,
}

impl CallingConvention {
    pub fn parse(name: &str) -> Self {
        match name {
            "cdecl" => CallingConvention::Cdecl,
            "stdcall" => CallingConvention::Stdcall,
            "fastcall" => CallingConvention::Fastcall,
            "thiscall" => CallingConvention::Thiscall,
            "vectorcall" => CallingConvention::Vectorcall,
            _ => CallingConvention::Host,
        }
    }
}
