//! Values crossing the host/script boundary and argument marshaling.
//!
//! Every argument crosses as a triple: a type tag, a primitive-or-handle
//! value, and (for objects) the class path. Object-typed arguments are
//! swapped for an identity-table handle before crossing, allocating one
//! if the object has never been seen.

use std::any::Any;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::identity::IdentityTable;

/// Integer identity a host object carries on the script side.
pub type ObjectHandle = i32;

/// A host object that may be shared with the script engine.
///
/// Implementors must be thread-safe: the object can be touched from any
/// caller thread and from the instance's affinity thread.
pub trait HostObject: Any + Send + Sync {
    /// Fully qualified class path, e.g. `app.media.AudioTrack`.
    fn class_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Wire type id, the first element of each packaged triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Void,
    Null,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    String,
    Object,
}

/// A host-side call argument or result.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    String(String),
    Object(Arc<dyn HostObject>),
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Byte(_) => TypeTag::Byte,
            Value::Short(_) => TypeTag::Short,
            Value::Int(_) => TypeTag::Int,
            Value::Long(_) => TypeTag::Long,
            Value::Float(_) => TypeTag::Float,
            Value::Double(_) => TypeTag::Double,
            Value::Char(_) => TypeTag::Char,
            Value::String(_) => TypeTag::String,
            Value::Object(_) => TypeTag::Object,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Byte(v) => write!(f, "Byte({})", v),
            Value::Short(v) => write!(f, "Short({})", v),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Long(v) => write!(f, "Long({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Char(v) => write!(f, "Char({:?})", v),
            Value::String(v) => write!(f, "String({:?})", v),
            Value::Object(obj) => write!(f, "Object({})", obj.class_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => host_object_key(a) == host_object_key(b),
            _ => false,
        }
    }
}

/// Pointer identity of a host object, used as the object→handle map key.
pub(crate) fn host_object_key(obj: &Arc<dyn HostObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

/// The primitive-or-handle slot of a packaged triple.
#[derive(Debug, Clone, PartialEq)]
pub enum PackagedValue {
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    String(String),
    Handle(ObjectHandle),
}

/// One marshaled argument: `(type tag, primitive-or-handle, class path)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedArg {
    pub tag: TypeTag,
    pub value: PackagedValue,
    pub class_path: Option<String>,
}

/// Package arguments for crossing into the engine.
///
/// Object arguments receive a handle from the identity table, allocating
/// a strong one if the object has not crossed before.
pub fn package_args(table: &IdentityTable, args: &[Value]) -> Vec<PackagedArg> {
    args.iter().map(|arg| package_value(table, arg)).collect()
}

fn package_value(table: &IdentityTable, arg: &Value) -> PackagedArg {
    let (value, class_path) = match arg {
        Value::Null => (PackagedValue::Empty, None),
        Value::Bool(v) => (PackagedValue::Bool(*v), None),
        Value::Byte(v) => (PackagedValue::Int(*v as i64), None),
        Value::Short(v) => (PackagedValue::Int(*v as i64), None),
        Value::Int(v) => (PackagedValue::Int(*v as i64), None),
        Value::Long(v) => (PackagedValue::Int(*v), None),
        Value::Float(v) => (PackagedValue::Float(*v as f64), None),
        Value::Double(v) => (PackagedValue::Float(*v), None),
        Value::Char(v) => (PackagedValue::Char(*v), None),
        Value::String(v) => (PackagedValue::String(v.clone()), None),
        Value::Object(obj) => {
            let handle = table.get_or_allocate(obj);
            (
                PackagedValue::Handle(handle),
                Some(obj.class_name().to_string()),
            )
        }
    };

    PackagedArg {
        tag: arg.type_tag(),
        value,
        class_path,
    }
}

/// Reverse of [`package_args`], used on the engine side of the boundary.
///
/// Handles resolve through the same identity table; a handle whose weak
/// target has been collected reports [`BridgeError::CollectedHandle`],
/// an unknown handle reports [`BridgeError::ObjectNotFound`].
pub fn unpackage_args(
    table: &IdentityTable,
    args: &[PackagedArg],
) -> Result<Vec<Value>, BridgeError> {
    args.iter().map(|arg| unpackage_value(table, arg)).collect()
}

fn unpackage_value(table: &IdentityTable, arg: &PackagedArg) -> Result<Value, BridgeError> {
    let value = match (&arg.tag, &arg.value) {
        (TypeTag::Null, _) | (TypeTag::Void, _) => Value::Null,
        (TypeTag::Bool, PackagedValue::Bool(v)) => Value::Bool(*v),
        (TypeTag::Byte, PackagedValue::Int(v)) => Value::Byte(*v as i8),
        (TypeTag::Short, PackagedValue::Int(v)) => Value::Short(*v as i16),
        (TypeTag::Int, PackagedValue::Int(v)) => Value::Int(*v as i32),
        (TypeTag::Long, PackagedValue::Int(v)) => Value::Long(*v),
        (TypeTag::Float, PackagedValue::Float(v)) => Value::Float(*v as f32),
        (TypeTag::Double, PackagedValue::Float(v)) => Value::Double(*v),
        (TypeTag::Char, PackagedValue::Char(v)) => Value::Char(*v),
        (TypeTag::String, PackagedValue::String(v)) => Value::String(v.clone()),
        (TypeTag::Object, PackagedValue::Handle(handle)) => Value::Object(table.lookup(*handle)?),
        (tag, value) => {
            return Err(BridgeError::InvalidArgument(format!(
                "packaged value {:?} does not match tag {:?}",
                value, tag
            )))
        }
    };

    Ok(value)
}
