//! Runtime values

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::il::{MetadataToken, MethodToken, TypeSig, TypeToken};

use super::interceptor::{Interceptor, MethodIdentity};

/// An instance of a class. Instances have no fields; they are compared by identity.
#[derive(Debug, Clone)]
pub struct ObjectRef(Arc<ObjectData>);

#[derive(Debug)]
struct ObjectData {
    class: TypeToken,
}

impl ObjectRef {
    pub fn new(class: TypeToken) -> Self {
        Self(Arc::new(ObjectData { class }))
    }

    pub fn class(&self) -> TypeToken {
        self.0.class
    }

    pub fn same(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A fixed-length array, shared by reference.
#[derive(Debug, Clone)]
pub struct ArrayRef {
    elem_type: TypeSig,
    items: Arc<Mutex<Vec<Value>>>,
}

impl ArrayRef {
    pub fn new(elem_type: TypeSig, items: Vec<Value>) -> Self {
        Self {
            elem_type,
            items: Arc::new(Mutex::new(items)),
        }
    }

    pub fn elem_type(&self) -> &TypeSig {
        &self.elem_type
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.lock().get(index).cloned()
    }

    /// Store `value` at `index`; returns `false` when out of bounds.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<Value> {
        self.lock().clone()
    }

    pub fn same(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Value>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A value on the evaluation stack, in a local, or in an array.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(Arc<str>),
    Object(ObjectRef),
    Array(ArrayRef),
    /// A value-type value converted to reference form.
    Boxed(Arc<Value>),
    Token(MetadataToken),
    Function(MethodToken),
    Method(Arc<MethodIdentity>),
    Interceptor(Arc<dyn Interceptor>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn boxed(value: Value) -> Self {
        Value::Boxed(Arc::new(value))
    }

    /// Zero value for a slot of the given type.
    pub fn default_for(ty: &TypeSig) -> Self {
        match ty {
            TypeSig::Bool => Value::Bool(false),
            TypeSig::I32 => Value::I32(0),
            TypeSig::I64 => Value::I64(0),
            TypeSig::F64 => Value::F64(0.0),
            TypeSig::String | TypeSig::Object | TypeSig::ObjectArray | TypeSig::Class(_) => {
                Value::Null
            }
        }
    }

    /// Whether this value may be stored where a reference is expected.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Str(_) | Value::Object(_) | Value::Array(_) | Value::Boxed(_)
        )
    }

    /// Whether this value conforms to `ty` without conversion.
    pub fn fits(&self, ty: &TypeSig) -> bool {
        match (ty, self) {
            (TypeSig::Bool, Value::Bool(_)) => true,
            (TypeSig::I32, Value::I32(_)) => true,
            (TypeSig::I64, Value::I64(_)) => true,
            (TypeSig::F64, Value::F64(_)) => true,
            (TypeSig::String, Value::Null | Value::Str(_)) => true,
            (TypeSig::ObjectArray, Value::Null | Value::Array(_)) => true,
            (TypeSig::Class(_), Value::Null) => true,
            (TypeSig::Class(class), Value::Object(obj)) => obj.class() == *class,
            (TypeSig::Object, v) => v.is_reference(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::F64(_) => "float64",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Boxed(_) => "boxed",
            Value::Token(_) => "token",
            Value::Function(_) => "function",
            Value::Method(_) => "method",
            Value::Interceptor(_) => "interceptor",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&**s),
            _ => None,
        }
    }

    /// The inner value of a boxed value.
    pub fn unboxed(&self) -> Option<&Value> {
        match self {
            Value::Boxed(inner) => Some(inner),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.same(b),
            (Value::Array(a), Value::Array(b)) => a.same(b),
            (Value::Boxed(a), Value::Boxed(b)) => a == b,
            (Value::Token(a), Value::Token(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => a.token == b.token,
            (Value::Interceptor(a), Value::Interceptor(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::I32(v) => write!(f, "I32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Object(o) => write!(f, "Object({})", o.class()),
            Value::Array(a) => f.debug_tuple("Array").field(&a.to_vec()).finish(),
            Value::Boxed(v) => write!(f, "Boxed({:?})", v),
            Value::Token(t) => write!(f, "Token({:?})", t),
            Value::Function(m) => write!(f, "Function({})", m),
            Value::Method(m) => write!(f, "Method({})", m),
            Value::Interceptor(_) => write!(f, "Interceptor(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(o) => write!(f, "object of {}", o.class()),
            Value::Array(a) => {
                let items: Vec<String> = a.to_vec().iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Boxed(v) => write!(f, "{}", v),
            Value::Token(MetadataToken::Type(t)) => write!(f, "{}", t),
            Value::Token(MetadataToken::Method(m)) => write!(f, "{}", m),
            Value::Function(m) => write!(f, "&{}", m),
            Value::Method(m) => write!(f, "{}", m),
            Value::Interceptor(_) => write!(f, "interceptor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits() {
        assert!(Value::I32(1).fits(&TypeSig::I32));
        assert!(!Value::I32(1).fits(&TypeSig::I64));
        assert!(!Value::I32(1).fits(&TypeSig::Object));
        assert!(Value::boxed(Value::I32(1)).fits(&TypeSig::Object));
        assert!(Value::Null.fits(&TypeSig::String));
        let obj = ObjectRef::new(TypeToken(2));
        assert!(Value::Object(obj.clone()).fits(&TypeSig::Class(TypeToken(2))));
        assert!(!Value::Object(obj).fits(&TypeSig::Class(TypeToken(3))));
    }

    #[test]
    fn test_identity_equality() {
        let a = ObjectRef::new(TypeToken(0));
        let b = ObjectRef::new(TypeToken(0));
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a), Value::Object(b));
        assert_eq!(Value::boxed(Value::I32(42)), Value::boxed(Value::I32(42)));
        assert_ne!(Value::boxed(Value::I32(42)), Value::I32(42));
    }

    #[test]
    fn test_array_is_shared() {
        let array = ArrayRef::new(TypeSig::Object, vec![Value::Null; 2]);
        let alias = array.clone();
        assert!(alias.set(1, Value::str("x")));
        assert!(!alias.set(2, Value::Null));
        assert_eq!(array.get(1), Some(Value::str("x")));
        assert_eq!(array.len(), 2);
    }
}
