// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Values and receiver objects as seen by the scheduler.
//!
//! The real value model and type system live outside this crate. The core
//! only needs to call an object's dispatch entry point, ask whether a
//! type and method are isolated, and evaluate default arguments.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::DomainError;
use crate::strand::Strand;

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    List(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Nil => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::String(_) => TypeTag::String,
            Value::List(_) => TypeTag::List,
            Value::Object(o) => TypeTag::Object(o.object_type().name.clone()),
        }
    }
}

/// Expected result type carried on a future. Not checked here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeTag {
    #[default]
    Any,
    Nil,
    Boolean,
    Int,
    Float,
    String,
    List,
    Object(String),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Any => write!(f, "any"),
            TypeTag::Nil => write!(f, "()"),
            TypeTag::Boolean => write!(f, "boolean"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::String => write!(f, "string"),
            TypeTag::List => write!(f, "list"),
            TypeTag::Object(name) => write!(f, "{}", name),
        }
    }
}

/// Default-value expression for an omitted parameter.
///
/// Receives the strand it runs on and the arguments resolved so far, so
/// later defaults may depend on earlier parameters.
pub type DefaultValue = Arc<dyn Fn(&Strand, &[Value]) -> Result<Value, DomainError> + Send + Sync>;

/// A declared method parameter.
#[derive(Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<DefaultValue>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default<F>(name: impl Into<String>, default: F) -> Self
    where
        F: Fn(&Strand, &[Value]) -> Result<Value, DomainError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            default: Some(Arc::new(default)),
        }
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// Method signature as far as dispatch cares.
#[derive(Debug, Clone)]
pub struct MethodType {
    pub name: String,
    pub isolated: bool,
    pub params: Vec<Param>,
    /// Trailing rest parameter: extra arguments are accepted as-is.
    pub rest: bool,
}

impl MethodType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolated: false,
            params: Vec::new(),
            rest: false,
        }
    }

    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }
}

/// Object type metadata: type-level isolation plus the method table.
#[derive(Debug, Clone)]
pub struct ObjectType {
    pub name: String,
    pub isolated: bool,
    methods: IndexMap<String, MethodType>,
}

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            isolated: false,
            methods: IndexMap::new(),
        }
    }

    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    pub fn method(mut self, method: MethodType) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Unknown methods are never isolated.
    pub fn is_method_isolated(&self, method: &str) -> bool {
        self.methods.get(method).is_some_and(|m| m.isolated)
    }

    pub fn get_method(&self, method: &str) -> Option<&MethodType> {
        self.methods.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodType> {
        self.methods.values()
    }
}

/// A receiver object. Implemented by the language's object representation.
pub trait RuntimeObject: Send + Sync {
    fn object_type(&self) -> &ObjectType;

    /// The object's own dispatch entry point.
    fn call(&self, strand: &Strand, method: &str, args: &[Value]) -> Result<Value, DomainError>;
}

/// Stable identity token for a receiver, assigned once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ObjectCell {
    pub(crate) id: ObjectId,
    object: Box<dyn RuntimeObject>,
}

/// Shared handle to a receiver. Clones refer to the same object.
#[derive(Clone)]
pub struct ObjectRef {
    pub(crate) cell: Arc<ObjectCell>,
}

impl ObjectRef {
    pub fn new(object: impl RuntimeObject + 'static) -> Self {
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            cell: Arc::new(ObjectCell {
                id,
                object: Box::new(object),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.cell.id
    }

    pub fn object_type(&self) -> &ObjectType {
        self.cell.object.object_type()
    }

    pub fn call(
        &self,
        strand: &Strand,
        method: &str,
        args: &[Value],
    ) -> Result<Value, DomainError> {
        self.cell.object.call(strand, method, args)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.cell.id)
            .field("type", &self.object_type().name)
            .finish()
    }
}
