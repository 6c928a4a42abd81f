use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{
    environment::ContainerId,
    grammar::{Primitive, ValueKind},
};

pub type ListRef = Rc<RefCell<ListData>>;
pub type JsonRef = Rc<RefCell<IndexMap<String, Value>>>;

/// A list and the element type it has committed to. `TypeSpec::Thing` accepts anything.
#[derive(Debug, Clone, PartialEq)]
pub struct ListData {
    pub elem: TypeSpec,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Str(String),
    Bool(bool),
    Num(f64),
    List(ListRef),
    Json(JsonRef),
    Class(ContainerId),
    Instance(ContainerId),
    Func(ContainerId),
    Dit(ContainerId),
    Lang(ContainerId),
}

impl Value {
    pub fn str(text: impl Into<String>) -> Self {
        Value::Str(text.into())
    }

    pub fn list(elem: TypeSpec, items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(ListData { elem, items })))
    }

    pub fn json(entries: IndexMap<String, Value>) -> Self {
        Value::Json(Rc::new(RefCell::new(entries)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn container(&self) -> Option<ContainerId> {
        match self {
            Value::Class(id)
            | Value::Instance(id)
            | Value::Func(id)
            | Value::Dit(id)
            | Value::Lang(id) => Some(*id),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        Some(match self {
            Value::Null => return None,
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::Num(_) => ValueKind::Num,
            Value::List(_) => ValueKind::List,
            Value::Json(_) => ValueKind::Json,
            Value::Class(_) => ValueKind::Class,
            Value::Instance(_) => ValueKind::Instance,
            Value::Func(_) => ValueKind::Func,
            Value::Dit(_) => ValueKind::Dit,
            Value::Lang(_) => ValueKind::Lang,
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Str(_) => "Str",
            Value::Bool(_) => "Bool",
            Value::Num(_) => "Num",
            Value::List(_) => "List",
            Value::Json(_) => "JSON",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::Func(_) => "Func",
            Value::Dit(_) => "Dit",
            Value::Lang(_) => "Lang",
        }
    }
}

/// The declared type of a slot, parameter or list element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSpec {
    Thing,
    Str,
    Bool,
    Num,
    Json,
    Class,
    Instance,
    Func,
    Dit,
    Lang,
    /// Instances of this class or any subclass.
    Of(ContainerId),
}

impl From<Primitive> for TypeSpec {
    fn from(primitive: Primitive) -> Self {
        match primitive {
            Primitive::Thing => TypeSpec::Thing,
            Primitive::Str => TypeSpec::Str,
            Primitive::Bool => TypeSpec::Bool,
            Primitive::Num => TypeSpec::Num,
            Primitive::Json => TypeSpec::Json,
            Primitive::Class => TypeSpec::Class,
            Primitive::Instance => TypeSpec::Instance,
            Primitive::Func => TypeSpec::Func,
            Primitive::Dit => TypeSpec::Dit,
            Primitive::Lang => TypeSpec::Lang,
        }
    }
}

impl TypeSpec {
    pub fn value_kind(self) -> ValueKind {
        match self {
            TypeSpec::Thing => ValueKind::Thing,
            TypeSpec::Str => ValueKind::Str,
            TypeSpec::Bool => ValueKind::Bool,
            TypeSpec::Num => ValueKind::Num,
            TypeSpec::Json => ValueKind::Json,
            TypeSpec::Class => ValueKind::Class,
            TypeSpec::Instance | TypeSpec::Of(_) => ValueKind::Instance,
            TypeSpec::Func => ValueKind::Func,
            TypeSpec::Dit => ValueKind::Dit,
            TypeSpec::Lang => ValueKind::Lang,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Declared {
    pub ty: TypeSpec,
    pub list: bool,
}

impl Declared {
    pub const THING: Declared = Declared::scalar(TypeSpec::Thing);

    pub const fn scalar(ty: TypeSpec) -> Self {
        Self { ty, list: false }
    }

    pub const fn list_of(ty: TypeSpec) -> Self {
        Self { ty, list: true }
    }

    /// A scalar `Thing` slot may be rebound to any variant.
    pub fn is_generic(&self) -> bool {
        self.ty == TypeSpec::Thing && !self.list
    }
}

/// Why a value was rejected by a declared type. Names are already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Value { expected: String, actual: String },
    Element { expected: String, actual: String },
}

impl Mismatch {
    pub fn expected(&self) -> &str {
        match self {
            Mismatch::Value { expected, .. } | Mismatch::Element { expected, .. } => expected,
        }
    }

    pub fn actual(&self) -> &str {
        match self {
            Mismatch::Value { actual, .. } | Mismatch::Element { actual, .. } => actual,
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Value { expected, actual } => {
                write!(f, "Cannot assign {actual} to {expected}")
            }
            Mismatch::Element { expected, actual } => {
                write!(f, "List of type '{expected}' contained '{actual}'")
            }
        }
    }
}

pub fn format_number(number: f64) -> String {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        format!("{number}")
    }
}
