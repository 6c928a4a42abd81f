use std::{path::PathBuf, rc::Rc};

use indexmap::{IndexMap, IndexSet};

use crate::{
    diagnostics::{Diagnostic, DiagnosticKind, Result},
    environment::{Container, ContainerId, ContainerKind, Heap, Slot, SlotId},
    inheritance::{ClassMember, Conflict},
    runtime::Interpreter,
    value::{format_number, Declared, ListData, ListRef, Mismatch, TypeSpec, Value},
};

pub type NativeFn = fn(&mut Interpreter, &[Value]) -> Result<Value>;

#[derive(Debug, Default)]
pub struct ClassData {
    pub parents: Vec<ContainerId>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub declared: Declared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncLang {
    Ditlang,
    Guest(ContainerId),
}

#[derive(Debug)]
pub struct FuncData {
    pub params: Vec<Param>,
    /// `None` for `void`.
    pub ret: Option<Declared>,
    pub lang: FuncLang,
    pub guest_path: Option<PathBuf>,
    pub native: Option<NativeFn>,
}

impl FuncData {
    pub fn new(params: Vec<Param>, ret: Option<Declared>, lang: FuncLang) -> Self {
        Self {
            params,
            ret,
            lang,
            guest_path: None,
            native: None,
        }
    }
}

/// Result of a `.name` step on a container value.
#[derive(Debug, Clone, PartialEq)]
pub enum Member {
    Slot(SlotId),
    /// Found on the class chain of an instance; writes copy it into the instance under `key`.
    Inherited {
        slot: SlotId,
        instance: ContainerId,
        key: String,
    },
    /// The name of an ancestor class, so the next step is qualified by it.
    Qualifier {
        base: Value,
        class: ContainerId,
    },
}

impl Heap {
    /// Registers `name` in `owner`. Fails if the name already exists there.
    pub fn declare(
        &mut self,
        owner: ContainerId,
        name: &str,
        declared: Declared,
    ) -> std::result::Result<SlotId, Diagnostic> {
        if self.find_local(owner, name).is_some() {
            return Err(Diagnostic::syntax(format!(
                "'{name}' has already been declared"
            )));
        }
        let slot = self.new_slot(Slot::new(name, declared));
        let class = matches!(self.container(owner).kind, ContainerKind::Class(_));
        if class {
            self.record_override_conflicts(owner, name);
        }
        self.container_mut(owner).attrs.insert(name.to_string(), slot);
        if class {
            self.invalidate_ancestry();
        }
        Ok(slot)
    }

    pub fn assign(&mut self, slot: SlotId, value: Value) -> std::result::Result<(), Diagnostic> {
        let (declared, generic) = {
            let target = self.slot(slot);
            (target.declared, target.generic)
        };
        if generic {
            self.slot_mut(slot).value = value;
            return Ok(());
        }
        if let Some(mismatch) = self.check_value(&value, &declared) {
            return Err(Diagnostic::type_mismatch(mismatch.to_string()));
        }
        let merge = match (&self.slot(slot).value, &value) {
            (Value::Lang(old), Value::Lang(new)) if !declared.list && old != new => {
                Some((*old, *new))
            }
            _ => None,
        };
        let value = match merge {
            Some((old, new)) => Value::Lang(self.merge_langs(old, new)),
            None => value,
        };
        let value = match value {
            // an untyped list commits to the slot's element type; a shared one
            // is copied so its other holders keep their own typing
            Value::List(list)
                if declared.list
                    && declared.ty != TypeSpec::Thing
                    && list.borrow().elem == TypeSpec::Thing =>
            {
                if Rc::strong_count(&list) == 1 {
                    list.borrow_mut().elem = declared.ty;
                    Value::List(list)
                } else {
                    let items = list.borrow().items.clone();
                    Value::list(declared.ty, items)
                }
            }
            other => other,
        };
        self.slot_mut(slot).value = value;
        Ok(())
    }

    /// `None` when `value` may live in a slot declared as `declared`.
    pub fn check_value(&self, value: &Value, declared: &Declared) -> Option<Mismatch> {
        if value.is_null() || declared.is_generic() {
            return None;
        }
        match value {
            Value::List(list) if declared.list => self.check_list(&list.borrow(), declared.ty),
            _ if declared.list || matches!(value, Value::List(_)) => Some(Mismatch::Value {
                expected: self.declared_label(declared),
                actual: self.value_label(value),
            }),
            _ if self.scalar_fits(value, declared.ty) => None,
            _ => Some(Mismatch::Value {
                expected: self.declared_label(declared),
                actual: self.value_label(value),
            }),
        }
    }

    /// Nested lists are allowed at any depth; their leaves are held to `elem`.
    pub fn check_list(&self, list: &ListData, elem: TypeSpec) -> Option<Mismatch> {
        if elem == TypeSpec::Thing {
            return None;
        }
        if list.elem != TypeSpec::Thing && !self.elem_fits(list.elem, elem) {
            return Some(Mismatch::Element {
                expected: self.type_label(elem),
                actual: self.type_label(list.elem),
            });
        }
        for item in &list.items {
            match item {
                Value::Null => continue,
                Value::List(nested) => {
                    if let Some(mismatch) = self.check_list(&nested.borrow(), elem) {
                        return Some(mismatch);
                    }
                }
                other if !self.scalar_fits(other, elem) => {
                    return Some(Mismatch::Element {
                        expected: self.type_label(elem),
                        actual: self.value_label(other),
                    });
                }
                _ => {}
            }
        }
        None
    }

    pub fn append(&self, list: &ListRef, value: Value) -> std::result::Result<(), Diagnostic> {
        if let Value::List(inner) = &value {
            if Rc::ptr_eq(inner, list) || list_contains(inner, list) {
                return Err(Diagnostic::type_mismatch("A list cannot contain itself"));
            }
        }
        let elem = list.borrow().elem;
        if elem != TypeSpec::Thing {
            let fits = match &value {
                Value::Null => true,
                Value::List(inner) => self.check_list(&inner.borrow(), elem).is_none(),
                other => self.scalar_fits(other, elem),
            };
            if !fits {
                return Err(Diagnostic::type_mismatch(format!(
                    "List of type '{}' cannot contain '{}'",
                    self.type_label(elem),
                    self.value_label(&value)
                )));
            }
        }
        list.borrow_mut().items.push(value);
        Ok(())
    }

    fn scalar_fits(&self, value: &Value, ty: TypeSpec) -> bool {
        match (ty, value) {
            (TypeSpec::Thing, _) => true,
            (TypeSpec::Str, Value::Str(_))
            | (TypeSpec::Bool, Value::Bool(_))
            | (TypeSpec::Num, Value::Num(_))
            | (TypeSpec::Json, Value::Json(_))
            | (TypeSpec::Class, Value::Class(_))
            | (TypeSpec::Instance, Value::Instance(_))
            | (TypeSpec::Func, Value::Func(_))
            | (TypeSpec::Dit, Value::Dit(_))
            | (TypeSpec::Lang, Value::Lang(_)) => true,
            (TypeSpec::Of(class), Value::Instance(instance)) => self
                .class_of(*instance)
                .is_some_and(|own| self.is_subclass(own, class)),
            _ => false,
        }
    }

    fn elem_fits(&self, have: TypeSpec, want: TypeSpec) -> bool {
        match (have, want) {
            (TypeSpec::Of(sub), TypeSpec::Of(sup)) => self.is_subclass(sub, sup),
            (TypeSpec::Of(_), TypeSpec::Instance) => true,
            _ => have == want,
        }
    }

    pub fn class_of(&self, instance: ContainerId) -> Option<ContainerId> {
        match self.container(instance).kind {
            ContainerKind::Instance { class } => Some(class),
            _ => None,
        }
    }

    pub fn type_label(&self, ty: TypeSpec) -> String {
        match ty {
            TypeSpec::Thing => "Thing".into(),
            TypeSpec::Str => "Str".into(),
            TypeSpec::Bool => "Bool".into(),
            TypeSpec::Num => "Num".into(),
            TypeSpec::Json => "JSON".into(),
            TypeSpec::Class => "Class".into(),
            TypeSpec::Instance => "Instance".into(),
            TypeSpec::Func => "Func".into(),
            TypeSpec::Dit => "Dit".into(),
            TypeSpec::Lang => "Lang".into(),
            TypeSpec::Of(class) => self.name_of(class).to_string(),
        }
    }

    pub fn declared_label(&self, declared: &Declared) -> String {
        if declared.list {
            format!("listOf {}", self.type_label(declared.ty))
        } else {
            self.type_label(declared.ty)
        }
    }

    /// Variant name, or the class name for instances.
    pub fn value_label(&self, value: &Value) -> String {
        match value {
            Value::Instance(id) => match self.class_of(*id) {
                Some(class) => self.name_of(class).to_string(),
                None => "Instance".into(),
            },
            other => other.type_name().to_string(),
        }
    }

    pub fn new_instance(&mut self, class: ContainerId) -> ContainerId {
        let name = self.container(class).name.clone();
        self.alloc(Container::new(name, ContainerKind::Instance { class }, None))
    }

    /// Looks up `name` on a container value. `qualifier` routes the lookup to a
    /// named ancestor class after `base.Ancestor`.
    pub fn member(
        &self,
        base: &Value,
        qualifier: Option<ContainerId>,
        name: &str,
    ) -> std::result::Result<Member, Diagnostic> {
        match base {
            Value::Dit(id) | Value::Lang(id) | Value::Func(id) => {
                self.find_local(*id, name).map(Member::Slot).ok_or_else(|| {
                    Diagnostic::syntax(format!(
                        "'{name}' is not an attribute of {} '{}'",
                        base.type_name(),
                        self.name_of(*id)
                    ))
                })
            }
            Value::Class(id) => {
                let target = qualifier.unwrap_or(*id);
                match self.class_member(target, name)? {
                    ClassMember::Slot(slot) => Ok(Member::Slot(slot)),
                    ClassMember::Qualifier(class) => Ok(Member::Qualifier {
                        base: base.clone(),
                        class,
                    }),
                    ClassMember::Missing => Err(Diagnostic::syntax(format!(
                        "'{name}' is not an attribute of class '{}'",
                        self.name_of(target)
                    ))),
                }
            }
            Value::Instance(id) => {
                let key = match qualifier {
                    Some(class) => format!("{}.{name}", self.name_of(class)),
                    None => name.to_string(),
                };
                if let Some(slot) = self.container(*id).attrs.get(&key) {
                    return Ok(Member::Slot(*slot));
                }
                let class = self.class_of(*id).ok_or_else(|| {
                    Diagnostic::critical(format!("Instance '{}' has no class", self.name_of(*id)))
                })?;
                let target = qualifier.unwrap_or(class);
                match self.class_member(target, name)? {
                    ClassMember::Slot(slot) => Ok(Member::Inherited {
                        slot,
                        instance: *id,
                        key,
                    }),
                    ClassMember::Qualifier(ancestor) => Ok(Member::Qualifier {
                        base: base.clone(),
                        class: ancestor,
                    }),
                    ClassMember::Missing => Err(Diagnostic::syntax(format!(
                        "'{name}' is not an attribute of '{}' instance",
                        self.name_of(class)
                    ))),
                }
            }
            Value::Null => Err(Diagnostic::syntax(format!(
                "Cannot read '{name}' of null"
            ))),
            other => Err(Diagnostic::syntax(format!(
                "'{}' values have no attributes, tried to read '{name}'",
                other.type_name()
            ))),
        }
    }

    /// Copies an inherited slot into the instance so writes stay local to it.
    pub fn materialize(&mut self, instance: ContainerId, key: &str, template: SlotId) -> SlotId {
        if let Some(slot) = self.container(instance).attrs.get(key) {
            return *slot;
        }
        let mut copy = self.slot(template).clone();
        copy.name = key.to_string();
        let slot = self.new_slot(copy);
        self.container_mut(instance).attrs.insert(key.to_string(), slot);
        slot
    }

    pub fn priority(&self, lang: ContainerId) -> f64 {
        match self.find_local(lang, "priority").map(|slot| self.value(slot)) {
            Some(Value::Num(priority)) => *priority,
            _ => 0.0,
        }
    }

    /// Names only one side has are kept; shared names go to the higher priority,
    /// ties to `right`.
    pub fn merge_langs(&mut self, left: ContainerId, right: ContainerId) -> ContainerId {
        let right_wins = self.priority(left) <= self.priority(right);
        let names: IndexSet<String> = self
            .container(left)
            .attrs
            .keys()
            .chain(self.container(right).attrs.keys())
            .cloned()
            .collect();
        let chosen: Vec<(String, SlotId)> = names
            .into_iter()
            .filter_map(|name| {
                let from_left = self.container(left).attrs.get(&name).copied();
                let from_right = self.container(right).attrs.get(&name).copied();
                let slot = match (from_left, from_right) {
                    (Some(_), Some(r)) if right_wins => r,
                    (Some(l), _) => l,
                    (None, Some(r)) => r,
                    (None, None) => return None,
                };
                Some((name, slot))
            })
            .collect();
        let name = self.container(left).name.clone();
        let scope = self.container(left).scope;
        let mut merged = Container::new(name, ContainerKind::Lang, scope);
        for (name, slot) in chosen {
            let copy = self.slot(slot).clone();
            merged.attrs.insert(name, self.new_slot(copy));
        }
        self.alloc(merged)
    }

    /// A string-valued Lang property, failing when absent or null.
    pub fn lang_prop(&self, lang: ContainerId, prop: &str) -> std::result::Result<String, Diagnostic> {
        self.lang_prop_opt(lang, prop).ok_or_else(|| {
            Diagnostic::new(
                DiagnosticKind::MissingProp,
                format!(
                    "Lang '{}' is missing required property '{prop}'",
                    self.name_of(lang)
                ),
            )
        })
    }

    pub fn lang_prop_opt(&self, lang: ContainerId, prop: &str) -> Option<String> {
        match self.value(self.find_local(lang, prop)?) {
            Value::Str(text) => Some(text.clone()),
            Value::Func(func) => self
                .container(*func)
                .body
                .as_ref()
                .map(|body| body.view.text().to_string()),
            Value::Num(number) => Some(format_number(*number)),
            _ => None,
        }
    }

    pub fn render(&self, value: &Value) -> String {
        match value {
            Value::Str(text) => text.clone(),
            other => self.render_nested(other),
        }
    }

    fn render_nested(&self, value: &Value) -> String {
        match value {
            Value::Null => "null".into(),
            Value::Str(text) => format!("\"{text}\""),
            Value::Bool(flag) => flag.to_string(),
            Value::Num(number) => format_number(*number),
            Value::List(list) => {
                let items: Vec<String> = list
                    .borrow()
                    .items
                    .iter()
                    .map(|item| self.render_nested(item))
                    .collect();
                format!("[{}]", items.join(", "))
            }
            Value::Json(map) => {
                let entries: Vec<String> = map
                    .borrow()
                    .iter()
                    .map(|(key, item)| format!("\"{key}\": {}", self.render_nested(item)))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Class(id) => format!("<class {}>", self.name_of(*id)),
            Value::Instance(id) => format!("<{} instance>", self.value_label(&Value::Instance(*id))),
            Value::Func(id) => format!("<func {}>", self.name_of(*id)),
            Value::Dit(id) => format!("<dit {}>", self.name_of(*id)),
            Value::Lang(id) => format!("<lang {}>", self.name_of(*id)),
        }
    }

    pub fn to_json(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Str(text) => serde_json::Value::String(text.clone()),
            Value::Bool(flag) => serde_json::Value::Bool(*flag),
            Value::Num(number) => serde_json::Number::from_f64(*number)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::List(list) => serde_json::Value::Array(
                list.borrow().items.iter().map(|item| self.to_json(item)).collect(),
            ),
            Value::Json(map) => serde_json::Value::Object(
                map.borrow()
                    .iter()
                    .map(|(key, item)| (key.clone(), self.to_json(item)))
                    .collect(),
            ),
            other => serde_json::Value::String(self.render(other)),
        }
    }
}

pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(flag) => Value::Bool(*flag),
        serde_json::Value::Number(number) => Value::Num(number.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(text) => Value::Str(text.clone()),
        serde_json::Value::Array(items) => {
            Value::list(TypeSpec::Thing, items.iter().map(from_json).collect())
        }
        serde_json::Value::Object(entries) => Value::json(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), from_json(item)))
                .collect::<IndexMap<_, _>>(),
        ),
    }
}

fn list_contains(haystack: &ListRef, needle: &ListRef) -> bool {
    haystack.borrow().items.iter().any(|item| match item {
        Value::List(inner) => Rc::ptr_eq(inner, needle) || list_contains(inner, needle),
        _ => false,
    })
}
