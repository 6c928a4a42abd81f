use std::{cell::RefCell, collections::HashMap, rc::Rc};

use indexmap::IndexMap;

use crate::{
    diagnostics::{CodeLocation, Diagnostic},
    grammar::ValueKind,
    inheritance::Ancestry,
    lexer::{Resolved, SourceView, SymbolResolver},
    object::{ClassData, FuncData},
    value::{Declared, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

/// A named, typed home for one value.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub declared: Declared,
    pub generic: bool,
    pub value: Value,
}

impl Slot {
    pub fn new(name: impl Into<String>, declared: Declared) -> Self {
        Self {
            name: name.into(),
            declared,
            generic: declared.is_generic(),
            value: Value::Null,
        }
    }

    /// What a token naming this slot should be classified as.
    pub fn kind(&self) -> ValueKind {
        match self.value.kind() {
            Some(kind) => kind,
            None if self.declared.list => ValueKind::List,
            None => self.declared.ty.value_kind(),
        }
    }
}

#[derive(Debug)]
pub enum ContainerKind {
    Prelude,
    Dit,
    Class(ClassData),
    Instance { class: ContainerId },
    Func(FuncData),
    Lang,
    /// One activation of a function.
    Frame { func: ContainerId },
}

/// Source backing for containers that are written as code.
#[derive(Debug, Clone)]
pub struct BodySource {
    pub path: Rc<str>,
    pub view: SourceView,
    pub def_loc: CodeLocation,
    pub interpreted: bool,
}

#[derive(Debug)]
pub struct Container {
    pub name: Option<String>,
    pub kind: ContainerKind,
    pub attrs: IndexMap<String, SlotId>,
    /// Names bound by reference to slots owned by another container.
    pub aliases: IndexMap<String, SlotId>,
    /// Lexical parent for name lookup.
    pub scope: Option<ContainerId>,
    pub body: Option<BodySource>,
}

impl Container {
    pub fn new(name: Option<String>, kind: ContainerKind, scope: Option<ContainerId>) -> Self {
        Self {
            name,
            kind,
            attrs: IndexMap::new(),
            aliases: IndexMap::new(),
            scope,
            body: None,
        }
    }

    pub fn with_body(mut self, body: BodySource) -> Self {
        self.body = Some(body);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// Arena owning every container and slot of one interpreter.
#[derive(Debug, Default)]
pub struct Heap {
    containers: Vec<Container>,
    slots: Vec<Slot>,
    pub(crate) ancestry: RefCell<HashMap<ContainerId, Rc<Ancestry>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, container: Container) -> ContainerId {
        self.containers.push(container);
        ContainerId(self.containers.len() - 1)
    }

    pub fn container(&self, id: ContainerId) -> &Container {
        &self.containers[id.0]
    }

    pub fn container_mut(&mut self, id: ContainerId) -> &mut Container {
        &mut self.containers[id.0]
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.0]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id.0]
    }

    pub fn new_slot(&mut self, slot: Slot) -> SlotId {
        self.slots.push(slot);
        SlotId(self.slots.len() - 1)
    }

    pub fn name_of(&self, id: ContainerId) -> &str {
        self.container(id).display_name()
    }

    /// Own attributes first, then aliases.
    pub fn find_local(&self, id: ContainerId, name: &str) -> Option<SlotId> {
        let container = self.container(id);
        container
            .attrs
            .get(name)
            .or_else(|| container.aliases.get(name))
            .copied()
    }

    /// Walks the lexical scope chain outward; first match wins.
    pub fn find_in_scope(&self, id: ContainerId, name: &str) -> Option<SlotId> {
        let mut current = Some(id);
        while let Some(scope) = current {
            if let Some(slot) = self.find_local(scope, name) {
                return Some(slot);
            }
            current = self.container(scope).scope;
        }
        None
    }

    pub fn insert_alias(
        &mut self,
        id: ContainerId,
        name: &str,
        slot: SlotId,
    ) -> Result<(), Diagnostic> {
        if self.find_local(id, name).is_some() {
            return Err(Diagnostic::syntax(format!(
                "'{name}' has already been declared"
            )));
        }
        self.container_mut(id).aliases.insert(name.to_string(), slot);
        Ok(())
    }

    pub fn value(&self, slot: SlotId) -> &Value {
        &self.slot(slot).value
    }

    pub fn resolver(&self, body: ContainerId) -> ScopeResolver<'_> {
        ScopeResolver { heap: self, body }
    }

    pub(crate) fn invalidate_ancestry(&self) {
        self.ancestry.borrow_mut().clear();
    }
}

/// Resolves words against a body and its enclosing scopes.
pub struct ScopeResolver<'h> {
    heap: &'h Heap,
    body: ContainerId,
}

impl SymbolResolver for ScopeResolver<'_> {
    fn resolve(&self, name: &str) -> Option<Resolved> {
        let slot = self.heap.find_in_scope(self.body, name)?;
        Some(Resolved {
            slot,
            kind: self.heap.slot(slot).kind(),
        })
    }
}
