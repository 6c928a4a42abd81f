use std::{collections::HashSet, rc::Rc};

use indexmap::IndexMap;

use crate::{
    diagnostics::Diagnostic,
    environment::{ContainerId, ContainerKind, Heap, SlotId},
};

/// `name` is no longer reachable unqualified through `loser`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub loser: ContainerId,
    pub name: String,
}

/// Everything reachable from one class: itself first, then ancestors depth-first,
/// and for each attribute name the distinct classes that define it.
#[derive(Debug, Default)]
pub struct Ancestry {
    pub order: Vec<ContainerId>,
    pub definers: IndexMap<String, Vec<ContainerId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassMember {
    Slot(SlotId),
    Qualifier(ContainerId),
    Missing,
}

impl Heap {
    pub fn parents(&self, class: ContainerId) -> &[ContainerId] {
        match &self.container(class).kind {
            ContainerKind::Class(data) => &data.parents,
            _ => &[],
        }
    }

    pub fn conflicts(&self, class: ContainerId) -> &[Conflict] {
        match &self.container(class).kind {
            ContainerKind::Class(data) => &data.conflicts,
            _ => &[],
        }
    }

    /// Memoised ancestry, computed bottom-up with an explicit worklist.
    pub fn ancestry(&self, class: ContainerId) -> Rc<Ancestry> {
        if let Some(cached) = self.ancestry.borrow().get(&class) {
            return Rc::clone(cached);
        }
        let mut stack = vec![(class, false)];
        let mut on_stack = HashSet::new();
        while let Some((id, expanded)) = stack.pop() {
            if self.ancestry.borrow().contains_key(&id) {
                continue;
            }
            if !expanded {
                // a cycle is rejected by add_parent, this only guards the walk
                if !on_stack.insert(id) {
                    continue;
                }
                stack.push((id, true));
                for parent in self.parents(id).iter().rev() {
                    if !self.ancestry.borrow().contains_key(parent) {
                        stack.push((*parent, false));
                    }
                }
                continue;
            }
            let computed = self.compute_ancestry(id);
            self.ancestry.borrow_mut().insert(id, Rc::new(computed));
        }
        self.ancestry
            .borrow()
            .get(&class)
            .cloned()
            .unwrap_or_default()
    }

    fn compute_ancestry(&self, id: ContainerId) -> Ancestry {
        let mut ancestry = Ancestry {
            order: vec![id],
            definers: IndexMap::new(),
        };
        let own = &self.container(id).attrs;
        for name in own.keys() {
            ancestry.definers.insert(name.clone(), vec![id]);
        }
        let cache = self.ancestry.borrow();
        for parent in self.parents(id) {
            let Some(inherited) = cache.get(parent) else {
                continue;
            };
            for ancestor in &inherited.order {
                if !ancestry.order.contains(ancestor) {
                    ancestry.order.push(*ancestor);
                }
            }
            for (name, defs) in &inherited.definers {
                if own.contains_key(name) {
                    continue;
                }
                let entry = ancestry.definers.entry(name.clone()).or_default();
                for def in defs {
                    if !entry.contains(def) {
                        entry.push(*def);
                    }
                }
            }
        }
        ancestry
    }

    pub fn is_subclass(&self, class: ContainerId, ancestor: ContainerId) -> bool {
        class == ancestor || self.ancestry(class).order.contains(&ancestor)
    }

    /// Adds `parent` to `class`, recording a conflict for every name reachable
    /// through two distinct defining classes.
    pub fn add_parent(
        &mut self,
        class: ContainerId,
        parent: ContainerId,
    ) -> Result<(), Diagnostic> {
        let class_name = self.name_of(class).to_string();
        if !matches!(self.container(parent).kind, ContainerKind::Class(_)) {
            return Err(Diagnostic::syntax(format!(
                "Class '{class_name}' can only extend classes"
            )));
        }
        if self.is_subclass(parent, class) {
            return Err(Diagnostic::syntax(format!(
                "Illegal recursive extension in class '{class_name}'"
            )));
        }
        if self.parents(class).contains(&parent) {
            return Err(Diagnostic::syntax(format!(
                "Class '{class_name}' already extends '{}'",
                self.name_of(parent)
            )));
        }

        let mut existing: IndexMap<String, Vec<ContainerId>> = IndexMap::new();
        for current in self.parents(class) {
            for (name, defs) in &self.ancestry(*current).definers {
                let entry = existing.entry(name.clone()).or_default();
                for def in defs {
                    if !entry.contains(def) {
                        entry.push(*def);
                    }
                }
            }
        }
        let incoming = self.ancestry(parent);
        let mut found = Vec::new();
        for (name, defs) in &incoming.definers {
            let overridden = self.container(class).attrs.contains_key(name);
            let mut all: Vec<ContainerId> = existing.get(name).cloned().unwrap_or_default();
            for def in defs {
                if !all.contains(def) {
                    all.push(*def);
                }
            }
            if overridden || (existing.contains_key(name) && all.len() > 1) {
                for loser in all {
                    found.push(Conflict {
                        loser,
                        name: name.clone(),
                    });
                }
            }
        }
        // conflicts the parent carries stay unresolved unless someone below defines the name
        let inherited: Vec<Conflict> = self
            .conflicts(parent)
            .iter()
            .filter(|conflict| {
                !self.container(parent).attrs.contains_key(&conflict.name)
                    && !self.container(class).attrs.contains_key(&conflict.name)
            })
            .cloned()
            .collect();
        found.extend(inherited);

        if let ContainerKind::Class(data) = &mut self.container_mut(class).kind {
            for conflict in found {
                if !data.conflicts.contains(&conflict) {
                    data.conflicts.push(conflict);
                }
            }
            data.parents.push(parent);
        }
        self.invalidate_ancestry();
        Ok(())
    }

    /// A class declaring `name` itself hides every ancestor's `name`.
    pub(crate) fn record_override_conflicts(&mut self, class: ContainerId, name: &str) {
        let mut found = Vec::new();
        for parent in self.parents(class) {
            if let Some(defs) = self.ancestry(*parent).definers.get(name) {
                for loser in defs {
                    let conflict = Conflict {
                        loser: *loser,
                        name: name.to_string(),
                    };
                    if !found.contains(&conflict) {
                        found.push(conflict);
                    }
                }
            }
        }
        if let ContainerKind::Class(data) = &mut self.container_mut(class).kind {
            for conflict in found {
                if !data.conflicts.contains(&conflict) {
                    data.conflicts.push(conflict);
                }
            }
        }
    }

    /// Unqualified lookup on a class: its own attribute, else an unambiguous
    /// inherited one, else the name of an ancestor to qualify by.
    pub fn class_member(&self, class: ContainerId, name: &str) -> Result<ClassMember, Diagnostic> {
        if let Some(slot) = self.container(class).attrs.get(name) {
            return Ok(ClassMember::Slot(*slot));
        }
        let losers: Vec<&str> = self
            .conflicts(class)
            .iter()
            .filter(|conflict| conflict.name == name)
            .map(|conflict| self.name_of(conflict.loser))
            .collect();
        if !losers.is_empty() {
            let options: Vec<String> = losers.iter().map(|owner| format!("{owner}.{name}")).collect();
            return Err(Diagnostic::syntax(format!(
                "'{name}' is ambiguous in class '{}', qualify it as {}",
                self.name_of(class),
                options.join(" or ")
            )));
        }
        let ancestry = self.ancestry(class);
        if let Some(definer) = ancestry.definers.get(name).and_then(|defs| defs.first()) {
            if let Some(slot) = self.container(*definer).attrs.get(name) {
                return Ok(ClassMember::Slot(*slot));
            }
        }
        if let Some(ancestor) = ancestry
            .order
            .iter()
            .skip(1)
            .find(|ancestor| self.container(**ancestor).name.as_deref() == Some(name))
        {
            return Ok(ClassMember::Qualifier(*ancestor));
        }
        Ok(ClassMember::Missing)
    }
}
