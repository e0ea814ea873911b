//! Hierarchical variable namespaces.
//!
//! Scopes live in an arena owned by [`ScopeTree`] and are addressed by
//! [`ScopeId`]. Lookups walk the parent chain; creation is always local.
//! Slots of deleted scopes are recycled. Every id carries the generation of
//! its slot, so a stale id fails loudly instead of aliasing a newer scope.

use crate::error::FrameworkError;
use crate::variable::{SharedVar, new_shared_var};
use std::collections::HashMap;

/// Handle to a scope in a [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId {
    index: usize,
    generation: u32,
}

impl ScopeId {
    /// Arena index.
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug)]
struct ScopeNode {
    parent: Option<ScopeId>,
    kids: Vec<ScopeId>,
    vars: HashMap<String, SharedVar>,
}

impl ScopeNode {
    fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent,
            kids: Vec::new(),
            vars: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<ScopeNode>,
}

/// Arena of scopes rooted at a single global scope.
#[derive(Debug)]
pub struct ScopeTree {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl ScopeTree {
    /// Tree containing only the root scope.
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(ScopeNode::new(None)),
            }],
            free: Vec::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId {
            index: 0,
            generation: 0,
        }
    }

    fn node(&self, id: ScopeId) -> Result<&ScopeNode, FrameworkError> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or_else(|| dead_scope(id))
    }

    fn node_mut(&mut self, id: ScopeId) -> Result<&mut ScopeNode, FrameworkError> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or_else(|| dead_scope(id))
    }

    pub fn is_alive(&self, id: ScopeId) -> bool {
        self.node(id).is_ok()
    }

    pub fn parent(&self, id: ScopeId) -> Result<Option<ScopeId>, FrameworkError> {
        Ok(self.node(id)?.parent)
    }

    /// Create a child of `parent`.
    pub fn new_scope(&mut self, parent: ScopeId) -> Result<ScopeId, FrameworkError> {
        self.node(parent)?;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.node = Some(ScopeNode::new(Some(parent)));
                ScopeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(ScopeNode::new(Some(parent))),
                });
                ScopeId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        self.node_mut(parent)?.kids.push(id);
        Ok(id)
    }

    /// Local variable `name` in `scope`, created empty if absent.
    pub fn var(&mut self, scope: ScopeId, name: &str) -> Result<SharedVar, FrameworkError> {
        let node = self.node_mut(scope)?;
        Ok(node
            .vars
            .entry(name.to_string())
            .or_insert_with(new_shared_var)
            .clone())
    }

    /// Variable `name` declared directly in `scope`.
    pub fn find_local_var(&self, scope: ScopeId, name: &str) -> Option<SharedVar> {
        self.node(scope).ok()?.vars.get(name).cloned()
    }

    /// Variable `name` in `scope` or the nearest ancestor that declares it.
    pub fn find_var(&self, scope: ScopeId, name: &str) -> Option<SharedVar> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let node = self.node(id).ok()?;
            if let Some(var) = node.vars.get(name) {
                return Some(var.clone());
            }
            current = node.parent;
        }
        None
    }

    /// Like [`find_var`](Self::find_var) but fails with `VariableNotFound`.
    pub fn require_var(&self, scope: ScopeId, name: &str) -> Result<SharedVar, FrameworkError> {
        self.find_var(scope, name)
            .ok_or_else(|| FrameworkError::not_found(name))
    }

    /// Names declared directly in `scope`, sorted.
    pub fn local_var_names(&self, scope: ScopeId) -> Result<Vec<String>, FrameworkError> {
        let mut names: Vec<String> = self.node(scope)?.vars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Live children of `scope`, in creation order.
    pub fn kids(&self, scope: ScopeId) -> Result<&[ScopeId], FrameworkError> {
        Ok(&self.node(scope)?.kids)
    }

    /// Release `scope`, its descendants and every variable they own.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBlock` for the root or a scope that is not alive.
    pub fn delete_scope(&mut self, scope: ScopeId) -> Result<(), FrameworkError> {
        let parent = self.node(scope)?.parent.ok_or_else(|| FrameworkError::InvalidBlock {
            message: "the root scope cannot be deleted".to_string(),
        })?;
        self.node_mut(parent)?.kids.retain(|&k| k != scope);

        let mut pending = vec![scope];
        while let Some(id) = pending.pop() {
            let Some(slot) = self.slots.get_mut(id.index) else {
                continue;
            };
            if slot.generation != id.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                pending.extend(node.kids);
            }
        }
        Ok(())
    }

    /// Number of live scopes, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dead_scope(id: ScopeId) -> FrameworkError {
    FrameworkError::InvalidBlock {
        message: format!("scope {} (generation {}) is not alive", id.index, id.generation),
    }
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}
