//! Module tree
//!
//! A model is an arena of module nodes addressed by [`ModuleId`]. Each node
//! knows the attribute name its parent refers to it by, so "replace the child
//! `mlp` of layer 3" is a single well-defined operation that keeps the name.
//! Parameters are shared [`Parameter`] handles; moving a handle between
//! modules never copies tensor storage.

use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::tensor::Parameter;

/// Stable index of a module in its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

/// Forward call path of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The host library's own implementation
    Generic,
    /// Bound to a named device kernel
    Optimized(String),
}

/// One module node
#[derive(Debug, Clone)]
pub struct Module {
    /// Type name, e.g. `LlamaAttention`
    pub kind: String,
    name: String,
    parent: Option<ModuleId>,
    children: Vec<(String, ModuleId)>,
    params: BTreeMap<String, Parameter>,
    pub forward: Dispatch,
    /// Internal operator slots, e.g. `act_fn -> silu`
    pub operators: BTreeMap<String, String>,
    /// Integer hyper-parameters, e.g. `num_heads`
    pub attrs: BTreeMap<String, i64>,
}

impl Module {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: String::new(),
            parent: None,
            children: Vec::new(),
            params: BTreeMap::new(),
            forward: Dispatch::Generic,
            operators: BTreeMap::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, param: Parameter) -> Self {
        self.params.insert(name.into(), param);
        self
    }

    pub fn with_operator(mut self, slot: impl Into<String>, op: impl Into<String>) -> Self {
        self.operators.insert(slot.into(), op.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: i64) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }

    /// Attribute name under the parent
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ModuleId> {
        self.parent
    }

    pub fn children(&self) -> &[(String, ModuleId)] {
        &self.children
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert_param(&mut self, name: impl Into<String>, param: Parameter) {
        self.params.insert(name.into(), param);
    }

    pub fn attr(&self, key: &str) -> Option<i64> {
        self.attrs.get(key).copied()
    }
}

/// Arena of modules rooted at one node
#[derive(Debug, Clone)]
pub struct ModuleTree {
    nodes: Vec<Option<Module>>,
    root: ModuleId,
}

impl ModuleTree {
    pub fn new(root: Module) -> Self {
        Self {
            nodes: vec![Some(root)],
            root: ModuleId(0),
        }
    }

    pub fn root(&self) -> ModuleId {
        self.root
    }

    pub fn get(&self, id: ModuleId) -> Result<&Module> {
        self.nodes
            .get(id.0)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| CoreError::UnknownModule(format!("#{}", id.0)))
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Result<&mut Module> {
        self.nodes
            .get_mut(id.0)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| CoreError::UnknownModule(format!("#{}", id.0)))
    }

    /// Number of live modules
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach `module` under `parent` as attribute `name`
    pub fn add_child(&mut self, parent: ModuleId, name: impl Into<String>, mut module: Module) -> Result<ModuleId> {
        let name = name.into();
        if self.child(parent, &name)?.is_some() {
            return Err(CoreError::InvalidConfig(format!(
                "module {} already has a child named '{}'",
                self.path(parent)?,
                name
            )));
        }
        let id = ModuleId(self.nodes.len());
        module.name = name.clone();
        module.parent = Some(parent);
        module.children.clear();
        self.nodes.push(Some(module));
        self.get_mut(parent)?.children.push((name, id));
        Ok(id)
    }

    pub fn child(&self, parent: ModuleId, name: &str) -> Result<Option<ModuleId>> {
        Ok(self
            .get(parent)?
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id))
    }

    /// Resolve a dotted module path such as `layers.0.mlp`
    pub fn find(&self, path: &str) -> Option<ModuleId> {
        if path.is_empty() {
            return Some(self.root);
        }
        path.split('.').try_fold(self.root, |id, part| {
            self.child(id, part).ok().flatten()
        })
    }

    /// Dotted path of a module, empty for the root
    pub fn path(&self, id: ModuleId) -> Result<String> {
        let mut parts = Vec::new();
        let mut cursor = id;
        loop {
            let module = self.get(cursor)?;
            match module.parent {
                Some(parent) => {
                    parts.push(module.name.clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        Ok(parts.join("."))
    }

    /// Live modules below `id` (inclusive) in pre-order
    pub fn walk_from(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Ok(module) = self.get(current) {
                out.push(current);
                stack.extend(module.children.iter().rev().map(|(_, c)| *c));
            }
        }
        out
    }

    pub fn walk(&self) -> Vec<ModuleId> {
        self.walk_from(self.root)
    }

    /// Parameters below `id`, named relative to it
    pub fn subtree_parameters(&self, id: ModuleId) -> Result<Vec<(String, Parameter)>> {
        let base = self.path(id)?;
        let mut out = Vec::new();
        for module_id in self.walk_from(id) {
            let path = self.path(module_id)?;
            let rel = relative(&base, &path);
            for (name, param) in self.get(module_id)?.params() {
                out.push((join(rel, name), param.clone()));
            }
        }
        Ok(out)
    }

    /// Every parameter with its fully qualified name
    pub fn named_parameters(&self) -> Result<Vec<(String, Parameter)>> {
        self.subtree_parameters(self.root)
    }

    /// Look up a parameter by qualified name
    ///
    /// Replaced modules may hold flattened names such as `proj.weight`, so
    /// the lookup goes through the qualified names rather than the path.
    pub fn parameter(&self, qualified: &str) -> Option<Parameter> {
        self.named_parameters()
            .ok()?
            .into_iter()
            .find(|(name, _)| name == qualified)
            .map(|(_, param)| param)
    }

    /// Operator slots below `id`, named relative to it
    pub fn subtree_operators(&self, id: ModuleId) -> Result<Vec<(String, String)>> {
        let base = self.path(id)?;
        let mut out = Vec::new();
        for module_id in self.walk_from(id) {
            let path = self.path(module_id)?;
            let rel = relative(&base, &path);
            for (slot, op) in &self.get(module_id)?.operators {
                out.push((join(rel, slot), op.clone()));
            }
        }
        Ok(out)
    }

    /// Replace the child `name` of `parent` with `module`, keeping the name
    ///
    /// The old subtree is detached; its parameter handles stay alive wherever
    /// they are still referenced.
    pub fn replace_child(&mut self, parent: ModuleId, name: &str, mut module: Module) -> Result<ModuleId> {
        let old = self.child(parent, name)?.ok_or_else(|| {
            CoreError::UnknownModule(format!("{}.{}", self.path(parent).unwrap_or_default(), name))
        })?;
        for id in self.walk_from(old) {
            self.nodes[id.0] = None;
        }

        let id = ModuleId(self.nodes.len());
        module.name = name.to_string();
        module.parent = Some(parent);
        module.children.clear();
        self.nodes.push(Some(module));

        let slot = self
            .get_mut(parent)?
            .children
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| CoreError::UnknownModule(name.to_string()))?;
        slot.1 = id;
        Ok(id)
    }
}

fn relative<'a>(base: &str, path: &'a str) -> &'a str {
    if base.is_empty() {
        path
    } else {
        path.strip_prefix(base)
            .map(|rest| rest.trim_start_matches('.'))
            .unwrap_or(path)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
