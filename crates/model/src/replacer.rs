//! Swapping generic modules for accelerator-specialized ones
//!
//! Three passes, run in this order by the converter:
//!
//! 1. [`ModuleReplacer::replace_forward_functions`] rebinds the forward
//!    dispatch of module types with an optimized kernel. Parameters and
//!    structure are untouched.
//! 2. [`ModuleReplacer::replace_modules`] builds a specialized module for
//!    every module matching a [`ReplacementRule`] and installs it in the
//!    parent's slot under the same name. Parameter handles move into the new
//!    module, they are not copied.
//! 3. [`ModuleReplacer::replace_operators`] swaps the generic operators held
//!    by specialized modules for accelerated ones.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use shardconv_core::{
    CoreError, DType, Dispatch, KernelCatalog, Module, ModuleId, ModuleTree, ParallelTopology,
    TransformerConfig,
};

use crate::error::Result;

/// Layer type installed when no override is configured
pub const DEFAULT_LAYER_TYPE: &str = "XpuTransformerBlock";

/// Generic layer types replaced when no override is configured
pub const DEFAULT_MODULE_TYPES: [&str; 2] = ["LlamaDecoderLayer", "Qwen2DecoderLayer"];

/// Everything a replacement factory sees about the module it replaces
pub struct ReplaceContext<'a> {
    pub tree: &'a ModuleTree,
    pub id: ModuleId,
    pub dtype: DType,
    pub topology: &'a ParallelTopology,
    pub target_type: &'a str,
    pub config: Option<&'a TransformerConfig>,
}

impl ReplaceContext<'_> {
    pub fn module(&self) -> Result<&Module> {
        Ok(self.tree.get(self.id)?)
    }
}

/// Builds the specialized module for a matched generic one
pub type ReplaceFn = Arc<dyn Fn(&ReplaceContext<'_>) -> Result<Module> + Send + Sync>;

/// Source module type to specialized module
#[derive(Clone)]
pub struct ReplacementRule {
    pub source_type: String,
    pub target_type: String,
    /// Custom factory; [`specialized_block`] when unset
    pub factory: Option<ReplaceFn>,
}

impl ReplacementRule {
    pub fn new(source_type: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            target_type: target_type.into(),
            factory: None,
        }
    }

    pub fn with_factory(mut self, factory: ReplaceFn) -> Self {
        self.factory = Some(factory);
        self
    }

    fn build(&self, ctx: &ReplaceContext<'_>) -> Result<Module> {
        match &self.factory {
            Some(f) => f(ctx),
            None => specialized_block(ctx),
        }
    }
}

impl fmt::Debug for ReplacementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplacementRule")
            .field("source_type", &self.source_type)
            .field("target_type", &self.target_type)
            .field("custom_factory", &self.factory.is_some())
            .finish()
    }
}

/// Default factory: a fused block owning the whole subtree's parameters
///
/// Parameters keep their names relative to the replaced module, so qualified
/// names seen from the root do not change. Head counts are recorded per rank
/// as `local_num_heads` / `local_num_kv_heads`.
pub fn specialized_block(ctx: &ReplaceContext<'_>) -> Result<Module> {
    let mut module = Module::new(ctx.target_type);

    for (name, param) in ctx.tree.subtree_parameters(ctx.id)? {
        {
            let mut tensor = param.write();
            if tensor.is_floating_point() && tensor.dtype() != ctx.dtype {
                tensor.to_dtype(ctx.dtype);
            }
        }
        module.insert_param(name, param);
    }
    for (slot, op) in ctx.tree.subtree_operators(ctx.id)? {
        module.operators.insert(slot, op);
    }
    for id in ctx.tree.walk_from(ctx.id) {
        for (key, value) in &ctx.tree.get(id)?.attrs {
            module.attrs.entry(key.clone()).or_insert(*value);
        }
    }
    if let Some(config) = ctx.config {
        module.attrs.entry("num_heads".into()).or_insert(config.num_heads as i64);
        module.attrs.entry("num_kv_heads".into()).or_insert(config.num_kv_heads as i64);
        module.attrs.entry("head_dim".into()).or_insert(config.head_dim as i64);
    }

    let tp = ctx.topology.tp_size() as i64;
    for key in ["num_heads", "num_kv_heads"] {
        let Some(value) = module.attr(key) else { continue };
        if value % tp != 0 {
            return Err(CoreError::shape(
                ctx.tree.path(ctx.id)?,
                format!("{} = {} is not divisible by tp_size {}", key, value, tp),
            )
            .into());
        }
        module.attrs.insert(format!("local_{}", key), value / tp);
    }
    module.attrs.insert("tp_size".into(), tp);
    module.attrs.insert("tp_rank".into(), ctx.topology.rank() as i64);
    module.forward = Dispatch::Optimized(ctx.target_type.to_string());
    Ok(module)
}

/// What the three passes changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceReport {
    pub forward_rebound: usize,
    pub modules_replaced: usize,
    pub operators_replaced: usize,
}

/// Applies forward, module and operator replacement
pub struct ModuleReplacer {
    catalog: KernelCatalog,
    rules: Vec<ReplacementRule>,
}

impl ModuleReplacer {
    pub fn new(catalog: KernelCatalog) -> Self {
        let rules = DEFAULT_MODULE_TYPES
            .iter()
            .map(|source| ReplacementRule::new(*source, DEFAULT_LAYER_TYPE))
            .collect();
        Self { catalog, rules }
    }

    /// Apply configured overrides to the default rules
    ///
    /// `module_type` replaces the default source types with a single one,
    /// `layer_type` renames the installed type and `replace_fn` becomes the
    /// factory of every default rule.
    pub fn with_overrides(
        mut self,
        module_type: Option<&str>,
        layer_type: Option<&str>,
        replace_fn: Option<ReplaceFn>,
    ) -> Self {
        if let Some(source) = module_type {
            self.rules = vec![ReplacementRule::new(source, DEFAULT_LAYER_TYPE)];
        }
        for rule in &mut self.rules {
            if let Some(target) = layer_type {
                rule.target_type = target.to_string();
            }
            if let Some(f) = &replace_fn {
                rule.factory = Some(f.clone());
            }
        }
        self
    }

    /// Add rules, e.g. contributed by a detected inference engine
    ///
    /// A rule for an already covered source type takes its place.
    pub fn extend_rules(&mut self, rules: impl IntoIterator<Item = ReplacementRule>) {
        for rule in rules {
            self.rules.retain(|r| r.source_type != rule.source_type);
            self.rules.push(rule);
        }
    }

    pub fn rules(&self) -> &[ReplacementRule] {
        &self.rules
    }

    fn rule_for(&self, module_type: &str) -> Option<&ReplacementRule> {
        self.rules.iter().find(|r| r.source_type == module_type)
    }

    fn target_types(&self) -> BTreeSet<&str> {
        self.rules.iter().map(|r| r.target_type.as_str()).collect()
    }

    /// Rebind forward dispatch of modules with an optimized kernel
    pub fn replace_forward_functions(&self, model: &mut ModuleTree) -> Result<usize> {
        let mut rebound = 0;
        for id in model.walk() {
            let module = model.get_mut(id)?;
            if module.forward != Dispatch::Generic {
                continue;
            }
            if let Some(kernel) = self.catalog.forward_for(&module.kind) {
                module.forward = Dispatch::Optimized(kernel.to_string());
                rebound += 1;
            }
        }
        tracing::debug!(rebound, "Rebound forward functions");
        Ok(rebound)
    }

    /// Replace every module matching a rule, outermost match first
    pub fn replace_modules(
        &self,
        model: &mut ModuleTree,
        dtype: DType,
        topology: &ParallelTopology,
        config: Option<&TransformerConfig>,
    ) -> Result<usize> {
        if let Some(config) = config {
            config.validate_for(topology.tp_size())?;
        }

        let root = model.root();
        if self.rule_for(&model.get(root)?.kind).is_some() {
            return Err(CoreError::InvalidConfig("the root module cannot be replaced".into()).into());
        }

        // Descendants of a match are consumed by it
        let mut matches = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let module = model.get(id)?;
            if id != root && self.rule_for(&module.kind).is_some() {
                matches.push(id);
                continue;
            }
            stack.extend(module.children().iter().rev().map(|(_, c)| *c));
        }

        for id in &matches {
            let (parent, name, kind) = {
                let module = model.get(*id)?;
                let parent = module
                    .parent()
                    .ok_or_else(|| CoreError::UnknownModule(module.name().to_string()))?;
                (parent, module.name().to_string(), module.kind.clone())
            };
            let Some(rule) = self.rule_for(&kind) else { continue };

            let replacement = rule.build(&ReplaceContext {
                tree: &*model,
                id: *id,
                dtype,
                topology,
                target_type: &rule.target_type,
                config,
            })?;
            model.replace_child(parent, &name, replacement)?;
            tracing::trace!(module = %name, from = %kind, to = %rule.target_type, "Replaced module");
        }

        tracing::info!(replaced = matches.len(), "Replaced generic modules");
        Ok(matches.len())
    }

    /// Swap generic operators of specialized modules for accelerated ones
    pub fn replace_operators(&self, model: &mut ModuleTree) -> Result<usize> {
        let targets: BTreeSet<String> = self.target_types().into_iter().map(String::from).collect();
        let mut swapped = 0;
        for id in model.walk() {
            let module = model.get_mut(id)?;
            if !targets.contains(&module.kind) {
                continue;
            }
            for op in module.operators.values_mut() {
                if let Some(kernel) = self.catalog.operator_for(op) {
                    *op = kernel.to_string();
                    swapped += 1;
                }
            }
        }
        tracing::debug!(swapped, "Replaced operators");
        Ok(swapped)
    }
}
