//! Runs the operators of a block inside a scope.

use crate::config::RuntimeConfig;
use crate::desc::{BlockId, EMPTY_VAR_NAME, OpDesc, ProgramDesc};
use crate::dispatch::{KernelDispatcher, RuntimeContext};
use crate::error::FrameworkError;
use crate::registry::{OpKind, OpRegistry};
use crate::scope::{ScopeId, ScopeTree};
use crate::variable::{SharedVar, new_shared_var};
use std::collections::BTreeMap;
use tracing::trace;

/// Sequential block interpreter.
///
/// Variables declared by the block are created in the target scope
/// (persistable ones in the root scope); every other name is resolved
/// through the scope chain, so ops that write an enclosing variable update
/// it where it lives.
#[derive(Debug, Clone, Copy)]
pub struct Executor<'a> {
    registry: &'a OpRegistry,
    dispatcher: &'a KernelDispatcher,
    config: &'a RuntimeConfig,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a OpRegistry,
        dispatcher: &'a KernelDispatcher,
        config: &'a RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    pub fn registry(&self) -> &'a OpRegistry {
        self.registry
    }

    pub fn dispatcher(&self) -> &'a KernelDispatcher {
        self.dispatcher
    }

    pub fn config(&self) -> &'a RuntimeConfig {
        self.config
    }

    /// Run every op of `block` in `scope`.
    pub fn run(
        &self,
        program: &ProgramDesc,
        scopes: &mut ScopeTree,
        scope: ScopeId,
        block: BlockId,
    ) -> Result<(), FrameworkError> {
        let desc = program.block(block)?;
        for var in desc.vars.values() {
            if var.persistable {
                if scopes.find_var(scope, &var.name).is_none() {
                    let root = scopes.root();
                    scopes.var(root, &var.name)?;
                }
            } else {
                scopes.var(scope, &var.name)?;
            }
        }

        for op in &desc.ops {
            self.run_op(op, program, scopes, scope)?;
        }
        Ok(())
    }

    /// Run a single op in `scope`.
    pub fn run_op(
        &self,
        op: &OpDesc,
        program: &ProgramDesc,
        scopes: &mut ScopeTree,
        scope: ScopeId,
    ) -> Result<(), FrameworkError> {
        let instance = self.registry.create_op(op)?;
        trace!(op = %op.op_type, scope = scope.index(), "executor running op");
        match &instance.kind {
            OpKind::Kernel(_) => {
                let ctx = bind_context(op, scopes, scope)?;
                self.dispatcher
                    .prepare(&instance, ctx, self.config.place)?
                    .run()
            }
            OpKind::Block(run) => run(self, op, program, scopes, scope),
            OpKind::DescriptorOnly => Err(FrameworkError::UnknownOperator {
                op_type: op.op_type.clone(),
                reason: "operator has no kernel".to_string(),
            }),
        }
    }
}

/// Resolve `op`'s arguments in the scope chain. Missing outputs are created
/// in `scope`; `@EMPTY@` arguments get throwaway variables.
fn bind_context(
    op: &OpDesc,
    scopes: &mut ScopeTree,
    scope: ScopeId,
) -> Result<RuntimeContext, FrameworkError> {
    let mut inputs: BTreeMap<String, Vec<SharedVar>> = BTreeMap::new();
    for (slot, names) in &op.inputs {
        let vars = names
            .iter()
            .map(|name| {
                if name == EMPTY_VAR_NAME {
                    Ok(new_shared_var())
                } else {
                    scopes.require_var(scope, name)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        inputs.insert(slot.clone(), vars);
    }

    let mut outputs: BTreeMap<String, Vec<SharedVar>> = BTreeMap::new();
    for (slot, names) in &op.outputs {
        let mut vars = Vec::with_capacity(names.len());
        for name in names {
            let var = if name == EMPTY_VAR_NAME {
                new_shared_var()
            } else {
                match scopes.find_var(scope, name) {
                    Some(var) => var,
                    None => scopes.var(scope, name)?,
                }
            };
            vars.push(var);
        }
        outputs.insert(slot.clone(), vars);
    }
    Ok(RuntimeContext::new(inputs, outputs))
}
