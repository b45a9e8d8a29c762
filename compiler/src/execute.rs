// execute.rs — Dependency and execute-region lowering
//
// Removes the async wrapper constructs from outlined core bodies. An
// execute region becomes: a wait-all join over its dependencies, the
// region body spliced in place, and a trailing join token for any
// consumer of the region's token. Loop-carried dependency tokens are
// stripped from `for` loops: intra-loop uses fall back to the incoming
// token, body tokens are joined before the yield, and token results are
// replaced by a fresh join after the loop.
//
// Preconditions: cores are outlined; execute bodies end in a terminator.
// Postconditions: no Execute/ExecuteTerminator nodes remain reachable;
//   no token-typed loop-carried values remain; the set of real (non-token)
//   loop-carried values is preserved exactly.
// Failure modes: none; these rewrites always apply.
// Side effects: mutates the module arena.

use crate::fabric::Device;
use crate::id::{NodeId, ValueId};
use crate::ir::{BlockRef, Module, NodeKind, Type, ValueDef};

// ── Execute lowering ─────────────────────────────────────────────────────

/// Splice every execute region in every core body.
pub fn lower_executes(module: &mut Module, device: &Device) {
    for core in device.cores.clone() {
        lower_executes_in(module, BlockRef::body(core));
    }
}

fn lower_executes_in(module: &mut Module, at: BlockRef) {
    let mut body = module.block(at).clone();
    let mut i = 0;
    while i < body.len() {
        let id = body[i];
        if module.is_erased(id) {
            body.remove(i);
            continue;
        }
        if matches!(module.kind(id), NodeKind::Execute { .. }) {
            let replacement = splice_execute(module, id);
            body.splice(i..=i, replacement);
            // Re-examine from the splice point: spliced bodies may hold
            // nested execute regions.
            continue;
        }
        for child in module.child_block_refs(id) {
            lower_executes_in(module, child);
        }
        i += 1;
    }
    *module.block_mut(at) = body;
}

fn splice_execute(module: &mut Module, id: NodeId) -> Vec<NodeId> {
    let (deps, token, results, exec_body) = match module.kind(id) {
        NodeKind::Execute {
            deps,
            token,
            results,
            body,
        } => (deps.clone(), *token, results.clone(), body.clone()),
        _ => unreachable!(),
    };

    let mut replacement = Vec::new();

    // Wait on the declared dependencies before the region body runs.
    if !deps.is_empty() {
        let join = module.add_node(NodeKind::WaitAll {
            deps: deps.clone(),
            token: None,
        });
        replacement.push(join);
    }

    let mut yield_ops: Vec<ValueId> = Vec::new();
    for &n in &exec_body {
        if module.is_erased(n) {
            continue;
        }
        if let NodeKind::ExecuteTerminator { operands } = module.kind(n) {
            yield_ops = operands.clone();
            module.erase(n);
            continue;
        }
        replacement.push(n);
    }

    // A trailing join stands in for the region's token.
    let join = module.add_node(NodeKind::HerdTerminator);
    let new_token = module.new_value(Type::Token, ValueDef::Node(join, 0));
    *module.kind_mut(join) = NodeKind::WaitAll {
        deps: Vec::new(),
        token: Some(new_token),
    };
    replacement.push(join);
    module.replace_all_uses(token, new_token);

    for (i, &res) in results.iter().enumerate() {
        if let Some(&op) = yield_ops.get(i) {
            module.replace_all_uses(res, op);
        }
    }

    module.erase(id);
    replacement
}

// ── Loop token stripping ─────────────────────────────────────────────────

/// Strip dependency-token loop-carried values from every `for` loop in
/// every core body.
pub fn strip_loop_tokens(module: &mut Module, device: &Device) {
    for core in device.cores.clone() {
        strip_in(module, BlockRef::body(core));
    }
}

fn strip_in(module: &mut Module, at: BlockRef) {
    let mut body = module.block(at).clone();
    let mut i = 0;
    while i < body.len() {
        let id = body[i];
        if module.is_erased(id) {
            body.remove(i);
            continue;
        }
        if matches!(module.kind(id), NodeKind::For { .. }) {
            if let Some(trailing_join) = strip_one_for(module, id) {
                body.insert(i + 1, trailing_join);
            }
        }
        for child in module.child_block_refs(id) {
            strip_in(module, child);
        }
        i += 1;
    }
    *module.block_mut(at) = body;
}

/// Strip one loop. Returns a join node to insert after the loop when any
/// token-typed result had uses to forward.
fn strip_one_for(module: &mut Module, id: NodeId) -> Option<NodeId> {
    let (iter_inits, iter_args, results, for_body) = match module.kind(id) {
        NodeKind::For {
            iter_inits,
            iter_args,
            results,
            body,
            ..
        } => (
            iter_inits.clone(),
            iter_args.clone(),
            results.clone(),
            body.clone(),
        ),
        _ => unreachable!(),
    };

    let token_at: Vec<bool> = iter_args
        .iter()
        .map(|&a| module.value_type(a).is_token())
        .collect();
    if !token_at.iter().any(|&t| t) {
        return None;
    }

    // Intra-loop uses of a token argument fall back to the incoming token.
    for (i, &is_token) in token_at.iter().enumerate() {
        if is_token {
            module.replace_all_uses(iter_args[i], iter_inits[i]);
        }
    }

    // Token results forward to a fresh join placed after the loop.
    let mut trailing = None;
    let any_token_result = results
        .iter()
        .zip(&token_at)
        .any(|(_, &t)| t);
    if any_token_result {
        let join = module.add_node(NodeKind::HerdTerminator);
        let new_token = module.new_value(Type::Token, ValueDef::Node(join, 0));
        *module.kind_mut(join) = NodeKind::WaitAll {
            deps: Vec::new(),
            token: Some(new_token),
        };
        for (i, &is_token) in token_at.iter().enumerate() {
            if is_token {
                module.replace_all_uses(results[i], new_token);
            }
        }
        trailing = Some(join);
    }

    // Join body tokens before the yield, and drop them from its operands.
    let yield_node = for_body
        .iter()
        .copied()
        .find(|&n| !module.is_erased(n) && matches!(module.kind(n), NodeKind::Yield { .. }));
    if let Some(y) = yield_node {
        let operands = match module.kind(y) {
            NodeKind::Yield { operands } => operands.clone(),
            _ => unreachable!(),
        };
        let (token_ops, value_ops): (Vec<ValueId>, Vec<ValueId>) = operands
            .into_iter()
            .partition(|&o| module.value_type(o).is_token());
        if !token_ops.is_empty() {
            let join = module.add_node(NodeKind::WaitAll {
                deps: token_ops,
                token: None,
            });
            let mut b = for_body.clone();
            let pos = b.iter().position(|&n| n == y).unwrap();
            b.insert(pos, join);
            if let NodeKind::For { body, .. } = module.kind_mut(id) {
                *body = b;
            }
        }
        if let NodeKind::Yield { operands } = module.kind_mut(y) {
            *operands = value_ops;
        }
    }

    // Rebuild the carried-value lists without the token slots. The kept
    // ValueIds are unchanged, so downstream uses stay valid.
    let keep =
        |vs: &[ValueId]| -> Vec<ValueId> {
            vs.iter()
                .zip(&token_at)
                .filter(|(_, &t)| !t)
                .map(|(&v, _)| v)
                .collect()
        };
    let new_inits = keep(&iter_inits);
    let new_args = keep(&iter_args);
    let new_results = keep(&results);
    if let NodeKind::For {
        iter_inits,
        iter_args,
        results,
        ..
    } = module.kind_mut(id)
    {
        *iter_inits = new_inits;
        *iter_args = new_args;
        *results = new_results;
    }

    trailing
}

// ── Tests ────────────────────────────────────────────────────────────────
