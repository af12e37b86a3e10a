//! Graphviz export of a scope's control-flow graph.

use petgraph::dot::{Config, Dot};
use petgraph::stable_graph::{NodeIndex, StableGraph};
use std::collections::HashMap;

use crate::ir::analysis::Scope;
use crate::ir::{DefId, World};

/// Builds the scope's CFG with unique lambda names as node weights.
pub fn scope_graph(world: &World, scope: &Scope) -> StableGraph<String, ()> {
    let mut graph = StableGraph::new();
    let mut nodes: HashMap<DefId, NodeIndex> = HashMap::new();
    for &lambda in scope.rpo() {
        let idx = graph.add_node(world.unique_name(lambda));
        nodes.insert(lambda, idx);
    }
    for &lambda in scope.rpo() {
        for &succ in scope.succs(lambda) {
            graph.add_edge(nodes[&lambda], nodes[&succ], ());
        }
    }
    graph
}

pub fn dot(world: &World, scope: &Scope) -> String {
    let graph = scope_graph(world, scope);
    format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::*;
    use crate::types::PrimType;

    #[test]
    fn test_dot_contains_edges() {
        let mut world = World::new();
        let ret_ty = world.fn_ty(vec![]);
        let bool_ty = world.prim_ty(PrimType::Bool);
        let a_ty = world.fn_ty(vec![bool_ty, ret_ty]);
        let bb = world.fn_ty(vec![]);
        let a = world.lambda_sealed(a_ty, LambdaAttr::Extern, "a");
        let b = world.lambda_sealed(bb, LambdaAttr::None, "b");
        let c = world.lambda_sealed(bb, LambdaAttr::None, "c");
        let cond = world.param_of(a, 0);
        let ret = world.param_of(a, 1);
        world.branch(a, cond, b, c);
        world.jump(b, ret, &[]);
        world.jump(c, ret, &[]);

        let scope = Scope::new(&world, a);
        let out = dot(&world, &scope);
        assert!(out.contains("a_0"));
        assert!(out.contains("->"));
    }
}
