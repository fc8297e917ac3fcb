//! Constant folding.
//!
//! A subtree folds into a leaf only when it has no side effects and every
//! input is constant, so evaluating the pruned tree always matches
//! evaluating the original.

use crate::record::KnowledgeRecord;

use super::ast::{LogicalOp, Node, SequenceOp, Target};
use super::eval::{array_literal, binary, sequence_result, unary};

fn prune_target(target: &mut Target) {
    if let Target::Element { index, .. } = target {
        prune(index);
    }
}

/// Folds constant subtrees in place. Returns whether `node` can still
/// produce different results (or effects) between evaluations.
pub fn prune(node: &mut Node) -> bool {
    match node {
        Node::Leaf(_) => false,
        Node::Variable(_) => true,
        Node::ArrayElement { index, .. } => {
            prune(index);
            true
        }
        Node::ArrayLiteral(items) => {
            let mut changing = false;
            for item in items.iter_mut() {
                changing |= prune(item);
            }
            if changing {
                return true;
            }
            let values: Vec<KnowledgeRecord> = items.iter().filter_map(|n| n.as_leaf().cloned()).collect();
            *node = Node::Leaf(array_literal(&values));
            false
        }
        Node::Unary { op, operand } => {
            if prune(operand) {
                return true;
            }
            let folded = operand.as_leaf().map(|v| unary(*op, v));
            fold(node, folded)
        }
        Node::Increment { target, .. } => {
            prune_target(target);
            true
        }
        Node::Binary { op, lhs, rhs } => {
            let changing = prune(lhs) | prune(rhs);
            if changing {
                return true;
            }
            let folded = match (lhs.as_leaf(), rhs.as_leaf()) {
                (Some(l), Some(r)) => Some(binary(*op, l, r)),
                _ => None,
            };
            fold(node, folded)
        }
        Node::Logical { op, lhs, rhs } => {
            prune(lhs);
            let rhs_changing = prune(rhs);
            let Some(left) = lhs.as_leaf().map(KnowledgeRecord::is_true) else {
                return true;
            };
            match (*op, left) {
                (LogicalOp::And, false) => fold(node, Some(KnowledgeRecord::from(false))),
                (LogicalOp::Or, true) => fold(node, Some(KnowledgeRecord::from(true))),
                (LogicalOp::Implies, false) => fold(node, Some(KnowledgeRecord::from(0i64))),
                (LogicalOp::Implies, true) => {
                    *node = rhs.take();
                    rhs_changing
                }
                (LogicalOp::And | LogicalOp::Or, _) => {
                    let folded = rhs.as_leaf().map(|r| KnowledgeRecord::from(r.is_true()));
                    if rhs_changing {
                        return true;
                    }
                    fold(node, folded)
                }
            }
        }
        Node::Assign { target, value, .. } => {
            prune_target(target);
            prune(value);
            true
        }
        Node::Sequence { op, items } => {
            let mut changing = false;
            for item in items.iter_mut() {
                changing |= prune(item);
            }
            if !changing {
                let values = items.iter().filter_map(|n| n.as_leaf().cloned());
                let folded = sequence_result(*op, values.collect::<Vec<_>>());
                *node = Node::Leaf(folded);
                return false;
            }
            if matches!(op, SequenceOp::Then | SequenceOp::Comma) {
                // Constant items before the last have no effect.
                let last = items.len() - 1;
                let mut i = 0;
                items.retain(|n| {
                    let keep = i == last || !n.is_leaf();
                    i += 1;
                    keep
                });
                if items.len() == 1 {
                    *node = items.remove(0);
                }
            }
            true
        }
        Node::Conditional {
            condition,
            then,
            otherwise,
        } => {
            let condition_changing = prune(condition);
            let then_changing = prune(then);
            let otherwise_changing = prune(otherwise);
            if condition_changing {
                return true;
            }
            let Some(truth) = condition.as_leaf().map(KnowledgeRecord::is_true) else {
                return true;
            };
            if truth {
                *node = then.take();
                then_changing
            } else {
                *node = otherwise.take();
                otherwise_changing
            }
        }
        Node::ForLoop {
            start,
            step,
            end,
            body,
            ..
        } => {
            prune(start);
            if let Some(step) = step {
                prune(step);
            }
            prune(end);
            prune(body);
            true
        }
        Node::FunctionCall { args, .. } => {
            for arg in args.iter_mut() {
                prune(arg);
            }
            true
        }
        Node::SystemCall { call, args } => {
            let mut changing = false;
            for arg in args.iter_mut() {
                changing |= prune(arg);
            }
            if changing || !call.is_pure() {
                return true;
            }
            let values: Vec<KnowledgeRecord> = args.iter().filter_map(|n| n.as_leaf().cloned()).collect();
            let folded = call.eval_pure(&values);
            fold(node, folded)
        }
    }
}

/// Replaces `node` with a leaf when a value was computed.
fn fold(node: &mut Node, folded: Option<KnowledgeRecord>) -> bool {
    match folded {
        Some(value) => {
            *node = Node::Leaf(value);
            false
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadSafeContext;
    use crate::karl::compile_unpruned;
    use crate::record::Value;

    fn pruned(source: &str) -> Node {
        let ctx = ThreadSafeContext::new();
        let mut node = compile_unpruned(&ctx, source).unwrap().into_root();
        prune(&mut node);
        node
    }

    #[test]
    fn test_constant_arithmetic_folds() {
        assert_eq!(pruned("3 + 4 * 2"), Node::Leaf(KnowledgeRecord::from(11i64)));
        assert_eq!(pruned("-(2.5)"), Node::Leaf(KnowledgeRecord::from(-2.5)));
        assert_eq!(pruned("#pow(2, 3)"), Node::Leaf(KnowledgeRecord::from(8.0)));
        assert_eq!(pruned("[1, 2]"), Node::Leaf(KnowledgeRecord::from(vec![1i64, 2])));
    }

    #[test]
    fn test_variables_block_folding() {
        assert!(matches!(pruned("x + 1"), Node::Binary { .. }));
        assert!(matches!(pruned("x = 2 * 3"), Node::Assign { ref value, .. } if value.is_leaf()));
    }

    #[test]
    fn test_short_circuit_folds_selected_branch() {
        assert_eq!(pruned("0 && x"), Node::Leaf(KnowledgeRecord::from(false)));
        assert_eq!(pruned("1 || x"), Node::Leaf(KnowledgeRecord::from(true)));
        assert!(matches!(pruned("1 => x = 2"), Node::Assign { .. }));
        assert!(matches!(pruned("1 ? y : z"), Node::Variable(ref v) if v.key == "y"));
        assert!(matches!(pruned("1 && x"), Node::Logical { .. }));
    }

    #[test]
    fn test_impure_system_calls_kept() {
        assert!(matches!(pruned("#get_time()"), Node::SystemCall { .. }));
        assert!(matches!(pruned("#print('hi')"), Node::SystemCall { .. }));
    }

    #[test]
    fn test_constant_sequence_items_dropped() {
        let node = pruned("1, 2, x = 3");
        assert!(matches!(node, Node::Assign { .. }));
        let node = pruned("(1; 5; 2)");
        assert_eq!(node, Node::Leaf(KnowledgeRecord::new(Value::Integer(5))));
    }
}
