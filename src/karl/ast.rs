//! Compiled KaRL expression tree.
//!
//! The tree is a closed enum; every child is owned by exactly one parent.

use crate::context::VariableReference;
use crate::record::ops::ArithOp;
use crate::record::KnowledgeRecord;

use super::system_calls::SystemCall;

/// A variable as it appears in source.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableNode {
    /// Key or key template (`agent{.id}.x`).
    pub key: String,
    /// Handle bound at compile time; `None` for templated keys, which are
    /// expanded on every access.
    pub reference: Option<VariableReference>,
}

impl VariableNode {
    #[must_use]
    pub fn is_template(&self) -> bool {
        self.reference.is_none()
    }
}

/// Something an assignment or increment can write to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Variable(VariableNode),
    Element { variable: VariableNode, index: Box<Node> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Arith(ArithOp),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Arith(op) => op.symbol(),
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    /// `a => b`: `b` only when `a` holds, else 0.
    Implies,
}

/// `None` is plain `=`; otherwise a compound read-modify-write.
pub type AssignOp = Option<ArithOp>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOp {
    /// `;`: every item runs, the largest result wins.
    Both,
    /// `;>`: every item runs, the last result wins.
    Then,
    /// `,`: every item runs, the last result wins.
    Comma,
}

impl SequenceOp {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Both => ";",
            Self::Then => ";>",
            Self::Comma => ",",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(KnowledgeRecord),
    Variable(VariableNode),
    ArrayElement {
        variable: VariableNode,
        index: Box<Node>,
    },
    ArrayLiteral(Vec<Node>),
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    /// `++x`, `x--`, ...; `delta` is +1 or -1.
    Increment {
        target: Target,
        delta: i64,
        prefix: bool,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Assign {
        op: AssignOp,
        target: Target,
        value: Box<Node>,
    },
    Sequence {
        op: SequenceOp,
        items: Vec<Node>,
    },
    Conditional {
        condition: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    /// `var[start, step -> end)(body)`; `]` makes the end inclusive.
    ForLoop {
        variable: VariableNode,
        start: Box<Node>,
        step: Option<Box<Node>>,
        end: Box<Node>,
        inclusive: bool,
        body: Box<Node>,
    },
    FunctionCall {
        name: String,
        args: Vec<Node>,
    },
    SystemCall {
        call: SystemCall,
        args: Vec<Node>,
    },
}

impl Node {
    #[must_use]
    pub const fn as_leaf(&self) -> Option<&KnowledgeRecord> {
        match self {
            Self::Leaf(record) => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Replaces this node with `Leaf(Uncreated)` and returns the old node.
    pub(crate) fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Leaf(KnowledgeRecord::uncreated()))
    }
}
