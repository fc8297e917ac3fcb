//! Recursive-descent KaRL parser.
//!
//! Precedence, lowest first: `;`/`;>`, `,`, `=>`, assignment, `?:`, `||`,
//! `&&`, equality, relational, additive, multiplicative, prefix, postfix,
//! primary. Variables are bound to context slots while parsing, so the
//! parser holds the context lock.
//!
//! Every `parse_*` method leaves the height of the node it returns in
//! `Parser::height`. A tree higher than [`MAX_NESTING_DEPTH`] is a compile
//! error, so evaluation, pruning and dropping recurse at most that deep.

use crate::context::{braces_balanced, ContextGuard, KnowledgeUpdateSettings};
use crate::error::{CompileError, CompileErrorKind};
use crate::record::ops::ArithOp;
use crate::record::KnowledgeRecord;

use super::ast::{AssignOp, BinaryOp, LogicalOp, Node, SequenceOp, Target, UnaryOp, VariableNode};
use super::lexer::{tokenize, Spanned, Token};
use super::system_calls::SystemCall;
use super::MAX_NESTING_DEPTH;

type ParseResult<T> = Result<T, CompileError>;

/// Bound on nested `operand` calls, which is the parser's own recursion.
const MAX_OPERAND_DEPTH: usize = 64;

/// Source text of an operator token, for diagnostics.
const fn symbol(token: &Token) -> Option<&'static str> {
    let s = match token {
        Token::Then => ";>",
        Token::Semi => ";",
        Token::Comma => ",",
        Token::Implies => "=>",
        Token::Assign => "=",
        Token::AddAssign => "+=",
        Token::SubAssign => "-=",
        Token::MulAssign => "*=",
        Token::DivAssign => "/=",
        Token::Question => "?",
        Token::Colon => ":",
        Token::Or => "||",
        Token::And => "&&",
        Token::Eq => "==",
        Token::Ne => "!=",
        Token::Lt => "<",
        Token::Le => "<=",
        Token::Gt => ">",
        Token::Ge => ">=",
        Token::Star => "*",
        Token::Slash => "/",
        Token::Percent => "%",
        Token::Arrow => "->",
        Token::RParen => ")",
        Token::RBracket => "]",
        _ => return None,
    };
    Some(s)
}

fn into_target(node: Node) -> Option<Target> {
    match node {
        Node::Variable(variable) => Some(Target::Variable(variable)),
        Node::ArrayElement { variable, index } => Some(Target::Element { variable, index }),
        _ => None,
    }
}

pub(crate) struct Parser<'s, 'g, 'a> {
    source: &'s str,
    tokens: Vec<Spanned>,
    pos: usize,
    guard: &'g mut ContextGuard<'a>,
    bind_settings: KnowledgeUpdateSettings,
    height: usize,
    depth: usize,
}

impl<'s, 'g, 'a> Parser<'s, 'g, 'a> {
    pub(crate) fn new(source: &'s str, guard: &'g mut ContextGuard<'a>) -> ParseResult<Self> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
            guard,
            bind_settings: KnowledgeUpdateSettings {
                expand_variables: false,
                ..KnowledgeUpdateSettings::default()
            },
            height: 0,
            depth: 0,
        })
    }

    /// Parses the whole input. Empty input compiles to an uncreated leaf.
    pub(crate) fn parse_program(mut self) -> ParseResult<Node> {
        if self.tokens.is_empty() {
            return Ok(Node::Leaf(KnowledgeRecord::uncreated()));
        }
        let node = self.parse_expr()?;
        if self.peek().is_some() {
            return Err(self.unexpected("end of input"));
        }
        Ok(node)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.source.len(), |s| s.span.start)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, expected: &'static str) -> ParseResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn error(&self, offset: usize, kind: CompileErrorKind) -> CompileError {
        CompileError::at(self.source, offset, kind)
    }

    fn too_deep(&self, offset: usize, max: usize) -> CompileError {
        self.error(offset, CompileErrorKind::NestingTooDeep { max })
    }

    fn unexpected(&self, expected: &'static str) -> CompileError {
        let kind = match self.tokens.get(self.pos) {
            Some(s) => CompileErrorKind::UnexpectedToken {
                found: self.source[s.span.clone()].to_string(),
                expected,
            },
            None => CompileErrorKind::UnexpectedEnd { expected },
        };
        self.error(self.offset(), kind)
    }

    /// Records the height of a node built over children at most `below`
    /// high.
    fn built(&mut self, below: usize, at: usize) -> ParseResult<()> {
        if below >= MAX_NESTING_DEPTH {
            return Err(self.too_deep(at, MAX_NESTING_DEPTH));
        }
        self.height = below + 1;
        Ok(())
    }

    /// True when nothing that can start an operand follows.
    fn at_operand_end(&self) -> bool {
        self.peek().map_or(true, |t| symbol(t).is_some())
    }

    /// True where a trailing `;` or `,` may end a sequence.
    fn at_sequence_end(&self) -> bool {
        matches!(self.peek(), None | Some(Token::RParen))
    }

    /// Parses the operand following `operator`, reporting a missing one.
    /// All parser recursion passes through here.
    fn operand(&mut self, operator: &'static str, parse: fn(&mut Self) -> ParseResult<Node>) -> ParseResult<Node> {
        if self.at_operand_end() {
            return Err(self.error(self.offset(), CompileErrorKind::MissingOperand { operator }));
        }
        if self.depth >= MAX_OPERAND_DEPTH {
            return Err(self.too_deep(self.offset(), MAX_OPERAND_DEPTH));
        }
        self.depth += 1;
        let node = parse(self);
        self.depth -= 1;
        node
    }

    /// Appends `rhs` (whose height is in `self.height`) to `lhs`, flattening
    /// runs of the same operator.
    fn push_sequence(
        &mut self,
        lhs: Node,
        lhs_height: usize,
        op: SequenceOp,
        rhs: Node,
        at: usize,
    ) -> ParseResult<Node> {
        let rhs_height = self.height;
        match lhs {
            Node::Sequence { op: existing, mut items } if existing == op => {
                self.built(rhs_height.max(lhs_height.saturating_sub(1)), at)?;
                items.push(rhs);
                Ok(Node::Sequence { op, items })
            }
            other => {
                self.built(rhs_height.max(lhs_height), at)?;
                Ok(Node::Sequence {
                    op,
                    items: vec![other, rhs],
                })
            }
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Node> {
        let mut node = self.parse_comma()?;
        loop {
            let op = match self.peek() {
                Some(Token::Semi) => SequenceOp::Both,
                Some(Token::Then) => SequenceOp::Then,
                _ => break,
            };
            let at = self.offset();
            self.bump();
            if self.at_sequence_end() {
                break;
            }
            let lhs_height = self.height;
            let rhs = self.operand(op.symbol(), Self::parse_comma)?;
            node = self.push_sequence(node, lhs_height, op, rhs, at)?;
        }
        Ok(node)
    }

    fn parse_comma(&mut self) -> ParseResult<Node> {
        let mut node = self.parse_implies()?;
        loop {
            let at = self.offset();
            if !self.eat(&Token::Comma) || self.at_sequence_end() {
                break;
            }
            let lhs_height = self.height;
            let rhs = self.operand(",", Self::parse_implies)?;
            node = self.push_sequence(node, lhs_height, SequenceOp::Comma, rhs, at)?;
        }
        Ok(node)
    }

    fn parse_implies(&mut self) -> ParseResult<Node> {
        let lhs = self.parse_assign()?;
        let at = self.offset();
        if self.eat(&Token::Implies) {
            let lhs_height = self.height;
            let rhs = self.operand("=>", Self::parse_implies)?;
            self.built(lhs_height.max(self.height), at)?;
            return Ok(Node::Logical {
                op: LogicalOp::Implies,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_assign(&mut self) -> ParseResult<Node> {
        let lhs = self.parse_ternary()?;
        let (op, text): (AssignOp, &'static str) = match self.peek() {
            Some(Token::Assign) => (None, "="),
            Some(Token::AddAssign) => (Some(ArithOp::Add), "+="),
            Some(Token::SubAssign) => (Some(ArithOp::Sub), "-="),
            Some(Token::MulAssign) => (Some(ArithOp::Mul), "*="),
            Some(Token::DivAssign) => (Some(ArithOp::Div), "/="),
            _ => return Ok(lhs),
        };
        let at = self.offset();
        self.bump();
        let lhs_height = self.height;
        let value = self.operand(text, Self::parse_assign)?;
        let target = into_target(lhs).ok_or_else(|| self.error(at, CompileErrorKind::InvalidAssignmentTarget))?;
        self.built(lhs_height.max(self.height), at)?;
        Ok(Node::Assign {
            op,
            target,
            value: Box::new(value),
        })
    }

    fn parse_ternary(&mut self) -> ParseResult<Node> {
        let condition = self.parse_or()?;
        let at = self.offset();
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let mut below = self.height;
        let then = self.operand("?", Self::parse_assign)?;
        below = below.max(self.height);
        self.expect(&Token::Colon, "':'")?;
        let otherwise = self.operand(":", Self::parse_assign)?;
        self.built(below.max(self.height), at)?;
        Ok(Node::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Node>,
        token: &Token,
        op: LogicalOp,
        text: &'static str,
    ) -> ParseResult<Node> {
        let mut lhs = next(self)?;
        loop {
            let at = self.offset();
            if !self.eat(token) {
                break;
            }
            let lhs_height = self.height;
            let rhs = self.operand(text, next)?;
            self.built(lhs_height.max(self.height), at)?;
            lhs = Node::Logical {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> ParseResult<Node> {
        self.logical_level(Self::parse_and, &Token::Or, LogicalOp::Or, "||")
    }

    fn parse_and(&mut self) -> ParseResult<Node> {
        self.logical_level(Self::parse_equality, &Token::And, LogicalOp::And, "&&")
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Node>,
        op_of: fn(&Token) -> Option<BinaryOp>,
    ) -> ParseResult<Node> {
        let mut lhs = next(self)?;
        while let Some(op) = self.peek().and_then(op_of) {
            let at = self.offset();
            self.bump();
            let lhs_height = self.height;
            let rhs = self.operand(op.symbol(), next)?;
            self.built(lhs_height.max(self.height), at)?;
            lhs = Node::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> ParseResult<Node> {
        self.binary_level(Self::parse_relational, |t| match t {
            Token::Eq => Some(BinaryOp::Eq),
            Token::Ne => Some(BinaryOp::Ne),
            _ => None,
        })
    }

    fn parse_relational(&mut self) -> ParseResult<Node> {
        self.binary_level(Self::parse_additive, |t| match t {
            Token::Lt => Some(BinaryOp::Lt),
            Token::Le => Some(BinaryOp::Le),
            Token::Gt => Some(BinaryOp::Gt),
            Token::Ge => Some(BinaryOp::Ge),
            _ => None,
        })
    }

    fn parse_additive(&mut self) -> ParseResult<Node> {
        self.binary_level(Self::parse_multiplicative, |t| match t {
            Token::Plus => Some(BinaryOp::Arith(ArithOp::Add)),
            Token::Minus => Some(BinaryOp::Arith(ArithOp::Sub)),
            _ => None,
        })
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Node> {
        self.binary_level(Self::parse_unary, |t| match t {
            Token::Star => Some(BinaryOp::Arith(ArithOp::Mul)),
            Token::Slash => Some(BinaryOp::Arith(ArithOp::Div)),
            Token::Percent => Some(BinaryOp::Arith(ArithOp::Rem)),
            _ => None,
        })
    }

    fn parse_unary(&mut self) -> ParseResult<Node> {
        let at = self.offset();
        let (op, text) = match self.peek() {
            Some(Token::Bang) => (UnaryOp::Not, "!"),
            Some(Token::Minus) => (UnaryOp::Negate, "-"),
            Some(Token::PlusPlus | Token::MinusMinus) => {
                let delta = if self.peek() == Some(&Token::PlusPlus) { 1 } else { -1 };
                self.bump();
                let operand = self.operand(if delta > 0 { "++" } else { "--" }, Self::parse_unary)?;
                let target =
                    into_target(operand).ok_or_else(|| self.error(at, CompileErrorKind::InvalidAssignmentTarget))?;
                self.built(self.height, at)?;
                return Ok(Node::Increment {
                    target,
                    delta,
                    prefix: true,
                });
            }
            _ => return self.parse_postfix(),
        };
        self.bump();
        let operand = self.operand(text, Self::parse_unary)?;
        self.built(self.height, at)?;
        Ok(Node::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> ParseResult<Node> {
        let mut node = self.parse_primary()?;
        loop {
            let delta = match self.peek() {
                Some(Token::PlusPlus) => 1,
                Some(Token::MinusMinus) => -1,
                _ => break,
            };
            let at = self.offset();
            self.bump();
            let target = into_target(node).ok_or_else(|| self.error(at, CompileErrorKind::InvalidAssignmentTarget))?;
            self.built(self.height, at)?;
            node = Node::Increment {
                target,
                delta,
                prefix: false,
            };
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> ParseResult<Node> {
        let at = self.offset();
        let Some(token) = self.peek().cloned() else {
            return Err(self.unexpected("expression"));
        };
        match token {
            Token::Integer(v) => {
                self.bump();
                self.built(0, at)?;
                Ok(Node::Leaf(KnowledgeRecord::from(v)))
            }
            Token::Double(v) => {
                self.bump();
                self.built(0, at)?;
                Ok(Node::Leaf(KnowledgeRecord::from(v)))
            }
            Token::Str(s) => {
                self.bump();
                self.built(0, at)?;
                Ok(Node::Leaf(KnowledgeRecord::from(s)))
            }
            Token::Ident(name) => {
                self.bump();
                self.parse_identifier(name, at)
            }
            Token::SystemCall(name) => {
                self.bump();
                self.parse_system_call(&name, at)
            }
            Token::LParen => {
                self.bump();
                let inner = self.operand("(", Self::parse_expr)?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                self.bump();
                let (items, below) = self.parse_list(&Token::RBracket, "']'")?;
                self.built(below, at)?;
                Ok(Node::ArrayLiteral(items))
            }
            other => match symbol(&other) {
                Some(operator) => Err(self.error(at, CompileErrorKind::MissingOperand { operator })),
                None => Err(self.unexpected("expression")),
            },
        }
    }

    /// Comma-separated items up to `close`; a trailing comma is allowed.
    /// Also returns the height of the tallest item.
    fn parse_list(&mut self, close: &Token, expected: &'static str) -> ParseResult<(Vec<Node>, usize)> {
        let mut items = Vec::new();
        let mut below = 0;
        if self.eat(close) {
            return Ok((items, below));
        }
        loop {
            items.push(self.operand(",", Self::parse_implies)?);
            below = below.max(self.height);
            if self.eat(&Token::Comma) {
                if self.eat(close) {
                    break;
                }
                continue;
            }
            self.expect(close, expected)?;
            break;
        }
        Ok((items, below))
    }

    fn bind(&mut self, key: String, at: usize) -> ParseResult<VariableNode> {
        if !braces_balanced(&key) {
            return Err(self.error(at, CompileErrorKind::UnbalancedBraces { key }));
        }
        let reference = if key.contains('{') {
            None
        } else {
            self.guard.get_ref(&key, &self.bind_settings)
        };
        Ok(VariableNode { key, reference })
    }

    fn parse_identifier(&mut self, name: String, at: usize) -> ParseResult<Node> {
        match self.peek() {
            Some(Token::LParen) => {
                self.bump();
                let (args, below) = self.parse_list(&Token::RParen, "')'")?;
                self.built(below, at)?;
                Ok(Node::FunctionCall { name, args })
            }
            Some(Token::LBracket) => {
                self.bump();
                let variable = self.bind(name, at)?;
                self.parse_bracket_suffix(variable, at)
            }
            _ => {
                let variable = self.bind(name, at)?;
                self.built(0, at)?;
                Ok(Node::Variable(variable))
            }
        }
    }

    /// After `name[`: an element access `name[i]` or a for loop
    /// `name[start, step -> end)(body)`.
    fn parse_bracket_suffix(&mut self, variable: VariableNode, at: usize) -> ParseResult<Node> {
        let first = self.operand("[", Self::parse_implies)?;
        let mut below = self.height;
        let step = match self.peek() {
            Some(Token::RBracket) => {
                self.bump();
                self.built(below, at)?;
                return Ok(Node::ArrayElement {
                    variable,
                    index: Box::new(first),
                });
            }
            Some(Token::Arrow) => None,
            Some(Token::Comma) => {
                self.bump();
                let step = self.operand(",", Self::parse_implies)?;
                below = below.max(self.height);
                if self.peek() != Some(&Token::Arrow) {
                    return Err(self.unexpected("'->'"));
                }
                Some(Box::new(step))
            }
            _ => return Err(self.unexpected("']', ',' or '->'")),
        };
        self.bump();
        let end = self.operand("->", Self::parse_implies)?;
        below = below.max(self.height);
        let inclusive = match self.peek() {
            Some(Token::RParen) => false,
            Some(Token::RBracket) => true,
            _ => return Err(self.unexpected("')' or ']'")),
        };
        self.bump();
        self.expect(&Token::LParen, "'(' before the loop body")?;
        let body = self.operand("(", Self::parse_expr)?;
        self.expect(&Token::RParen, "')'")?;
        self.built(below.max(self.height), at)?;
        Ok(Node::ForLoop {
            variable,
            start: Box::new(first),
            step,
            end: Box::new(end),
            inclusive,
            body: Box::new(body),
        })
    }

    fn parse_system_call(&mut self, name: &str, at: usize) -> ParseResult<Node> {
        let call = SystemCall::from_name(name).ok_or_else(|| {
            self.error(at, CompileErrorKind::UnknownSystemCall { name: name.to_string() })
        })?;
        let (args, below) = if self.eat(&Token::LParen) {
            self.parse_list(&Token::RParen, "')'")?
        } else {
            (Vec::new(), 0)
        };
        if !call.arity().contains(&args.len()) {
            return Err(self.error(at, CompileErrorKind::SystemCallArity {
                name: call.name(),
                expected: call.arity_text(),
                actual: args.len(),
            }));
        }
        self.built(below, at)?;
        Ok(Node::SystemCall { call, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadSafeContext;

    fn parse(source: &str) -> ParseResult<Node> {
        let ctx = ThreadSafeContext::new();
        let mut guard = ctx.lock();
        Parser::new(source, &mut guard)?.parse_program()
    }

    fn kind(source: &str) -> CompileErrorKind {
        parse(source).unwrap_err().kind
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let node = parse("1 + 2 * 3").unwrap();
        let Node::Binary { op, rhs, .. } = node else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Arith(ArithOp::Add));
        assert!(matches!(*rhs, Node::Binary { op: BinaryOp::Arith(ArithOp::Mul), .. }));
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let node = parse("a = b = 3").unwrap();
        let Node::Assign { value, .. } = node else {
            panic!("expected assign");
        };
        assert!(matches!(*value, Node::Assign { .. }));
    }

    #[test]
    fn test_sequences_flatten() {
        let node = parse("a = 1; b = 2; c = 3").unwrap();
        assert!(matches!(node, Node::Sequence { op: SequenceOp::Both, ref items } if items.len() == 3));
        let node = parse("a, b ;> c").unwrap();
        let Node::Sequence { op, items } = node else {
            panic!("expected sequence");
        };
        assert_eq!(op, SequenceOp::Then);
        assert!(matches!(items[0], Node::Sequence { op: SequenceOp::Comma, .. }));
    }

    #[test]
    fn test_trailing_separators_accepted() {
        assert!(parse("x = 1;").is_ok());
        assert!(parse("x = 1,").is_ok());
        assert!(parse("(x = 1;)").is_ok());
        assert!(parse("f(1, 2,)").is_ok());
    }

    #[test]
    fn test_implies_binds_looser_than_assignment() {
        let node = parse("x > 5 => y = 1").unwrap();
        let Node::Logical { op, rhs, .. } = node else {
            panic!("expected implies");
        };
        assert_eq!(op, LogicalOp::Implies);
        assert!(matches!(*rhs, Node::Assign { .. }));
    }

    #[test]
    fn test_variables_bind_references() {
        let node = parse("x").unwrap();
        let Node::Variable(v) = node else {
            panic!("expected variable");
        };
        assert_eq!(v.reference.as_ref().map(|r| r.name().to_string()), Some("x".to_string()));
        let Node::Variable(t) = parse("a{.i}").unwrap() else {
            panic!("expected variable");
        };
        assert!(t.is_template());
    }

    #[test]
    fn test_for_loop_forms() {
        let node = parse("i[0 -> 10)(x += i)").unwrap();
        assert!(matches!(node, Node::ForLoop { inclusive: false, step: None, .. }));
        let node = parse("i[10, -2 -> 0](x)").unwrap();
        assert!(matches!(node, Node::ForLoop { inclusive: true, step: Some(_), .. }));
    }

    #[test]
    fn test_array_element_and_literal() {
        assert!(matches!(parse("a[2]").unwrap(), Node::ArrayElement { .. }));
        assert!(matches!(parse("a[1] = 3").unwrap(), Node::Assign { target: Target::Element { .. }, .. }));
        assert!(matches!(parse("[1, 2.5, 3]").unwrap(), Node::ArrayLiteral(ref v) if v.len() == 3));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert_eq!(kind("3 = x"), CompileErrorKind::InvalidAssignmentTarget);
        assert_eq!(kind("(a + b) += 1"), CompileErrorKind::InvalidAssignmentTarget);
        assert_eq!(kind("++5"), CompileErrorKind::InvalidAssignmentTarget);
    }

    #[test]
    fn test_missing_operands() {
        assert_eq!(kind("x = "), CompileErrorKind::MissingOperand { operator: "=" });
        assert_eq!(kind("1 + * 2"), CompileErrorKind::MissingOperand { operator: "+" });
        assert_eq!(kind("; x"), CompileErrorKind::MissingOperand { operator: ";" });
        assert_eq!(kind("a ;; b"), CompileErrorKind::MissingOperand { operator: ";" });
    }

    #[test]
    fn test_system_call_checks() {
        assert!(matches!(kind("#nope(1)"), CompileErrorKind::UnknownSystemCall { .. }));
        let err = parse("#pow(1)").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::SystemCallArity {
            name: "pow",
            expected: "2",
            actual: 1,
        });
        assert!(parse("#get_time").is_ok());
    }

    #[test]
    fn test_unbalanced_braces() {
        assert!(matches!(kind("a{b = 1"), CompileErrorKind::UnbalancedBraces { .. }));
    }

    #[test]
    fn test_error_position() {
        let err = parse("x = 1;\ny = )").unwrap_err();
        assert_eq!((err.line, err.column), (2, 5));
    }

    #[test]
    fn test_empty_program() {
        assert_eq!(parse("").unwrap(), Node::Leaf(KnowledgeRecord::uncreated()));
        assert_eq!(parse("  // nothing").unwrap(), Node::Leaf(KnowledgeRecord::uncreated()));
    }

    #[test]
    fn test_long_chain_is_rejected_not_overflowed() {
        let sum = vec!["x"; 200_000].join(" + ");
        assert_eq!(kind(&sum), CompileErrorKind::NestingTooDeep { max: MAX_NESTING_DEPTH });
        let nested = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(kind(&nested), CompileErrorKind::NestingTooDeep { max: MAX_OPERAND_DEPTH });
        assert!(matches!(kind(&"!".repeat(10_000)), CompileErrorKind::NestingTooDeep { .. }));
        assert!(matches!(kind(&"a = ".repeat(10_000)), CompileErrorKind::NestingTooDeep { .. }));
    }

    #[test]
    fn test_nesting_within_limit_compiles() {
        let sum = vec!["x"; MAX_NESTING_DEPTH].join(" + ");
        assert!(parse(&sum).is_ok());
        let nested = format!("{}1{}", "(".repeat(MAX_OPERAND_DEPTH - 1), ")".repeat(MAX_OPERAND_DEPTH - 1));
        assert!(parse(&nested).is_ok());
        let statements = vec!["x = 1"; 10_000].join("; ");
        assert!(matches!(parse(&statements).unwrap(), Node::Sequence { ref items, .. } if items.len() == 10_000));
    }

    #[test]
    fn test_unclosed_paren() {
        assert!(matches!(kind("(1 + 2"), CompileErrorKind::UnexpectedEnd { .. }));
    }
}
