//! XPath 1.0 subset over scraper documents
//!
//! Supported: absolute and relative location paths, `//`, `.`, `..`,
//! `@name`, `@*`, `*`, `text()`, `node()`, unions with `|`, and predicates
//! built from positions, `last()`, `position()`, comparisons, `and`/`or`,
//! `not()`, `contains()`, `starts-with()`, `normalize-space()`, `string()`
//! and `count()`.

use std::collections::{HashMap, HashSet};

use ego_tree::{NodeId, NodeRef};
use scraper::{Html, Node};

#[derive(Debug, thiserror::Error)]
#[error("invalid XPath expression {expr:?}: {reason}")]
pub struct XPathError {
    pub expr: String,
    pub reason: String,
}

/// One selected item
#[derive(Debug, Clone, PartialEq)]
pub enum XPathItem {
    Element(NodeId),
    Attribute { name: String, value: String },
    Text(String),
}

/// Evaluate `expr` against `doc` with `context` as the context node
pub fn evaluate(doc: &Html, context: NodeId, expr: &str) -> Result<Vec<XPathItem>, XPathError> {
    let fail = |reason: String| XPathError {
        expr: expr.to_string(),
        reason,
    };

    let tokens = tokenize(expr).map_err(fail)?;
    if tokens.len() > MAX_TOKENS {
        return Err(fail(format!("expression longer than {} tokens", MAX_TOKENS)));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let parsed = parser.parse_expr().map_err(fail)?;
    if let Some(token) = parser.peek() {
        return Err(fail(format!("unexpected token {:?}", token)));
    }

    let eval = Evaluator::new(doc);
    let ctx = Ctx {
        item: Item::Node(context),
        position: 1,
        size: 1,
    };
    match eval.eval(&parsed, &ctx) {
        Val::Nodes(items) => Ok(items
            .into_iter()
            .filter_map(|item| eval.export(item))
            .collect()),
        _ => Err(fail("expression does not select nodes".to_string())),
    }
}

// --- tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Star,
    Pipe,
    Comma,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Op(CmpOp),
    Name(String),
    Literal(String),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Tok>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                tokens.push(Tok::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Tok::Slash);
                i += 1;
            }
            '.' if next == Some('.') => {
                tokens.push(Tok::DotDot);
                i += 2;
            }
            '.' if next.map_or(false, |n| n.is_ascii_digit()) => {
                let (number, end) = read_number(&chars, i)?;
                tokens.push(Tok::Number(number));
                i = end;
            }
            '.' => {
                tokens.push(Tok::Dot);
                i += 1;
            }
            '@' => {
                tokens.push(Tok::At);
                i += 1;
            }
            '*' => {
                tokens.push(Tok::Star);
                i += 1;
            }
            '|' => {
                tokens.push(Tok::Pipe);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '[' => {
                tokens.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Tok::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Tok::Op(CmpOp::Eq));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Tok::Op(CmpOp::Ne));
                i += 2;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Tok::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Tok::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let (number, end) = read_number(&chars, i)?;
                tokens.push(Tok::Number(number));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '-' || chars[i] == '_')
                {
                    i += 1;
                }
                tokens.push(Tok::Name(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {:?}", other)),
        }
    }

    Ok(tokens)
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut end = start;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
        end += 1;
    }
    let text: String = chars[start..end].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, end))
        .map_err(|_| format!("invalid number {:?}", text))
}

// --- parser ---

#[derive(Debug)]
enum Expr {
    Path(Path),
    Union(Vec<Expr>),
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Literal(String),
    Number(f64),
    Call(String, Vec<Expr>),
}

#[derive(Debug)]
struct Path {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Attribute,
    SelfNode,
    Parent,
    DescendantOrSelf,
}

#[derive(Debug)]
enum NodeTest {
    Name(String),
    Any,
    Text,
    Node,
}

/// Deepest nesting of parenthesized expressions, calls and predicates
const MAX_DEPTH: usize = 64;
/// Bounds the height of `and`/`or` chains, which nest without brackets
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Tok> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Tok) -> Result<(), String> {
        match self.next() {
            Some(ref token) if *token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of expression", expected)),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Tok::Name(name)) if name == keyword)
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("expression nested deeper than {} levels", MAX_DEPTH));
        }
        self.depth += 1;
        let expr = self.parse_or();
        self.depth -= 1;
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.is_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_cmp()?;
        while self.is_keyword("and") {
            self.pos += 1;
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, String> {
        let left = self.parse_union()?;
        if let Some(Tok::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_union()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_union(&mut self) -> Result<Expr, String> {
        let first = self.parse_primary()?;
        if self.peek() != Some(&Tok::Pipe) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.peek() == Some(&Tok::Pipe) {
            self.pos += 1;
            parts.push(self.parse_primary()?);
        }
        Ok(Expr::Union(parts))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Tok::Literal(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(Expr::Literal(s))
            }
            Some(Tok::Number(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Expr::Number(n))
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Name(name))
                if self.peek_at(1) == Some(&Tok::LParen) && name != "text" && name != "node" =>
            {
                let name = name.clone();
                self.pos += 2;
                let mut args = Vec::new();
                if self.peek() != Some(&Tok::RParen) {
                    args.push(self.parse_expr()?);
                    while self.peek() == Some(&Tok::Comma) {
                        self.pos += 1;
                        args.push(self.parse_expr()?);
                    }
                }
                self.expect(Tok::RParen)?;
                Ok(Expr::Call(name, args))
            }
            Some(_) => Ok(Expr::Path(self.parse_path()?)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_path(&mut self) -> Result<Path, String> {
        let mut path = Path {
            absolute: false,
            steps: Vec::new(),
        };

        match self.peek() {
            Some(Tok::Slash) => {
                self.pos += 1;
                path.absolute = true;
                // A lone "/" selects the document
                if !self.at_step_start() {
                    return Ok(path);
                }
            }
            Some(Tok::DoubleSlash) => {
                self.pos += 1;
                path.absolute = true;
                path.steps.push(descendant_or_self());
            }
            _ => {}
        }
        path.steps.push(self.parse_step()?);

        loop {
            match self.peek() {
                Some(Tok::Slash) => {
                    self.pos += 1;
                }
                Some(Tok::DoubleSlash) => {
                    self.pos += 1;
                    path.steps.push(descendant_or_self());
                }
                _ => break,
            }
            path.steps.push(self.parse_step()?);
        }

        Ok(path)
    }

    fn at_step_start(&self) -> bool {
        matches!(
            self.peek(),
            Some(Tok::Dot | Tok::DotDot | Tok::At | Tok::Star | Tok::Name(_))
        )
    }

    fn parse_step(&mut self) -> Result<Step, String> {
        let (axis, test) = match self.next() {
            Some(Tok::Dot) => (Axis::SelfNode, NodeTest::Node),
            Some(Tok::DotDot) => (Axis::Parent, NodeTest::Node),
            Some(Tok::At) => match self.next() {
                Some(Tok::Name(name)) => (Axis::Attribute, NodeTest::Name(name)),
                Some(Tok::Star) => (Axis::Attribute, NodeTest::Any),
                other => return Err(format!("expected attribute name, found {:?}", other)),
            },
            Some(Tok::Star) => (Axis::Child, NodeTest::Any),
            Some(Tok::Name(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    self.expect(Tok::RParen)?;
                    match name.as_str() {
                        "text" => (Axis::Child, NodeTest::Text),
                        "node" => (Axis::Child, NodeTest::Node),
                        other => return Err(format!("unsupported node test {}()", other)),
                    }
                } else {
                    (Axis::Child, NodeTest::Name(name))
                }
            }
            Some(token) => return Err(format!("unexpected token {:?}", token)),
            None => return Err("expected a location step".to_string()),
        };

        let mut predicates = Vec::new();
        while self.peek() == Some(&Tok::LBracket) {
            self.pos += 1;
            predicates.push(self.parse_expr()?);
            self.expect(Tok::RBracket)?;
        }

        Ok(Step {
            axis,
            test,
            predicates,
        })
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::Node,
        predicates: Vec::new(),
    }
}

// --- evaluation ---

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Node(NodeId),
    Attr {
        owner: NodeId,
        name: String,
        value: String,
    },
}

#[derive(Debug)]
enum Val {
    Nodes(Vec<Item>),
    Str(String),
    Num(f64),
    Bool(bool),
}

struct Ctx {
    item: Item,
    position: usize,
    size: usize,
}

struct Evaluator<'a> {
    doc: &'a Html,
    order: HashMap<NodeId, usize>,
}

impl<'a> Evaluator<'a> {
    fn new(doc: &'a Html) -> Self {
        let order = doc
            .tree
            .root()
            .descendants()
            .enumerate()
            .map(|(i, node)| (node.id(), i))
            .collect();
        Self { doc, order }
    }

    fn node(&self, id: NodeId) -> Option<NodeRef<'a, Node>> {
        self.doc.tree.get(id)
    }

    fn export(&self, item: Item) -> Option<XPathItem> {
        match item {
            Item::Attr { name, value, .. } => Some(XPathItem::Attribute { name, value }),
            Item::Node(id) => match self.node(id)?.value() {
                Node::Text(text) => Some(XPathItem::Text(text.to_string())),
                Node::Element(_) | Node::Document | Node::Fragment => Some(XPathItem::Element(id)),
                _ => None,
            },
        }
    }

    fn eval(&self, expr: &Expr, ctx: &Ctx) -> Val {
        match expr {
            Expr::Literal(s) => Val::Str(s.clone()),
            Expr::Number(n) => Val::Num(*n),
            Expr::Path(path) => Val::Nodes(self.eval_path(path, &ctx.item)),
            Expr::Union(parts) => {
                let mut items = Vec::new();
                for part in parts {
                    if let Val::Nodes(found) = self.eval(part, ctx) {
                        items.extend(found);
                    }
                }
                Val::Nodes(self.sort_unique(items))
            }
            Expr::Or(a, b) => Val::Bool(self.to_bool(self.eval(a, ctx)) || self.to_bool(self.eval(b, ctx))),
            Expr::And(a, b) => Val::Bool(self.to_bool(self.eval(a, ctx)) && self.to_bool(self.eval(b, ctx))),
            Expr::Cmp(op, a, b) => Val::Bool(self.compare(*op, self.eval(a, ctx), self.eval(b, ctx))),
            Expr::Call(name, args) => self.call(name, args, ctx),
        }
    }

    fn call(&self, name: &str, args: &[Expr], ctx: &Ctx) -> Val {
        let arg_str = |i: usize| -> String {
            match args.get(i) {
                Some(arg) => self.to_string(self.eval(arg, ctx)),
                None => self.string_value(&ctx.item),
            }
        };
        match name {
            "last" => Val::Num(ctx.size as f64),
            "position" => Val::Num(ctx.position as f64),
            "not" => Val::Bool(!args.first().map_or(false, |a| self.to_bool(self.eval(a, ctx)))),
            "true" => Val::Bool(true),
            "false" => Val::Bool(false),
            "contains" => Val::Bool(arg_str(0).contains(&arg_str(1))),
            "starts-with" => Val::Bool(arg_str(0).starts_with(&arg_str(1))),
            "normalize-space" => Val::Str(arg_str(0).split_whitespace().collect::<Vec<_>>().join(" ")),
            "string" => Val::Str(arg_str(0)),
            "string-length" => Val::Num(arg_str(0).chars().count() as f64),
            "count" => match args.first().map(|a| self.eval(a, ctx)) {
                Some(Val::Nodes(items)) => Val::Num(items.len() as f64),
                _ => Val::Num(0.0),
            },
            // Unknown functions select nothing
            _ => Val::Nodes(Vec::new()),
        }
    }

    fn eval_path(&self, path: &Path, start: &Item) -> Vec<Item> {
        let mut current = if path.absolute {
            vec![Item::Node(self.doc.tree.root().id())]
        } else {
            vec![start.clone()]
        };

        for step in &path.steps {
            let mut next = Vec::new();
            for item in &current {
                let candidates = self.apply_axis(step, item);
                next.extend(self.filter_predicates(candidates, &step.predicates));
            }
            current = self.sort_unique(next);
        }
        current
    }

    fn apply_axis(&self, step: &Step, item: &Item) -> Vec<Item> {
        let id = match item {
            Item::Node(id) => *id,
            Item::Attr { owner, .. } => {
                return match step.axis {
                    Axis::SelfNode => vec![item.clone()],
                    Axis::Parent => vec![Item::Node(*owner)],
                    _ => Vec::new(),
                };
            }
        };
        let node = match self.node(id) {
            Some(node) => node,
            None => return Vec::new(),
        };

        match step.axis {
            Axis::Child => node
                .children()
                .filter(|child| self.matches(&step.test, child))
                .map(|child| Item::Node(child.id()))
                .collect(),
            Axis::SelfNode => {
                if self.matches(&step.test, &node) {
                    vec![Item::Node(id)]
                } else {
                    Vec::new()
                }
            }
            Axis::Parent => node
                .parent()
                .filter(|parent| self.matches(&step.test, parent))
                .map(|parent| vec![Item::Node(parent.id())])
                .unwrap_or_default(),
            Axis::DescendantOrSelf => node
                .descendants()
                .filter(|n| self.matches(&step.test, n))
                .map(|n| Item::Node(n.id()))
                .collect(),
            Axis::Attribute => match node.value() {
                Node::Element(element) => element
                    .attrs()
                    .filter(|(name, _)| match &step.test {
                        NodeTest::Name(wanted) => name.eq_ignore_ascii_case(wanted),
                        NodeTest::Any | NodeTest::Node => true,
                        NodeTest::Text => false,
                    })
                    .map(|(name, value)| Item::Attr {
                        owner: id,
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                    .collect(),
                _ => Vec::new(),
            },
        }
    }

    fn matches(&self, test: &NodeTest, node: &NodeRef<'_, Node>) -> bool {
        match (test, node.value()) {
            (NodeTest::Node, _) => true,
            (NodeTest::Text, Node::Text(_)) => true,
            (NodeTest::Any, Node::Element(_)) => true,
            (NodeTest::Name(name), Node::Element(element)) => element.name().eq_ignore_ascii_case(name),
            _ => false,
        }
    }

    fn filter_predicates(&self, mut items: Vec<Item>, predicates: &[Expr]) -> Vec<Item> {
        for predicate in predicates {
            let size = items.len();
            items = items
                .into_iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    let ctx = Ctx {
                        item,
                        position: i + 1,
                        size,
                    };
                    let keep = match self.eval(predicate, &ctx) {
                        Val::Num(n) => n == ctx.position as f64,
                        other => self.to_bool(other),
                    };
                    keep.then_some(ctx.item)
                })
                .collect();
        }
        items
    }

    fn sort_unique(&self, items: Vec<Item>) -> Vec<Item> {
        let mut seen = HashSet::new();
        let mut unique: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                let key = match item {
                    Item::Node(id) => (*id, None),
                    Item::Attr { owner, name, .. } => (*owner, Some(name.clone())),
                };
                seen.insert(key)
            })
            .collect();

        unique.sort_by_key(|item| match item {
            Item::Node(id) => (self.order.get(id).copied().unwrap_or(usize::MAX), 0),
            Item::Attr { owner, .. } => (self.order.get(owner).copied().unwrap_or(usize::MAX), 1),
        });
        unique
    }

    fn string_value(&self, item: &Item) -> String {
        match item {
            Item::Attr { value, .. } => value.clone(),
            Item::Node(id) => match self.node(*id) {
                Some(node) => match node.value() {
                    Node::Text(text) => text.to_string(),
                    Node::Comment(comment) => comment.to_string(),
                    _ => node
                        .descendants()
                        .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
                        .collect(),
                },
                None => String::new(),
            },
        }
    }

    fn to_string(&self, val: Val) -> String {
        match val {
            Val::Str(s) => s,
            Val::Num(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", n as i64),
            Val::Num(n) => n.to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Nodes(items) => items.first().map(|i| self.string_value(i)).unwrap_or_default(),
        }
    }

    fn to_bool(&self, val: Val) -> bool {
        match val {
            Val::Bool(b) => b,
            Val::Num(n) => n != 0.0 && !n.is_nan(),
            Val::Str(s) => !s.is_empty(),
            Val::Nodes(items) => !items.is_empty(),
        }
    }

    fn compare(&self, op: CmpOp, left: Val, right: Val) -> bool {
        match (left, right) {
            (Val::Nodes(items), other) => {
                let other = self.scalar(other);
                items
                    .iter()
                    .any(|item| compare_scalars(op, &Val::Str(self.string_value(item)), &other))
            }
            (other, Val::Nodes(items)) => {
                let other = self.scalar(other);
                items
                    .iter()
                    .any(|item| compare_scalars(op, &other, &Val::Str(self.string_value(item))))
            }
            (a, b) => compare_scalars(op, &a, &b),
        }
    }

    fn scalar(&self, val: Val) -> Val {
        match val {
            Val::Nodes(_) => Val::Str(self.to_string(val)),
            other => other,
        }
    }
}

fn to_number(val: &Val) -> f64 {
    match val {
        Val::Num(n) => *n,
        Val::Bool(b) => f64::from(u8::from(*b)),
        Val::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
        Val::Nodes(_) => f64::NAN,
    }
}

fn compare_scalars(op: CmpOp, a: &Val, b: &Val) -> bool {
    match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (a, b) {
                (Val::Bool(x), y) | (y, Val::Bool(x)) => *x == bool_of(y),
                (Val::Num(_), _) | (_, Val::Num(_)) => to_number(a) == to_number(b),
                (Val::Str(x), Val::Str(y)) => x == y,
                _ => false,
            };
            if op == CmpOp::Eq {
                equal
            } else {
                !equal
            }
        }
        CmpOp::Lt => to_number(a) < to_number(b),
        CmpOp::Le => to_number(a) <= to_number(b),
        CmpOp::Gt => to_number(a) > to_number(b),
        CmpOp::Ge => to_number(a) >= to_number(b),
    }
}

fn bool_of(val: &Val) -> bool {
    match val {
        Val::Bool(b) => *b,
        Val::Num(n) => *n != 0.0 && !n.is_nan(),
        Val::Str(s) => !s.is_empty(),
        Val::Nodes(items) => !items.is_empty(),
    }
}
