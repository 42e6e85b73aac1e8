//! AST -> syntax-table projection.
//!
//! For each source file the walker produces a [`SyntaxTable`]: a per-byte
//! list of coverage features (the line feature always first) plus the
//! branch, function and statement descriptors the report format exposes.
//! Hit attribution later walks an opcode's source range and tallies the
//! features it finds.

use crate::ast::{AstNode, NodeType};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A 1-based line / 0-based column pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// An inclusive start/end location pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Loc {
    pub start: Position,
    pub end: Position,
}

/// One branch point and its alternatives' locations.
#[derive(Clone, Debug, Serialize)]
pub struct BranchDesc {
    pub line: u32,
    /// `"if"`, `"switch"`, or the node kind for `&&`/`||` operations.
    #[serde(rename = "type")]
    pub kind: String,
    pub locations: Vec<Loc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FunctionDesc {
    pub name: String,
    pub line: u32,
    pub loc: Loc,
    #[serde(skip_serializing_if = "is_false")]
    pub skip: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatementDesc {
    pub start: Position,
    pub end: Position,
    /// Declaration-like statements are kept for attribution but do not make
    /// a line significant.
    #[serde(skip_serializing_if = "is_false")]
    pub skip: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A coverage feature installed at one source byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    Line { line: u32 },
    Branch { id: u32, alt: u32 },
    Function { id: u32 },
    Statement { id: u32 },
}

/// The per-source coverage geometry.
#[derive(Clone, Debug, Default)]
pub struct SyntaxTable {
    /// Features per source byte; index 0 is always the line feature.
    pub features: Vec<Vec<Feature>>,
    positions: Vec<Position>,
    pub branch_map: BTreeMap<u32, BranchDesc>,
    pub fn_map: BTreeMap<u32, FunctionDesc>,
    pub statement_map: BTreeMap<u32, StatementDesc>,
    line_count: u32,
}

impl SyntaxTable {
    /// Builds the table for one source file from its content and AST.
    pub fn build(content: &str, ast: &AstNode) -> Self {
        let mut positions = Vec::with_capacity(content.len());
        let mut features = Vec::with_capacity(content.len());
        let (mut line, mut column) = (1u32, 0u32);
        for byte in content.bytes() {
            positions.push(Position { line, column });
            features.push(vec![Feature::Line { line }]);
            if byte == b'\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }

        let line_count = positions.last().map_or(0, |p| p.line);
        let mut builder = TableBuilder {
            table: Self {
                features,
                positions,
                branch_map: BTreeMap::new(),
                fn_map: BTreeMap::new(),
                statement_map: BTreeMap::new(),
                line_count,
            },
            branch_seq: 0,
            fn_seq: 0,
            stmt_seq: 0,
        };
        builder.walk(ast);
        builder.table
    }

    /// The position of `offset`, clamped to the source end.
    pub fn position_at(&self, offset: usize) -> Position {
        match self.positions.get(offset) {
            Some(position) => *position,
            None => self.positions.last().copied().unwrap_or(Position { line: 1, column: 0 }),
        }
    }

    /// Number of lines in the source.
    pub fn line_count(&self) -> u32 {
        self.line_count
    }

    /// Lines carrying at least one significant feature: a branch, a
    /// non-skip function or a non-skip statement.
    pub fn significant_lines(&self) -> BTreeSet<u32> {
        let mut lines = BTreeSet::new();
        for (offset, features) in self.features.iter().enumerate() {
            let significant = features.iter().any(|feature| match feature {
                Feature::Branch { .. } => true,
                Feature::Function { id } => self.fn_map.get(id).is_some_and(|f| !f.skip),
                Feature::Statement { id } => self.statement_map.get(id).is_some_and(|s| !s.skip),
                Feature::Line { .. } => false,
            });
            if significant {
                lines.insert(self.positions[offset].line);
            }
        }
        lines
    }

    fn loc_of(&self, start: usize, length: usize) -> Loc {
        Loc {
            start: self.position_at(start),
            end: self.position_at(start + length.saturating_sub(1)),
        }
    }
}

struct TableBuilder {
    table: SyntaxTable,
    branch_seq: u32,
    fn_seq: u32,
    stmt_seq: u32,
}

impl TableBuilder {
    /// Walks the AST iteratively; deeply nested sources must not exhaust
    /// the call stack.
    fn walk(&mut self, root: &AstNode) {
        let mut work = vec![root.clone()];
        while let Some(node) = work.pop() {
            let mut children = self.visit(&node);
            children.reverse();
            work.append(&mut children);
        }
    }

    /// Installs this node's features and returns the children to walk.
    fn visit(&mut self, node: &AstNode) -> Vec<AstNode> {
        match &node.node_type {
            NodeType::BinaryOperation => {
                let left = node.child("leftExpression");
                let right = node.child("rightExpression");
                let operator: String = node.attribute("operator").unwrap_or_default();
                if matches!(operator.as_str(), "&&" | "||") {
                    let alternatives: Vec<AstNode> =
                        left.iter().chain(right.iter()).cloned().collect();
                    self.install_branch(node, node.node_type.as_str(), &alternatives);
                } else {
                    self.install_statement(node, false);
                }
                left.into_iter().chain(right).collect()
            }
            NodeType::Conditional => {
                let condition = node.child("condition");
                let alternatives: Vec<AstNode> = ["trueExpression", "falseExpression"]
                    .iter()
                    .filter_map(|key| node.child(key))
                    .collect();
                self.install_branch(node, "if", &alternatives);
                condition.into_iter().chain(alternatives).collect()
            }
            NodeType::IfStatement => {
                let condition = node.child("condition");
                let alternatives: Vec<AstNode> =
                    ["trueBody", "falseBody"].iter().filter_map(|key| node.child(key)).collect();
                self.install_branch(node, "if", &alternatives);
                condition.into_iter().chain(alternatives).collect()
            }
            NodeType::YulIf => {
                let body = node.body.as_deref().cloned().or_else(|| node.child("body"));
                let condition = node.child("condition");
                let alternatives: Vec<AstNode> =
                    body.into_iter().chain(condition).collect();
                self.install_branch(node, "if", &alternatives);
                alternatives
            }
            NodeType::YulSwitch => {
                let expression = node.child("expression");
                let cases = node.children("cases");
                self.install_branch(node, "switch", &cases);
                expression.into_iter().chain(cases).collect()
            }
            NodeType::ContractDefinition => {
                self.install_statement(node, true);
                node.nodes.clone()
            }
            NodeType::FunctionDefinition
            | NodeType::ModifierDefinition
            | NodeType::YulFunctionDefinition => {
                let body = node.body.as_deref().cloned().or_else(|| node.child("body"));
                if body.is_some() {
                    self.install_function(node);
                } else {
                    self.install_statement(node, true);
                }
                let mut children = Vec::new();
                if matches!(node.node_type, NodeType::YulFunctionDefinition) {
                    children.extend(node.children("parameters"));
                    children.extend(node.children("returnVariables"));
                } else {
                    children.extend(node.child("parameters"));
                    children.extend(node.child("returnParameters"));
                }
                children.extend(body);
                children
            }
            NodeType::Assignment => self.statement_with(node, &["leftHandSide", "rightHandSide"]),
            NodeType::IndexAccess => {
                self.statement_with(node, &["baseExpression", "indexExpression"])
            }
            NodeType::MemberAccess => self.statement_with(node, &["expression"]),
            NodeType::Return => self.statement_with(node, &["expression"]),
            NodeType::EmitStatement => self.statement_with(node, &["eventCall"]),
            NodeType::RevertStatement => self.statement_with(node, &["errorCall"]),
            NodeType::UnaryOperation => self.statement_with(node, &["subExpression"]),
            NodeType::VariableDeclaration => self.statement_with(node, &["value"]),
            NodeType::YulAssignment => self.statement_with(node, &["value"]),
            NodeType::YulExpressionStatement => self.statement_with(node, &["expression"]),
            NodeType::YulVariableDeclaration => self.statement_with(node, &["value"]),
            NodeType::Break
            | NodeType::Continue
            | NodeType::Identifier
            | NodeType::NewExpression
            | NodeType::PlaceholderStatement
            | NodeType::YulBreak
            | NodeType::YulIdentifier
            | NodeType::YulLeave
            | NodeType::YulTypedName => {
                self.install_statement(node, false);
                Vec::new()
            }
            NodeType::ParameterList
            | NodeType::ElementaryTypeNameExpression
            | NodeType::EnumDefinition
            | NodeType::EventDefinition
            | NodeType::ErrorDefinition
            | NodeType::StructDefinition
            | NodeType::FunctionCallOptions
            | NodeType::Literal
            | NodeType::YulLiteral => {
                self.install_statement(node, true);
                Vec::new()
            }
            NodeType::FunctionCall => {
                let mut children: Vec<AstNode> = node.child("expression").into_iter().collect();
                children.extend(node.children("arguments"));
                children
            }
            NodeType::YulFunctionCall => {
                let mut children: Vec<AstNode> = node.child("functionName").into_iter().collect();
                children.extend(node.children("arguments"));
                children
            }
            NodeType::Block | NodeType::UncheckedBlock | NodeType::YulBlock => {
                node.children("statements")
            }
            NodeType::InlineAssembly => node.child("AST").into_iter().collect(),
            NodeType::ExpressionStatement => node.child("expression").into_iter().collect(),
            NodeType::ForStatement => {
                let mut children: Vec<AstNode> =
                    ["initializationExpression", "condition", "loopExpression"]
                        .iter()
                        .filter_map(|key| node.child(key))
                        .collect();
                children.extend(node.body.as_deref().cloned());
                children
            }
            NodeType::YulForLoop => {
                let mut children: Vec<AstNode> = ["pre", "condition", "post"]
                    .iter()
                    .filter_map(|key| node.child(key))
                    .collect();
                children.extend(node.body.as_deref().cloned());
                children
            }
            NodeType::TryStatement => {
                let mut children: Vec<AstNode> = node.child("externalCall").into_iter().collect();
                children.extend(node.children("clauses"));
                children
            }
            NodeType::TryCatchClause => node.child("block").into_iter().collect(),
            NodeType::TupleExpression => node.children("components"),
            NodeType::VariableDeclarationStatement => {
                let mut children = node.children("declarations");
                children.extend(node.child("initialValue"));
                children
            }
            NodeType::YulCase => {
                // `value` is the literal `"default"` for the default case.
                let mut children: Vec<AstNode> = node.child("value").into_iter().collect();
                children.extend(node.body.as_deref().cloned());
                children
            }
            NodeType::SourceUnit => node.nodes.clone(),
            NodeType::ImportDirective | NodeType::PragmaDirective => Vec::new(),
            NodeType::Unknown(name) => {
                warn!(node = %name, "unknown AST node type");
                Vec::new()
            }
        }
    }

    fn statement_with(&mut self, node: &AstNode, keys: &[&str]) -> Vec<AstNode> {
        self.install_statement(node, false);
        keys.iter().filter_map(|key| node.child(key)).collect()
    }

    fn install_statement(&mut self, node: &AstNode, skip: bool) {
        if node.src.length == 0 {
            return;
        }
        let id = self.stmt_seq;
        self.stmt_seq += 1;
        let loc = self.table.loc_of(node.src.start, node.src.length);
        self.table.statement_map.insert(id, StatementDesc { start: loc.start, end: loc.end, skip });
        self.push_feature(node.src.start, Feature::Statement { id });
    }

    fn install_function(&mut self, node: &AstNode) {
        if node.src.length == 0 {
            return;
        }
        let name: String = node.attribute("name").unwrap_or_default();
        let id = self.fn_seq;
        self.fn_seq += 1;
        let loc = self.table.loc_of(node.src.start, node.src.length);
        self.table.fn_map.insert(
            id,
            FunctionDesc { name, line: loc.start.line, loc, skip: false },
        );
        self.push_feature(node.src.start, Feature::Function { id });
    }

    /// Installs one branch feature at *each alternative's* start byte; the
    /// branch node itself only determines the reported line.
    fn install_branch(&mut self, node: &AstNode, kind: &str, alternatives: &[AstNode]) {
        if alternatives.is_empty() {
            return;
        }
        let id = self.branch_seq;
        self.branch_seq += 1;
        let mut locations = Vec::with_capacity(alternatives.len());
        for (alt, alternative) in alternatives.iter().enumerate() {
            locations.push(self.table.loc_of(alternative.src.start, alternative.src.length));
            if alternative.src.length > 0 {
                self.push_feature(alternative.src.start, Feature::Branch { id, alt: alt as u32 });
            }
        }
        self.table.branch_map.insert(
            id,
            BranchDesc {
                line: self.table.position_at(node.src.start).line,
                kind: kind.to_string(),
                locations,
            },
        );
    }

    fn push_feature(&mut self, offset: usize, feature: Feature) {
        match self.table.features.get_mut(offset) {
            Some(features) => features.push(feature),
            // Generated-source maps may point past the synthetic content.
            None => debug!(offset, "feature offset beyond source end"),
        }
    }
}
