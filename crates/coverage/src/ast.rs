//! Low-fidelity model of the compiler's AST.
//!
//! The AST is consumed dynamically: a node keeps its `nodeType`, its `src`
//! range and a bag of untyped attributes, and the walker pulls typed
//! children out with [`AstNode::attribute`]. This tolerates every compiler
//! version at the cost of per-access deserialization.

use crate::sourcemap::SourceRange;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// One source file as the compiler saw it.
#[derive(Clone, Debug)]
pub struct CompilerSource {
    /// Workspace-relative path, or a `#`-prefixed synthetic name for
    /// compiler-generated sources.
    pub path: String,
    pub content: Arc<str>,
    pub ast: Arc<AstNode>,
    /// The compiler's source id within one compilation.
    pub id: u32,
}

/// A single AST node.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AstNode {
    #[serde(default)]
    pub id: Option<u64>,
    pub node_type: NodeType,
    #[serde(deserialize_with = "src_from_str", default)]
    pub src: SourceRange,
    /// Child nodes of definition-level containers (`SourceUnit`,
    /// `ContractDefinition`).
    #[serde(default)]
    pub nodes: Vec<AstNode>,
    /// The body of functions, loops and Yul constructs.
    #[serde(default)]
    pub body: Option<Box<AstNode>>,
    /// Every other attribute, decoded on demand.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

impl AstNode {
    /// Deserializes the attribute `key` into `T`, if present and well-typed.
    pub fn attribute<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.other.get(key).and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Returns the child node stored under `key`.
    pub fn child(&self, key: &str) -> Option<AstNode> {
        self.attribute(key)
    }

    /// Returns the list of child nodes stored under `key`, dropping `null`
    /// slots (the compiler emits them for elided tuple components and
    /// declarations).
    pub fn children(&self, key: &str) -> Vec<AstNode> {
        self.attribute::<Vec<Option<AstNode>>>(key)
            .map(|nodes| nodes.into_iter().flatten().collect())
            .unwrap_or_default()
    }
}

fn src_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SourceRange, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

macro_rules! node_types {
    ($($variant:ident),* $(,)?) => {
        /// The node kinds the coverage walker distinguishes.
        ///
        /// Everything else deserializes to [`NodeType::Unknown`], which the
        /// walker reports as a diagnostic and treats as a leaf.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum NodeType {
            $($variant,)*
            Unknown(String),
        }

        impl NodeType {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => stringify!($variant),)*
                    Self::Unknown(name) => name,
                }
            }
        }

        impl From<String> for NodeType {
            fn from(name: String) -> Self {
                match name.as_str() {
                    $(stringify!($variant) => Self::$variant,)*
                    _ => Self::Unknown(name),
                }
            }
        }
    };
}

node_types! {
    Assignment,
    BinaryOperation,
    Block,
    Break,
    Conditional,
    Continue,
    ContractDefinition,
    ElementaryTypeNameExpression,
    EmitStatement,
    EnumDefinition,
    ErrorDefinition,
    EventDefinition,
    ExpressionStatement,
    ForStatement,
    FunctionCall,
    FunctionCallOptions,
    FunctionDefinition,
    Identifier,
    IfStatement,
    ImportDirective,
    IndexAccess,
    InlineAssembly,
    Literal,
    MemberAccess,
    ModifierDefinition,
    NewExpression,
    ParameterList,
    PlaceholderStatement,
    PragmaDirective,
    Return,
    RevertStatement,
    SourceUnit,
    StructDefinition,
    TryCatchClause,
    TryStatement,
    TupleExpression,
    UncheckedBlock,
    UnaryOperation,
    VariableDeclaration,
    VariableDeclarationStatement,
    YulAssignment,
    YulBlock,
    YulBreak,
    YulCase,
    YulExpressionStatement,
    YulForLoop,
    YulFunctionCall,
    YulFunctionDefinition,
    YulIdentifier,
    YulIf,
    YulLeave,
    YulLiteral,
    YulSwitch,
    YulTypedName,
    YulVariableDeclaration,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}
