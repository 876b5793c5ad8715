//! Rule-catalogue XML: reads `<typeknowledge>` rule files into
//! [`crate::rules::TypeRule`] values and writes them back out (spec §4.6
//! external interfaces, §4.7 XML rule emission).
//!
//! No repo in the example pack touches XML, so this leans on `quick-xml`
//! directly — an ecosystem crate already in the dependency table for this
//! reason — rather than hand-rolling a parser over `str::find`.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::config::Arch;
use crate::error::{EngineError, RuleError};
use crate::symbol::{Interner, Symbol};
use crate::types::{BinaryOp, Expr, ExprArena, ExprId, Transform, TypeGraph, UnaryOp};
use crate::rules::{Action, DataTypeMask, Filter, MemberPathStep, NamePattern, OsFilter, TypeRule};

/// The catalogue-level attributes on `<typeknowledge>`.
#[derive(Debug, Clone, Default)]
pub struct CatalogueMeta {
    pub os: Option<String>,
    pub architecture: Option<Arch>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

fn attr_value(tag: &BytesStart, name: &str) -> Option<String> {
    tag.attributes().filter_map(Result::ok).find(|a| a.key.as_ref() == name.as_bytes()).map(|a| {
        String::from_utf8_lossy(&a.value).into_owned()
    })
}

fn parse_arch(s: &str) -> Option<Arch> {
    match s {
        "x86" => Some(Arch::X86),
        "x86-PAE" | "x86_pae" => Some(Arch::X86Pae),
        "x86_64" => Some(Arch::X86_64),
        _ => None,
    }
}

/// Parses a whole catalogue document into its meta-attributes and the list
/// of rules it declares. Expressions are compiled straight into `graph`'s
/// permanent expression arena, since that's where every other expression
/// (a variable's `alt_referents`) already lives.
pub fn parse_catalogue(xml: &str, graph: &mut TypeGraph, interner: &mut Interner) -> Result<(CatalogueMeta, Vec<TypeRule>), EngineError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text = true;

    let mut meta = CatalogueMeta::default();
    let mut rules = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Start(tag) if tag.name().as_ref() == b"typeknowledge" => {
                meta.os = attr_value(&tag, "os");
                meta.architecture = attr_value(&tag, "architecture").and_then(|a| parse_arch(&a));
                meta.min_version = attr_value(&tag, "minver");
                meta.max_version = attr_value(&tag, "maxver");
            }
            Event::Start(tag) if tag.name().as_ref() == b"rule" => {
                let priority = attr_value(&tag, "priority").and_then(|p| p.parse().ok()).unwrap_or(0);
                let rule = parse_rule(&mut reader, priority, graph, interner)?;
                rules.push(rule);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok((meta, rules))
}

fn read_text_until_end(reader: &mut Reader<&[u8]>, end_tag: &[u8]) -> Result<String, EngineError> {
    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Text(t) => text.push_str(&t.unescape().unwrap_or(Cow::Borrowed(""))),
            Event::End(e) if e.name().as_ref() == end_tag => break,
            Event::Eof => return Err(EngineError::Rule(RuleError::MalformedCatalogue("unexpected eof".into()))),
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}

fn parse_rule(reader: &mut Reader<&[u8]>, priority: i32, graph: &mut TypeGraph, interner: &mut Interner) -> Result<TypeRule, EngineError> {
    let mut name = String::new();
    let mut description = String::new();
    let mut os_filter: Option<OsFilter> = None;
    let mut filter = Filter::default();
    let mut action = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Start(tag) => {
                let local = tag.name().as_ref().to_vec();
                match local.as_slice() {
                    b"name" => name = read_text_until_end(reader, b"name")?,
                    b"description" => description = read_text_until_end(reader, b"description")?,
                    b"os" => {
                        let sysname = attr_value(&tag, "name");
                        let arch = attr_value(&tag, "arch").and_then(|a| parse_arch(&a));
                        let min_version = attr_value(&tag, "minver");
                        let max_version = attr_value(&tag, "maxver");
                        let _ = read_text_until_end(reader, b"os");
                        os_filter = Some(OsFilter {
                            sysname: sysname.map(NamePattern::Literal),
                            arch,
                            min_version,
                            max_version,
                        });
                    }
                    b"filter" => filter = parse_filter(reader, interner)?,
                    b"action" => {
                        let kind = attr_value(&tag, "type").unwrap_or_else(|| "expression".into());
                        action = Some(parse_action(reader, &kind, graph, interner)?);
                    }
                    _ => {
                        let _ = read_text_until_end(reader, &local);
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"rule" => break,
            Event::Eof => return Err(EngineError::Rule(RuleError::MalformedCatalogue("unexpected eof in rule".into()))),
            _ => {}
        }
        buf.clear();
    }

    let action = action.ok_or_else(|| EngineError::Rule(RuleError::MalformedCatalogue(format!("rule {name:?} has no action"))))?;
    Ok(TypeRule { name, description, os_filter, filter, action, priority, source_file: String::new(), source_line: 0 })
}

fn parse_name_pattern(match_kind: Option<&str>, text: &str) -> NamePattern {
    match match_kind {
        Some("regex") => regex::Regex::new(text).map(NamePattern::Regex).unwrap_or(NamePattern::Any),
        Some("wildcard") => glob::Pattern::new(text).map(NamePattern::Glob).unwrap_or(NamePattern::Any),
        Some("any") => NamePattern::Any,
        _ => NamePattern::Literal(text.to_string()),
    }
}

fn parse_data_type_mask(text: &str) -> DataTypeMask {
    let mut mask = DataTypeMask::empty();
    for token in text.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty()) {
        mask |= match token {
            "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" | "int" => DataTypeMask::INT,
            "Bool8" | "Bool16" | "Bool32" | "Bool64" | "bool" => DataTypeMask::BOOL,
            "Float" | "float" => DataTypeMask::FLOAT,
            "Double" | "double" => DataTypeMask::DOUBLE,
            "Enum" | "enum" => DataTypeMask::ENUM,
            "Pointer" | "pointer" => DataTypeMask::POINTER,
            "Array" | "array" => DataTypeMask::ARRAY,
            "Struct" | "struct" => DataTypeMask::STRUCT,
            "Union" | "union" => DataTypeMask::UNION,
            "Typedef" | "typedef" => DataTypeMask::TYPEDEF,
            "Const" | "const" => DataTypeMask::CONST,
            "Volatile" | "volatile" => DataTypeMask::VOLATILE,
            "FuncPointer" | "function_pointer" => DataTypeMask::FUNCTION_POINTER,
            "Void" | "void" => DataTypeMask::VOID,
            _ => DataTypeMask::empty(),
        };
    }
    mask
}

fn parse_filter(reader: &mut Reader<&[u8]>, interner: &mut Interner) -> Result<Filter, EngineError> {
    let mut filter = Filter::default();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Start(tag) => {
                let local = tag.name().as_ref().to_vec();
                match local.as_slice() {
                    b"variablename" => {
                        let text = read_text_until_end(reader, b"variablename").unwrap_or_default();
                        filter.variable_name = Some(NamePattern::Literal(text));
                    }
                    b"datatype" => {
                        let text = read_text_until_end(reader, b"datatype").unwrap_or_default();
                        filter.data_type = Some(parse_data_type_mask(&text));
                    }
                    b"type_name" => {
                        let text = read_text_until_end(reader, b"type_name").unwrap_or_default();
                        filter.type_name = Some(NamePattern::Literal(text));
                    }
                    b"type_id" => {
                        let text = read_text_until_end(reader, b"type_id").unwrap_or_default();
                        filter.type_id = text.trim().parse().ok();
                    }
                    b"size" => {
                        let text = read_text_until_end(reader, b"size").unwrap_or_default();
                        filter.size = text.trim().parse().ok();
                    }
                    b"compile_unit" => {
                        let text = read_text_until_end(reader, b"compile_unit").unwrap_or_default();
                        filter.compile_unit = Some(NamePattern::Literal(text));
                    }
                    b"members" => filter.member_path = parse_member_path(reader, interner)?,
                    _ => {}
                }
            }
            Event::End(e) if e.name().as_ref() == b"filter" => break,
            Event::Eof => return Err(EngineError::Rule(RuleError::MalformedCatalogue("unexpected eof in filter".into()))),
            _ => {}
        }
        buf.clear();
    }
    Ok(filter)
}

fn parse_member_path(reader: &mut Reader<&[u8]>, _interner: &mut Interner) -> Result<Vec<MemberPathStep>, EngineError> {
    let mut path = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Start(tag) if tag.name().as_ref() == b"member" => {
                let match_kind = attr_value(&tag, "match");
                let text = read_text_until_end(reader, b"member")?;
                path.push(MemberPathStep { field: parse_name_pattern(match_kind.as_deref(), &text), inner: None });
            }
            Event::End(e) if e.name().as_ref() == b"members" => break,
            Event::Eof => return Err(EngineError::Rule(RuleError::MalformedCatalogue("unexpected eof in members".into()))),
            _ => {}
        }
        buf.clear();
    }
    Ok(path)
}

fn parse_action(reader: &mut Reader<&[u8]>, kind: &str, graph: &mut TypeGraph, interner: &mut Interner) -> Result<Action, EngineError> {
    let mut src_type = String::new();
    let mut target_type = String::new();
    let mut expr_text = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))? {
            Event::Start(tag) => match tag.name().as_ref() {
                b"srcType" => src_type = read_text_until_end(reader, b"srcType")?,
                b"targetType" => target_type = read_text_until_end(reader, b"targetType")?,
                b"expression" => expr_text = read_text_until_end(reader, b"expression")?,
                other => {
                    let owned = other.to_vec();
                    let _ = read_text_until_end(reader, &owned);
                }
            },
            Event::End(e) if e.name().as_ref() == b"action" => break,
            Event::Eof => return Err(EngineError::Rule(RuleError::MalformedCatalogue("unexpected eof in action".into()))),
            _ => {}
        }
        buf.clear();
    }

    match kind {
        "inline" => Ok(Action::InlineScript(expr_text)),
        "function" => {
            let (file, function) = expr_text.split_once("::").unwrap_or((expr_text.as_str(), ""));
            Ok(Action::ScriptFunction { file: file.to_string(), function: function.to_string() })
        }
        _ => {
            let expr = parse_expression(&expr_text, &mut graph.exprs, interner)?;
            Ok(Action::Expression { source_type: src_type, target_type, expr })
        }
    }
}

/// A tiny recursive-descent parser over the rule engine's expression
/// grammar (spec §3 "Expression"): literal / enumerator-as-literal /
/// variable-reference with a transform list / unary / binary, written
/// infix with C-like operator precedence.
pub fn parse_expression(text: &str, arena: &mut ExprArena, interner: &mut Interner) -> Result<ExprId, EngineError> {
    let tokens = tokenize(text)?;
    let mut parser = ExprParser { tokens, pos: 0, arena, interner };
    let id = parser.parse_binary(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Rule(RuleError::MalformedCatalogue(format!("trailing tokens in expression {text:?}"))));
    }
    Ok(id)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(i128),
    Punct(char),
    Op(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, EngineError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            if c == '0' && chars.get(i + 1) == Some(&'x') {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let n = i128::from_str_radix(&chars[start + 2..i].iter().collect::<String>(), 16)
                    .map_err(|_| EngineError::Rule(RuleError::MalformedCatalogue(format!("bad hex literal in {text:?}"))))?;
                tokens.push(Token::Number(n));
            } else {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let n: i128 = chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .map_err(|_| EngineError::Rule(RuleError::MalformedCatalogue(format!("bad literal in {text:?}"))))?;
                tokens.push(Token::Number(n));
            }
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            match c {
                '-' if chars.get(i + 1) == Some(&'>') => {
                    tokens.push(Token::Op("->".into()));
                    i += 2;
                }
                '=' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Op("==".into()));
                    i += 2;
                }
                '!' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Op("!=".into()));
                    i += 2;
                }
                '<' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Op("<=".into()));
                    i += 2;
                }
                '>' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Op(">=".into()));
                    i += 2;
                }
                '<' if chars.get(i + 1) == Some(&'<') => {
                    tokens.push(Token::Op("<<".into()));
                    i += 2;
                }
                '>' if chars.get(i + 1) == Some(&'>') => {
                    tokens.push(Token::Op(">>".into()));
                    i += 2;
                }
                '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^' | '!' | '~' | '<' | '>' | '=' => {
                    tokens.push(Token::Op(c.to_string()));
                    i += 1;
                }
                '.' | '(' | ')' | '[' | ']' => {
                    tokens.push(Token::Punct(c));
                    i += 1;
                }
                _ => return Err(EngineError::Rule(RuleError::MalformedCatalogue(format!("unexpected character {c:?} in expression {text:?}")))),
            }
        }
    }
    Ok(tokens)
}

const PRECEDENCE: &[&[&str]] = &[
    &["||"],
    &["&&"],
    &["|"],
    &["^"],
    &["&"],
    &["==", "!="],
    &["<", "<=", ">", ">="],
    &["<<", ">>"],
    &["+", "-"],
    &["*", "/", "%"],
];

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "&" => BinaryOp::BitAnd,
        "|" => BinaryOp::BitOr,
        "^" => BinaryOp::BitXor,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        _ => return None,
    })
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    arena: &'a mut ExprArena,
    interner: &'a mut Interner,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_binary(&mut self, level: usize) -> Result<ExprId, EngineError> {
        if level >= PRECEDENCE.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_binary(level + 1)?;
        loop {
            let Some(Token::Op(op)) = self.peek() else { break };
            if !PRECEDENCE[level].contains(&op.as_str()) {
                break;
            }
            let op = op.clone();
            self.pos += 1;
            let rhs = self.parse_binary(level + 1)?;
            let Some(bop) = binary_op(&op) else { break };
            lhs = self.arena.alloc(Expr::Binary(bop, lhs, rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<ExprId, EngineError> {
        if let Some(Token::Op(op)) = self.peek() {
            let unary = match op.as_str() {
                "-" => Some(UnaryOp::Neg),
                "!" => Some(UnaryOp::Not),
                "~" => Some(UnaryOp::BitNot),
                "*" => None, // handled as a leading dereference below
                _ => None,
            };
            if op == "*" {
                self.pos += 1;
                let operand = self.parse_unary()?;
                return Ok(self.deref_wrap(operand));
            }
            if let Some(u) = unary {
                self.pos += 1;
                let operand = self.parse_unary()?;
                return Ok(self.arena.alloc(Expr::Unary(u, operand)));
            }
        }
        self.parse_postfix()
    }

    /// Wraps an already-parsed variable-reference expression with a
    /// trailing dereference transform; used for C-style `*expr` prefix
    /// syntax in rule catalogues. Only legal directly on a `VariableRef`.
    fn deref_wrap(&mut self, id: ExprId) -> ExprId {
        if let Expr::VariableRef { var, mut transforms } = self.arena.get(id).clone() {
            transforms.push(Transform::Dereference);
            return self.arena.alloc(Expr::VariableRef { var, transforms });
        }
        id
    }

    fn parse_postfix(&mut self) -> Result<ExprId, EngineError> {
        let primary = self.parse_primary()?;
        let Expr::VariableRef { var, mut transforms } = self.arena.get(primary).clone() else {
            return Ok(primary);
        };
        loop {
            match self.peek() {
                Some(Token::Punct('.')) => {
                    self.pos += 1;
                    let Some(Token::Ident(name)) = self.peek().cloned() else {
                        return Err(EngineError::Rule(RuleError::MalformedCatalogue("expected field name after '.'".into())));
                    };
                    self.pos += 1;
                    transforms.push(Transform::Field(self.interner.intern(&name)));
                }
                Some(Token::Op(op)) if op == "->" => {
                    self.pos += 1;
                    transforms.push(Transform::Dereference);
                    let Some(Token::Ident(name)) = self.peek().cloned() else {
                        return Err(EngineError::Rule(RuleError::MalformedCatalogue("expected field name after '->'".into())));
                    };
                    self.pos += 1;
                    transforms.push(Transform::Field(self.interner.intern(&name)));
                }
                Some(Token::Punct('[')) => {
                    self.pos += 1;
                    let idx = self.parse_binary(0)?;
                    match self.peek() {
                        Some(Token::Punct(']')) => self.pos += 1,
                        _ => return Err(EngineError::Rule(RuleError::MalformedCatalogue("expected ']'".into()))),
                    }
                    transforms.push(Transform::Index(idx));
                }
                _ => break,
            }
        }
        Ok(self.arena.alloc(Expr::VariableRef { var, transforms }))
    }

    fn parse_primary(&mut self) -> Result<ExprId, EngineError> {
        match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(self.arena.alloc(Expr::Literal(n)))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if matches!(self.peek(), Some(Token::Punct('('))) {
                    self.pos += 1;
                    if matches!(self.peek(), Some(Token::Punct(')'))) {
                        self.pos += 1;
                    }
                    let sym: Symbol = self.interner.intern(&name);
                    return Ok(self.arena.alloc(Expr::VariableRef {
                        var: sym,
                        transforms: smallvec::smallvec![Transform::Call(sym)],
                    }));
                }
                let sym = self.interner.intern(&name);
                Ok(self.arena.alloc(Expr::VariableRef { var: sym, transforms: smallvec::smallvec![] }))
            }
            Some(Token::Punct('(')) => {
                self.pos += 1;
                let inner = self.parse_binary(0)?;
                match self.peek() {
                    Some(Token::Punct(')')) => self.pos += 1,
                    _ => return Err(EngineError::Rule(RuleError::MalformedCatalogue("expected ')'".into()))),
                }
                Ok(inner)
            }
            other => Err(EngineError::Rule(RuleError::MalformedCatalogue(format!("unexpected token {other:?} in expression")))),
        }
    }
}

/// Renders an expression back to the same textual grammar [`parse_expression`]
/// reads, for the writer below.
fn render_expression(arena: &ExprArena, interner: &Interner, id: ExprId) -> String {
    match arena.get(id) {
        Expr::Literal(v) => v.to_string(),
        Expr::Enumerator(_, sym) => interner.resolve(*sym).to_string(),
        Expr::VariableRef { var, transforms } => {
            let mut s = interner.resolve(*var).to_string();
            for t in transforms {
                match t {
                    Transform::Field(name) => {
                        s.push('.');
                        s.push_str(interner.resolve(*name));
                    }
                    Transform::Dereference => s = format!("*{s}"),
                    Transform::Index(idx) => s.push_str(&format!("[{}]", render_expression(arena, interner, *idx))),
                    Transform::Call(name) => s = format!("{}()", interner.resolve(*name)),
                }
            }
            s
        }
        Expr::Unary(op, operand) => {
            let sym = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
                UnaryOp::BitNot => "~",
            };
            format!("{sym}{}", render_expression(arena, interner, *operand))
        }
        Expr::Binary(op, lhs, rhs) => {
            let sym = match op {
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Mod => "%",
                BinaryOp::Shl => "<<",
                BinaryOp::Shr => ">>",
                BinaryOp::BitAnd => "&",
                BinaryOp::BitOr => "|",
                BinaryOp::BitXor => "^",
                BinaryOp::Eq => "==",
                BinaryOp::Ne => "!=",
                BinaryOp::Lt => "<",
                BinaryOp::Le => "<=",
                BinaryOp::Gt => ">",
                BinaryOp::Ge => ">=",
            };
            format!("({} {sym} {})", render_expression(arena, interner, *lhs), render_expression(arena, interner, *rhs))
        }
    }
}

/// Escapes `--` to `- -` so the text is safe to embed inside an XML
/// comment, per spec §6 "Rule catalogue".
#[must_use]
pub fn escape_comment(text: &str) -> String {
    text.replace("--", "- -")
}

/// Writes a catalogue document back out to XML text.
pub fn write_catalogue(meta: &CatalogueMeta, rules: &[TypeRule], arena: &ExprArena, interner: &Interner) -> Result<String, EngineError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut root = BytesStart::new("typeknowledge");
    if let Some(os) = &meta.os {
        root.push_attribute(("os", os.as_str()));
    }
    if let Some(arch) = meta.architecture {
        let arch_str = match arch {
            Arch::X86 => "x86",
            Arch::X86Pae => "x86-PAE",
            Arch::X86_64 => "x86_64",
        };
        root.push_attribute(("architecture", arch_str));
    }
    if let Some(min) = &meta.min_version {
        root.push_attribute(("minver", min.as_str()));
    }
    if let Some(max) = &meta.max_version {
        root.push_attribute(("maxver", max.as_str()));
    }

    writer.write_event(Event::Start(root.clone())).map_err(xml_io_err)?;

    for rule in rules {
        write_rule(&mut writer, rule, arena, interner)?;
    }

    writer.write_event(Event::End(root.to_end())).map_err(xml_io_err)?;

    let bytes = writer.into_inner();
    String::from_utf8(bytes).map_err(|e| EngineError::Rule(RuleError::MalformedCatalogue(e.to_string())))
}

fn xml_io_err(e: quick_xml::Error) -> EngineError {
    EngineError::Rule(RuleError::MalformedCatalogue(e.to_string()))
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), EngineError> {
    writer.write_event(Event::Start(BytesStart::new(name))).map_err(xml_io_err)?;
    writer.write_event(Event::Text(BytesText::new(text))).map_err(xml_io_err)?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(name))).map_err(xml_io_err)?;
    Ok(())
}

fn write_rule(writer: &mut Writer<Vec<u8>>, rule: &TypeRule, arena: &ExprArena, interner: &Interner) -> Result<(), EngineError> {
    let mut tag = BytesStart::new("rule");
    tag.push_attribute(("priority", rule.priority.to_string().as_str()));
    writer.write_event(Event::Start(tag.clone())).map_err(xml_io_err)?;

    write_text_element(writer, "name", &rule.name)?;
    let comment = escape_comment(&rule.description);
    writer.write_event(Event::Comment(BytesText::new(comment.as_str()))).map_err(xml_io_err)?;

    writer.write_event(Event::Start(BytesStart::new("filter"))).map_err(xml_io_err)?;
    if let Some(NamePattern::Literal(v)) = &rule.filter.type_name {
        write_text_element(writer, "type_name", v)?;
    }
    if let Some(id) = rule.filter.type_id {
        write_text_element(writer, "type_id", &id.to_string())?;
    }
    if let Some(NamePattern::Literal(v)) = &rule.filter.variable_name {
        write_text_element(writer, "variablename", v)?;
    }
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("filter"))).map_err(xml_io_err)?;

    let (action_type, src, target, body) = match &rule.action {
        Action::Expression { source_type, target_type, expr } => {
            ("expression", source_type.clone(), target_type.clone(), render_expression(arena, interner, *expr))
        }
        Action::InlineScript(body) => ("inline", String::new(), String::new(), body.clone()),
        Action::ScriptFunction { file, function } => ("function", String::new(), String::new(), format!("{file}::{function}")),
    };
    let mut action_tag = BytesStart::new("action");
    action_tag.push_attribute(("type", action_type));
    writer.write_event(Event::Start(action_tag)).map_err(xml_io_err)?;
    if !src.is_empty() {
        write_text_element(writer, "srcType", &src)?;
    }
    if !target.is_empty() {
        write_text_element(writer, "targetType", &target)?;
    }
    write_text_element(writer, "expression", &body)?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("action"))).map_err(xml_io_err)?;

    writer.write_event(Event::End(tag.to_end())).map_err(xml_io_err)?;
    Ok(())
}

/// Spec §4.7: derives one rule per global variable that carries
/// alternative-referent expressions, rejecting transformations with a
/// pointer dereference after a field access (the expected pattern is
/// `s.member`, not `s->member->other`).
pub fn derive_rules_from_variables(graph: &TypeGraph, interner: &Interner) -> Vec<TypeRule> {
    let mut rules = Vec::new();
    for var in graph.variables() {
        for &expr_id in &var.alt_referents {
            if has_dereference_after_field(graph.exprs(), expr_id) {
                continue;
            }
            let Some(ty) = graph.find_by_id(var.referent) else { continue };
            let source_name = ty.name.map_or_else(|| format!("#{}", var.referent), |n| interner.resolve(n).to_string());
            let var_name = interner.resolve(var.name).to_string();
            let priority = non_trivial_transform_count(graph.exprs(), expr_id) + 10;
            rules.push(TypeRule {
                name: format!("derived_{var_name}"),
                description: format!("derived from {var_name}'s alternative referent"),
                os_filter: None,
                filter: Filter { variable_name: Some(NamePattern::Literal(var_name)), ..Default::default() },
                action: Action::Expression { source_type: source_name.clone(), target_type: source_name, expr: expr_id },
                priority,
                source_file: String::new(),
                source_line: 0,
            });
        }
    }
    rules
}

fn has_dereference_after_field(arena: &ExprArena, id: ExprId) -> bool {
    let Expr::VariableRef { transforms, .. } = arena.get(id) else { return false };
    let mut seen_field = false;
    for t in transforms {
        match t {
            Transform::Field(_) => seen_field = true,
            Transform::Dereference if seen_field => return true,
            _ => {}
        }
    }
    false
}

fn non_trivial_transform_count(arena: &ExprArena, id: ExprId) -> i32 {
    match arena.get(id) {
        Expr::VariableRef { transforms, .. } => i32::try_from(transforms.len()).unwrap_or(i32::MAX),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeGraph;

    #[test]
    fn tokenizes_and_parses_simple_member_chain() {
        let mut arena = ExprArena::new();
        let mut interner = Interner::new();
        let id = parse_expression("self.next.prev", &mut arena, &mut interner).unwrap();
        let rendered = render_expression(&arena, &interner, id);
        assert_eq!(rendered, "self.next.prev");
    }

    #[test]
    fn parses_arithmetic_with_precedence() {
        let mut arena = ExprArena::new();
        let mut interner = Interner::new();
        let id = parse_expression("1 + 2 * 3", &mut arena, &mut interner).unwrap();
        let Expr::Binary(BinaryOp::Add, _, rhs) = arena.get(id) else { panic!("expected addition at top level") };
        assert!(matches!(arena.get(*rhs), Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn round_trips_a_minimal_catalogue() {
        let xml = r#"<typeknowledge os="Linux" architecture="x86_64">
            <rule priority="5">
                <name>offset_hack</name>
                <filter><type_name>task_struct</type_name></filter>
                <action type="expression"><srcType>task_struct</srcType><targetType>task_struct</targetType><expression>self.next</expression></action>
            </rule>
        </typeknowledge>"#;
        let mut graph = TypeGraph::new();
        let mut interner = Interner::new();
        let (meta, rules) = parse_catalogue(xml, &mut graph, &mut interner).unwrap();
        assert_eq!(meta.os.as_deref(), Some("Linux"));
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority, 5);
        assert_eq!(rules[0].name, "offset_hack");

        let out = write_catalogue(&meta, &rules, graph.exprs(), &interner).unwrap();
        assert!(out.contains("offset_hack"));
        assert!(out.contains("task_struct"));
    }

    #[test]
    fn escapes_double_dash_in_comments() {
        assert_eq!(escape_comment("careful -- this is dangerous"), "careful - - this is dangerous");
    }
}
