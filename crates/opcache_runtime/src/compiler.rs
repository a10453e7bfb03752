//! The compiler boundary and a small line-oriented reference compiler.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use opcache_ir::{mangle, Class, Constant, Function, Op, OpArray};

use crate::env::Environment;
use crate::error::CompileFailure;

/// A file to compile: the path as requested and, when known, the path it
/// resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle {
    /// The path as the caller wrote it.
    pub path: PathBuf,
    /// The path found by key derivation.
    pub resolved: Option<PathBuf>,
}

impl SourceHandle {
    /// A handle for an unresolved path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            resolved: None,
        }
    }

    /// The path to read.
    pub fn file(&self) -> &Path {
        self.resolved.as_deref().unwrap_or(&self.path)
    }
}

/// How the file is being pulled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// A missing file is reported but not fatal to the caller.
    #[default]
    Include,
    /// A missing file is fatal to the caller.
    Require,
}

impl fmt::Display for CompileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileMode::Include => f.write_str("include"),
            CompileMode::Require => f.write_str("require"),
        }
    }
}

/// Turns a source file into an executable op array.
///
/// Functions and classes the file declares are registered into `env` as a
/// side effect, in declaration order.
pub trait Compiler: Send + Sync {
    /// Compiles one file.
    fn compile(
        &self,
        source: &SourceHandle,
        mode: CompileMode,
        env: &mut dyn Environment,
    ) -> Result<Arc<OpArray>, CompileFailure>;
}

/// A line-oriented compiler for a tiny statement language.
///
/// ```text
/// # comment
/// const GREETING = "hello"
/// function greet
///     echo "hello"
///     call helper
/// class Widget extends Base
///     const SIZE = 3
///     method render
/// echo [1, 2, 3]
/// call greet
/// ```
///
/// Indented lines belong to the nearest `function` or `class` above them.
/// A class whose parent is not yet declared is registered under a
/// file-scoped name and bound by a `DeclareClass` instruction at run time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCompiler;

impl Compiler for LineCompiler {
    fn compile(
        &self,
        source: &SourceHandle,
        mode: CompileMode,
        env: &mut dyn Environment,
    ) -> Result<Arc<OpArray>, CompileFailure> {
        let file = source.file();
        let text = std::fs::read_to_string(file).map_err(|e| {
            CompileFailure::new(file, format!("failed opening for {mode}: {e}"))
        })?;
        compile_source(file, &text, env)
    }
}

/// Compiles source text as if it had been read from `filename`.
pub fn compile_source(
    filename: &Path,
    text: &str,
    env: &mut dyn Environment,
) -> Result<Arc<OpArray>, CompileFailure> {
    let mut parser = Parser {
        filename,
        literals: HashMap::new(),
    };
    let mut main = Body::default();
    let mut block: Option<Block> = None;
    let mut last_line = 1;

    for (index, raw) in text.lines().enumerate() {
        let line_no = index as u32 + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        last_line = line_no;
        let fail = |message: String| CompileFailure::at(filename, line_no, message);

        if line.starts_with([' ', '\t']) {
            match block.as_mut() {
                Some(b) => parser.block_statement(b, trimmed).map_err(fail)?,
                None => return Err(fail("indented statement outside a block".to_string())),
            }
            extend_block(&mut block, line_no);
            continue;
        }

        if let Some(done) = block.take() {
            parser.close_block(done, env, &mut main)?;
        }

        let (word, rest) = split_word(trimmed);
        match word {
            "function" => {
                let name = identifier(rest).map_err(fail)?;
                block = Some(Block::Function {
                    name,
                    start: line_no,
                    end: line_no,
                    body: Body::default(),
                });
            }
            "class" => {
                let (name, parent) = class_header(rest).map_err(fail)?;
                block = Some(Block::Class {
                    name,
                    parent,
                    start: line_no,
                    end: line_no,
                    constants: Vec::new(),
                    methods: Vec::new(),
                });
            }
            "const" => {
                let (name, value) = parser.assignment(rest).map_err(fail)?;
                let value = main.constant(value);
                main.ops.push(Op::BindConstant { name, value });
            }
            "echo" => {
                let value = parser.literal(rest).map_err(fail)?;
                let index = main.constant(value);
                main.ops.push(Op::Echo(index));
            }
            "call" => {
                let name = identifier(rest).map_err(fail)?;
                main.ops.push(Op::Call(name));
            }
            other => return Err(fail(format!("unknown statement '{other}'"))),
        }
    }

    if let Some(done) = block.take() {
        parser.close_block(done, env, &mut main)?;
    }
    Ok(Arc::new(main.finish(None, filename, 1, last_line)))
}

fn extend_block(block: &mut Option<Block>, line_no: u32) {
    if let Some(Block::Function { end, .. } | Block::Class { end, .. }) = block {
        *end = line_no;
    }
}

enum Block {
    Function {
        name: String,
        start: u32,
        end: u32,
        body: Body,
    },
    Class {
        name: String,
        parent: Option<String>,
        start: u32,
        end: u32,
        constants: Vec<(String, Arc<Constant>)>,
        methods: Vec<Arc<Function>>,
    },
}

#[derive(Default)]
struct Body {
    ops: Vec<Op>,
    constants: Vec<Arc<Constant>>,
    slots: HashMap<*const Constant, u32>,
}

impl Body {
    fn constant(&mut self, value: Arc<Constant>) -> u32 {
        let next = self.constants.len() as u32;
        let slot = *self.slots.entry(Arc::as_ptr(&value)).or_insert(next);
        if slot == next {
            self.constants.push(value);
        }
        slot
    }

    fn finish(mut self, name: Option<String>, filename: &Path, start: u32, end: u32) -> OpArray {
        self.ops.push(Op::Return);
        OpArray {
            name,
            filename: filename.to_path_buf(),
            ops: self.ops,
            constants: self.constants,
            line_start: start,
            line_end: end,
        }
    }
}

struct Parser<'a> {
    filename: &'a Path,
    literals: HashMap<String, Arc<Constant>>,
}

impl Parser<'_> {
    fn block_statement(&mut self, block: &mut Block, stmt: &str) -> Result<(), String> {
        let (word, rest) = split_word(stmt);
        match (block, word) {
            (Block::Function { body, .. }, "echo") => {
                let value = self.literal(rest)?;
                let index = body.constant(value);
                body.ops.push(Op::Echo(index));
            }
            (Block::Function { body, .. }, "call") => {
                body.ops.push(Op::Call(identifier(rest)?));
            }
            (Block::Class { constants, .. }, "const") => {
                constants.push(self.assignment(rest)?);
            }
            (Block::Class { methods, end, .. }, "method") => {
                let name = identifier(rest)?;
                let body = Body::default().finish(Some(name.clone()), self.filename, *end, *end);
                methods.push(Arc::new(Function {
                    name,
                    op_array: Arc::new(body),
                }));
            }
            (Block::Function { .. }, other) => {
                return Err(format!("unknown function statement '{other}'"))
            }
            (Block::Class { .. }, other) => return Err(format!("unknown class statement '{other}'")),
        }
        Ok(())
    }

    fn close_block(
        &mut self,
        block: Block,
        env: &mut dyn Environment,
        main: &mut Body,
    ) -> Result<(), CompileFailure> {
        match block {
            Block::Function {
                name,
                start,
                end,
                body,
            } => {
                let op_array = body.finish(Some(name.clone()), self.filename, start, end);
                let function = Function {
                    name,
                    op_array: Arc::new(op_array),
                };
                env.register_function(Arc::new(function))
                    .map_err(|e| CompileFailure::at(self.filename, start, e.to_string()))
            }
            Block::Class {
                name,
                parent,
                start,
                constants,
                methods,
                ..
            } => {
                let fail = |e: crate::error::RegistryError| {
                    CompileFailure::at(self.filename, start, e.to_string())
                };
                match parent {
                    Some(parent) if env.find_class(&parent).is_none() => {
                        let mangled = mangle(&name, self.filename, start);
                        let class = Class {
                            name: mangled.clone(),
                            parent_name: Some(parent.clone()),
                            constants,
                            methods,
                        };
                        env.declare_class(Arc::new(class)).map_err(fail)?;
                        main.ops.push(Op::DeclareClass {
                            name,
                            mangled,
                            parent,
                        });
                        Ok(())
                    }
                    parent => {
                        let class = Class {
                            name,
                            parent_name: parent.clone(),
                            constants,
                            methods,
                        };
                        env.register_class(Arc::new(class), parent.as_deref())
                            .map_err(fail)
                    }
                }
            }
        }
    }

    fn assignment(&mut self, rest: &str) -> Result<(String, Arc<Constant>), String> {
        let (name, value) = rest
            .split_once('=')
            .ok_or_else(|| format!("expected NAME = VALUE, got '{rest}'"))?;
        Ok((identifier(name)?, self.literal(value)?))
    }

    /// Parses a literal, returning the same `Arc` for repeated source text.
    fn literal(&mut self, text: &str) -> Result<Arc<Constant>, String> {
        let text = text.trim();
        if let Some(existing) = self.literals.get(text) {
            return Ok(Arc::clone(existing));
        }
        let value = match text {
            "" => return Err("missing value".to_string()),
            "null" => Constant::Null,
            "true" => Constant::Bool(true),
            "false" => Constant::Bool(false),
            _ if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') => {
                Constant::Str(text[1..text.len() - 1].to_string())
            }
            _ if text.starts_with('[') => {
                let inner = text
                    .strip_suffix(']')
                    .map(|t| &t[1..])
                    .ok_or_else(|| format!("unterminated list '{text}'"))?;
                let items = split_items(inner)?
                    .into_iter()
                    .map(|item| self.literal(item))
                    .collect::<Result<_, _>>()?;
                Constant::List(items)
            }
            _ => number(text).unwrap_or_else(|| Constant::Str(text.to_string())),
        };
        let value = Arc::new(value);
        self.literals.insert(text.to_string(), Arc::clone(&value));
        Ok(value)
    }
}

fn number(text: &str) -> Option<Constant> {
    if !text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return None;
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Constant::Int(i));
    }
    text.parse::<f64>().ok().map(Constant::Float)
}

/// Splits list items on top-level commas.
fn split_items(inner: &str) -> Result<Vec<&str>, String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '[' if !quoted => depth += 1,
            ']' if !quoted => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced list '[{inner}]'"))?
            }
            ',' if !quoted && depth == 0 => {
                items.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted || depth != 0 {
        return Err(format!("unbalanced list '[{inner}]'"));
    }
    let last = &inner[start..];
    if !last.trim().is_empty() || !items.is_empty() {
        items.push(last);
    }
    Ok(items)
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn identifier(s: &str) -> Result<String, String> {
    let s = s.trim();
    let valid = s.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(s.to_string())
    } else {
        Err(format!("invalid name '{s}'"))
    }
}

fn class_header(rest: &str) -> Result<(String, Option<String>), String> {
    let mut words = rest.split_whitespace();
    let name = identifier(words.next().unwrap_or_default())?;
    match (words.next(), words.next(), words.next()) {
        (None, _, _) => Ok((name, None)),
        (Some("extends"), Some(parent), None) => Ok((name, Some(identifier(parent)?))),
        _ => Err(format!("expected 'class NAME [extends PARENT]', got 'class {rest}'")),
    }
}
