//! A small interpreter for compiled file bodies.
//!
//! Enough of an executor to drive the cache end to end: it prints, calls
//! functions through the request's lookup hooks (so deferred definitions get
//! installed on first use), binds constants, and performs the run-time half
//! of a deferred class declaration.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use opcache_ir::{Constant, Op, OpArray};
use opcache_runtime::{Environment, RegistryError, RequestSession};
use thiserror::Error;

/// Deepest call nesting the interpreter allows.
pub const MAX_CALL_DEPTH: usize = 64;

/// A run-time failure.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A call named a function that does not exist.
    #[error("call to undefined function {0}")]
    UndefinedFunction(String),

    /// A class declaration named a class that does not exist.
    #[error("class {0} not found")]
    UndefinedClass(String),

    /// An operand pointed past the constant table.
    #[error("{function}: constant slot {index} out of range")]
    BadOperand {
        /// Op array the operand belongs to.
        function: String,
        /// Offending index.
        index: u32,
    },

    /// Calls nested deeper than [`MAX_CALL_DEPTH`].
    #[error("maximum call depth of {MAX_CALL_DEPTH} exceeded")]
    DepthExceeded,

    /// A run-time declaration clashed with the environment.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Writing output failed.
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes op arrays against one request.
pub struct Executor<'a, 's, W: Write> {
    session: &'a mut RequestSession<'s>,
    out: W,
    constants: HashMap<String, Arc<Constant>>,
    depth: usize,
}

impl<'a, 's, W: Write> Executor<'a, 's, W> {
    /// Creates an executor writing to `out`.
    pub fn new(session: &'a mut RequestSession<'s>, out: W) -> Self {
        Self {
            session,
            out,
            constants: HashMap::new(),
            depth: 0,
        }
    }

    /// The request being executed, for compiling further files.
    pub fn session(&mut self) -> &mut RequestSession<'s> {
        self.session
    }

    /// Global constants bound so far.
    #[cfg(test)]
    pub fn constant(&self, name: &str) -> Option<&Constant> {
        self.constants.get(name).map(Arc::as_ref)
    }

    /// Consumes the executor, returning the output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Runs `op_array` until it returns or falls off the end.
    pub fn run(&mut self, op_array: &OpArray) -> Result<(), ExecError> {
        for op in &op_array.ops {
            match op {
                Op::Echo(index) => {
                    let value = operand(op_array, *index)?;
                    self.out.write_all(render(value).as_bytes())?;
                }
                Op::Call(name) => self.call(name)?,
                Op::BindConstant { name, value } => {
                    let value = Arc::clone(&op_array.constants[checked(op_array, *value)?]);
                    self.constants.insert(name.clone(), value);
                }
                Op::DeclareClass {
                    name,
                    mangled,
                    parent,
                } => self.declare_class(name, mangled, parent)?,
                Op::Return => break,
            }
        }
        Ok(())
    }

    fn call(&mut self, name: &str) -> Result<(), ExecError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ExecError::DepthExceeded);
        }
        let function = self
            .session
            .lookup_function(name)
            .ok_or_else(|| ExecError::UndefinedFunction(name.to_string()))?;
        self.depth += 1;
        let result = self.run(&function.op_array);
        self.depth -= 1;
        result
    }

    fn declare_class(&mut self, name: &str, mangled: &str, parent: &str) -> Result<(), ExecError> {
        if self.session.lookup_class(parent).is_none() {
            return Err(ExecError::UndefinedClass(parent.to_string()));
        }
        let body = self
            .session
            .env()
            .find_class(mangled)
            .ok_or_else(|| ExecError::UndefinedClass(mangled.to_string()))?;
        let mut class = (*body).clone();
        class.name = name.to_string();
        self.session
            .env_mut()
            .register_class(Arc::new(class), Some(parent))?;
        Ok(())
    }
}

fn checked(op_array: &OpArray, index: u32) -> Result<usize, ExecError> {
    if (index as usize) < op_array.constants.len() {
        Ok(index as usize)
    } else {
        Err(ExecError::BadOperand {
            function: op_array.name.clone().unwrap_or_else(|| "{main}".to_string()),
            index,
        })
    }
}

fn operand(op_array: &OpArray, index: u32) -> Result<&Constant, ExecError> {
    checked(op_array, index).map(|i| op_array.constants[i].as_ref())
}

/// Formats a constant the way `echo` prints it.
pub fn render(value: &Constant) -> String {
    match value {
        Constant::Null => String::new(),
        Constant::Bool(true) => "1".to_string(),
        Constant::Bool(false) => String::new(),
        Constant::Int(i) => i.to_string(),
        Constant::Float(f) => f.to_string(),
        Constant::Str(s) => s.clone(),
        Constant::List(items) => {
            let parts: Vec<String> = items.iter().map(|c| render(c)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcache_config::OpcacheConfig;
    use opcache_runtime::{CacheService, CompileMode, LineCompiler, LiveEnvironment, Origin};
    use std::path::Path;

    fn service(dir: &Path) -> CacheService {
        let mut config = OpcacheConfig::default();
        config.cache.lock_path = dir.join("opcache.lock");
        config.cache.file_update_protection = 0;
        CacheService::new(config, Box::new(LineCompiler)).unwrap()
    }

    fn run_file(service: &CacheService, path: &Path) -> (Origin, String) {
        let mut env = LiveEnvironment::new();
        let mut session = service.begin_request(&mut env);
        let compiled = session.compile_file(path, CompileMode::Include).unwrap();
        let mut exec = Executor::new(&mut session, Vec::new());
        exec.run(&compiled.op_array).unwrap();
        let out = exec.into_output();
        (compiled.origin, String::from_utf8(out).unwrap())
    }

    #[test]
    fn render_constants() {
        assert_eq!(render(&Constant::Int(3)), "3");
        assert_eq!(render(&Constant::Bool(true)), "1");
        assert_eq!(render(&Constant::Null), "");
        let list = Constant::List(vec![
            Arc::new(Constant::Str("a".into())),
            Arc::new(Constant::Int(2)),
        ]);
        assert_eq!(render(&list), "[a, 2]");
    }

    #[test]
    fn output_is_identical_on_miss_and_hit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.src");
        std::fs::write(
            &path,
            "function greet\n  echo \"hello \"\ncall greet\necho 42\n",
        )
        .unwrap();
        let service = service(dir.path());

        let (first, out1) = run_file(&service, &path);
        let (second, out2) = run_file(&service, &path);
        assert_eq!(first, Origin::Populated);
        assert_eq!(second, Origin::Hit);
        assert_eq!(out1, "hello 42");
        assert_eq!(out1, out2);
    }

    #[test]
    fn undefined_function_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.src");
        std::fs::write(&path, "call nowhere\n").unwrap();
        let service = service(dir.path());

        let mut env = LiveEnvironment::new();
        let mut session = service.begin_request(&mut env);
        let compiled = session.compile_file(&path, CompileMode::Include).unwrap();
        let mut exec = Executor::new(&mut session, Vec::new());
        let err = exec.run(&compiled.op_array).unwrap_err();
        assert!(matches!(err, ExecError::UndefinedFunction(name) if name == "nowhere"));
    }

    #[test]
    fn recursion_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.src");
        std::fs::write(&path, "function spin\n  call spin\ncall spin\n").unwrap();
        let service = service(dir.path());

        let mut env = LiveEnvironment::new();
        let mut session = service.begin_request(&mut env);
        let compiled = session.compile_file(&path, CompileMode::Include).unwrap();
        let mut exec = Executor::new(&mut session, Vec::new());
        assert!(matches!(
            exec.run(&compiled.op_array),
            Err(ExecError::DepthExceeded)
        ));
    }

    #[test]
    fn constants_are_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consts.src");
        std::fs::write(&path, "const LIMIT = 10\n").unwrap();
        let service = service(dir.path());

        let mut env = LiveEnvironment::new();
        let mut session = service.begin_request(&mut env);
        let compiled = session.compile_file(&path, CompileMode::Include).unwrap();
        let mut exec = Executor::new(&mut session, Vec::new());
        exec.run(&compiled.op_array).unwrap();
        assert_eq!(exec.constant("LIMIT"), Some(&Constant::Int(10)));
    }

    #[test]
    fn deferred_class_binds_once_parent_exists() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.src");
        let child = dir.path().join("child.src");
        std::fs::write(&base, "class Base\n").unwrap();
        std::fs::write(&child, "class Child extends Base\n").unwrap();
        let service = service(dir.path());

        let mut env = LiveEnvironment::new();
        {
            let mut session = service.begin_request(&mut env);
            let compiled = session.compile_file(&child, CompileMode::Include).unwrap();
            session.compile_file(&base, CompileMode::Include).unwrap();
            let mut exec = Executor::new(&mut session, Vec::new());
            exec.run(&compiled.op_array).unwrap();
        }
        assert!(env.find_class("Child").is_some());
        assert_eq!(env.parent_of("Child").unwrap().name, "Base");
    }
}
