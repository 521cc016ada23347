//! Hermetic evaluator producing concrete target records.
//!
//! Evaluation is deterministic and side-effect free except for the builtins
//! `env(key, default?)` and `glob(pattern)`. Those are treated as
//! effect-carrying inputs: every observation is appended to the file's
//! [`EffectLog`] and snapshotted into each target declared afterwards, so the
//! observed values participate in the target's cache key.

use super::ast::{BinaryOp, Expr, ExprKind, File, Stmt, UnaryOp};
use crate::{
    error::{BuildError, Result, SourcePos},
    target::RawTarget,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

/// One observation of an effect-carrying builtin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    /// Builtin name, `env` or `glob`.
    pub builtin: String,
    /// The argument the builtin was invoked with.
    pub input: String,
    /// The value the builtin observed.
    pub observed: String,
}

/// Ordered log of effect observations during evaluation.
pub type EffectLog = Vec<Effect>;

/// A runtime value of the workspace language.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Lambda(Rc<Closure>),
}

#[derive(Debug, PartialEq)]
pub struct Closure {
    params: Vec<String>,
    body: Expr,
    /// Bindings captured at the point of creation.
    captured: HashMap<String, Value>,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Lambda(_) => "lambda",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Lambda(_) => true,
        }
    }

    /// Converts to JSON for the language-specific configuration blob.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => (*b).into(),
            Value::Int(v) => (*v).into(),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => s.clone().into(),
            Value::Array(items) => items.iter().map(Value::to_json).collect(),
            Value::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Lambda(_) => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(_) => f.write_str("{…}"),
            Value::Lambda(_) => f.write_str("<lambda>"),
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
}

#[derive(Clone)]
struct FuncDef {
    params: Vec<String>,
    body: Vec<Stmt>,
}

/// Evaluates one parsed workspace file into raw target declarations.
pub struct Evaluator<'a> {
    file: PathBuf,
    package: String,
    package_dir: PathBuf,
    scopes: Vec<HashMap<String, (Value, bool)>>,
    funcs: HashMap<String, FuncDef>,
    targets: Vec<RawTarget>,
    effects: EffectLog,
    env_lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
}

impl<'a> Evaluator<'a> {
    /// `package` is the package path of the file relative to the workspace
    /// root; `package_dir` its absolute directory.
    pub fn new(file: impl Into<PathBuf>, package: &str, package_dir: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            package: package.to_string(),
            package_dir: package_dir.into(),
            scopes: vec![HashMap::new()],
            funcs: HashMap::new(),
            targets: Vec::new(),
            effects: Vec::new(),
            env_lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Overrides how `env()` resolves variables, used by tests.
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        self.env_lookup = Box::new(lookup);
        self
    }

    /// Runs the file and returns the declared targets.
    pub fn run(mut self, file: &File) -> Result<Vec<RawTarget>> {
        for stmt in &file.items {
            if let Flow::Return(_) = self.stmt(stmt)? {
                break;
            }
        }
        Ok(self.targets)
    }

    fn error(&self, pos: SourcePos, message: impl Into<String>) -> BuildError {
        BuildError::Syntax { file: self.file.clone(), pos, message: message.into() }
    }

    // ---- scopes ----

    fn lookup(&self, name: &str) -> Option<&Value> {
        for scope in self.scopes.iter().rev() {
            if let Some((value, _)) = scope.get(name) {
                return Some(value);
            }
        }
        None
    }

    fn declare(&mut self, name: &str, value: Value, mutable: bool) {
        self.scopes.last_mut().unwrap().insert(name.to_string(), (value, mutable));
    }

    fn assign(&mut self, name: &str, value: Value, pos: SourcePos) -> Result<()> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some((slot, mutable)) = scope.get_mut(name) {
                if !*mutable {
                    return Err(self.error(pos, format!("cannot assign to const `{name}`")));
                }
                *slot = value;
                return Ok(());
            }
        }
        Err(self.error(pos, format!("assignment to undefined variable `{name}`")))
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.scopes.push(HashMap::new());
        let out = f(self);
        self.scopes.pop();
        out
    }

    // ---- statements ----

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::Let { name, value, mutable } => {
                let value = self.expr(value)?;
                self.declare(name, value, *mutable);
            }
            Stmt::Assign { name, value, pos } => {
                let value = self.expr(value)?;
                self.assign(name, value, *pos)?;
            }
            Stmt::Func { name, params, body, .. } => {
                // macros share the calling convention; re-expansion per call
                // falls out of bodies being evaluated on every invocation
                self.funcs.insert(
                    name.clone(),
                    FuncDef { params: params.clone(), body: body.clone() },
                );
            }
            Stmt::If { cond, then, otherwise } => {
                let branch = if self.expr(cond)?.truthy() { then } else { otherwise };
                let flow = self.scoped(|eval| eval.block(branch))?;
                if let Flow::Return(_) = flow {
                    return Ok(flow);
                }
            }
            Stmt::For { var, iter, body } => {
                let items = match self.expr(iter)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(self.error(
                            pos_of(iter),
                            format!("`for` expects an array, got {}", other.type_name()),
                        ))
                    }
                };
                for item in items {
                    let flow = self.scoped(|eval| {
                        eval.declare(var, item.clone(), false);
                        eval.block(body)
                    })?;
                    if let Flow::Return(_) = flow {
                        return Ok(flow);
                    }
                }
            }
            Stmt::Return { value, .. } => {
                let value =
                    value.as_ref().map(|v| self.expr(v)).transpose()?.unwrap_or(Value::Null);
                return Ok(Flow::Return(value));
            }
            Stmt::Expr(expr) => {
                self.expr(expr)?;
            }
            Stmt::Target { name, fields, pos } => self.target(name, fields, *pos)?,
        }
        Ok(Flow::Normal)
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            if let Flow::Return(value) = self.stmt(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    // ---- target declarations ----

    fn target(&mut self, name: &Expr, fields: &[(String, Expr)], pos: SourcePos) -> Result<()> {
        let name = match self.expr(name)? {
            Value::Str(s) => s,
            other => {
                return Err(self.error(
                    pos,
                    format!("target name must be a string, got {}", other.type_name()),
                ))
            }
        };

        let mut raw = RawTarget {
            name,
            package: self.package.clone(),
            file: self.file.clone(),
            config: serde_json::Value::Object(Default::default()),
            ..Default::default()
        };
        let mut config = serde_json::Map::new();

        for (field, expr) in fields {
            let value = self.expr(expr)?;
            match field.as_str() {
                "type" => raw.kind = Some(self.want_str(field, &value, expr)?),
                "language" => raw.language = Some(self.want_str(field, &value, expr)?),
                "sources" => raw.sources = self.want_str_array(field, &value, expr)?,
                "deps" => raw.deps = self.want_str_array(field, &value, expr)?,
                "flags" => raw.flags = self.want_str_array(field, &value, expr)?,
                "output" => raw.output = Some(self.want_str(field, &value, expr)?),
                "env" => {
                    let Value::Map(entries) = &value else {
                        return Err(self.field_type_error(field, "map", &value));
                    };
                    for (key, entry) in entries {
                        let Value::Str(s) = entry else {
                            return Err(self.field_type_error(field, "map of strings", entry));
                        };
                        raw.env.insert(key.clone(), s.clone());
                    }
                }
                "timeout" => match value {
                    Value::Int(ms) if ms > 0 => raw.timeout_ms = Some(ms as u64),
                    other => {
                        return Err(self.field_type_error(field, "positive int (ms)", &other))
                    }
                },
                // anything else is language-specific configuration
                _ => {
                    config.insert(field.clone(), value.to_json());
                }
            }
        }

        raw.config = serde_json::Value::Object(config);
        raw.effects = self.effects.clone();
        self.targets.push(raw);
        Ok(())
    }

    fn want_str(&self, field: &str, value: &Value, _expr: &Expr) -> Result<String> {
        match value {
            Value::Str(s) => Ok(s.clone()),
            other => Err(self.field_type_error(field, "string", other)),
        }
    }

    fn want_str_array(&self, field: &str, value: &Value, _expr: &Expr) -> Result<Vec<String>> {
        let Value::Array(items) = value else {
            return Err(self.field_type_error(field, "array of strings", value));
        };
        items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s.clone()),
                other => Err(self.field_type_error(field, "array of strings", other)),
            })
            .collect()
    }

    fn field_type_error(&self, field: &str, expected: &'static str, actual: &Value) -> BuildError {
        BuildError::FieldType {
            file: self.file.clone(),
            field: field.to_string(),
            expected,
            actual: actual.type_name().to_string(),
        }
    }

    // ---- expressions ----

    fn expr(&mut self, expr: &Expr) -> Result<Value> {
        let pos = expr.pos;
        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(v) => Ok(Value::Int(*v)),
            ExprKind::Float(v) => Ok(Value::Float(*v)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Ident(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| self.error(pos, format!("undefined variable `{name}`"))),
            ExprKind::Array(items) => {
                items.iter().map(|item| self.expr(item)).collect::<Result<_>>().map(Value::Array)
            }
            ExprKind::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.expr(value)?);
                }
                Ok(Value::Map(map))
            }
            ExprKind::Unary(op, operand) => {
                let value = self.expr(operand)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Int(v)) => Ok(Value::Int(-v)),
                    (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
                    (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
                    (UnaryOp::Neg, other) => {
                        Err(self.error(pos, format!("cannot negate {}", other.type_name())))
                    }
                }
            }
            ExprKind::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs, pos),
            ExprKind::Ternary(cond, then, otherwise) => {
                if self.expr(cond)?.truthy() {
                    self.expr(then)
                } else {
                    self.expr(otherwise)
                }
            }
            ExprKind::Call { callee, args } => self.call(callee, args, pos),
            ExprKind::Index { base, index } => {
                let base = self.expr(base)?;
                let index = self.expr(index)?;
                match (&base, &index) {
                    (Value::Array(items), Value::Int(i)) => {
                        let idx = usize::try_from(*i).ok().filter(|i| *i < items.len());
                        idx.map(|i| items[i].clone()).ok_or_else(|| {
                            self.error(pos, format!("index {i} out of bounds ({})", items.len()))
                        })
                    }
                    (Value::Map(entries), Value::Str(key)) => Ok(entries
                        .get(key)
                        .cloned()
                        .unwrap_or(Value::Null)),
                    _ => Err(self.error(
                        pos,
                        format!("cannot index {} with {}", base.type_name(), index.type_name()),
                    )),
                }
            }
            ExprKind::Member { base, field } => {
                let base = self.expr(base)?;
                match base {
                    Value::Map(entries) => Ok(entries.get(field).cloned().unwrap_or(Value::Null)),
                    other => Err(self.error(
                        pos,
                        format!("member access on {} (`.{field}`)", other.type_name()),
                    )),
                }
            }
            ExprKind::Lambda { params, body } => {
                // capture by value; the workspace language has no mutation
                // through closures
                let mut captured = HashMap::new();
                for scope in &self.scopes {
                    for (name, (value, _)) in scope {
                        captured.insert(name.clone(), value.clone());
                    }
                }
                Ok(Value::Lambda(Rc::new(Closure {
                    params: params.clone(),
                    body: (**body).clone(),
                    captured,
                })))
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, pos: SourcePos) -> Result<Value> {
        // short-circuiting forms first
        match op {
            BinaryOp::And => {
                let lhs = self.expr(lhs)?;
                if !lhs.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.expr(rhs)?.truthy()));
            }
            BinaryOp::Or => {
                let lhs = self.expr(lhs)?;
                if lhs.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.expr(rhs)?.truthy()));
            }
            _ => {}
        }

        let lhs = self.expr(lhs)?;
        let rhs = self.expr(rhs)?;
        let mismatch = |this: &Self| {
            this.error(
                pos,
                format!("cannot apply operator to {} and {}", lhs.type_name(), rhs.type_name()),
            )
        };

        let value = match op {
            BinaryOp::Add => match (&lhs, &rhs) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                (Value::Int(a), Value::Float(b)) => Value::Float(*a as f64 + b),
                (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
                (Value::Str(a), b) => Value::Str(format!("{a}{b}")),
                (Value::Array(a), Value::Array(b)) => {
                    Value::Array(a.iter().chain(b).cloned().collect())
                }
                _ => return Err(mismatch(self)),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                match (&lhs, &rhs) {
                    (Value::Int(a), Value::Int(b)) => {
                        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && *b == 0 {
                            return Err(self.error(pos, "division by zero"));
                        }
                        Value::Int(match op {
                            BinaryOp::Sub => a - b,
                            BinaryOp::Mul => a * b,
                            BinaryOp::Div => a / b,
                            _ => a % b,
                        })
                    }
                    (Value::Float(a), Value::Float(b)) => Value::Float(match op {
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        _ => a % b,
                    }),
                    _ => return Err(mismatch(self)),
                }
            }
            BinaryOp::Eq => Value::Bool(lhs == rhs),
            BinaryOp::NotEq => Value::Bool(lhs != rhs),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                let ord = match (&lhs, &rhs) {
                    (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
                    (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
                    (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
                    (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
                    (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                    _ => None,
                }
                .ok_or_else(|| mismatch(self))?;
                Value::Bool(match op {
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::LtEq => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                })
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(value)
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], pos: SourcePos) -> Result<Value> {
        // builtins and file-level functions dispatch by name
        if let ExprKind::Ident(name) = &callee.kind {
            if self.lookup(name).is_none() {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                return self.call_named(name, values, pos);
            }
        }

        let callee_value = self.expr(callee)?;
        let Value::Lambda(closure) = callee_value else {
            return Err(
                self.error(pos, format!("cannot call {}", callee_value.type_name()))
            );
        };
        if closure.params.len() != args.len() {
            return Err(self.error(
                pos,
                format!("lambda takes {} arguments, got {}", closure.params.len(), args.len()),
            ));
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.expr(arg)?);
        }
        self.scoped(|eval| {
            for (name, value) in closure.captured.iter() {
                eval.declare(name, value.clone(), false);
            }
            for (param, value) in closure.params.iter().zip(values) {
                eval.declare(param, value, false);
            }
            eval.expr(&closure.body)
        })
    }

    fn call_named(&mut self, name: &str, args: Vec<Value>, pos: SourcePos) -> Result<Value> {
        match name {
            "env" => self.builtin_env(args, pos),
            "glob" => self.builtin_glob(args, pos),
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.len() as i64)),
                [Value::Array(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::Map(entries)] => Ok(Value::Int(entries.len() as i64)),
                _ => Err(self.error(pos, "len() takes a string, array or map")),
            },
            "range" => match args.as_slice() {
                [Value::Int(n)] => Ok(Value::Array((0..*n).map(Value::Int).collect())),
                _ => Err(self.error(pos, "range() takes an int")),
            },
            "join" => match args.as_slice() {
                [Value::Array(items), Value::Str(sep)] => {
                    let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                    Ok(Value::Str(parts.join(sep)))
                }
                _ => Err(self.error(pos, "join() takes an array and a separator")),
            },
            _ => {
                let Some(def) = self.funcs.get(name) else {
                    return Err(self.error(pos, format!("unknown function `{name}`")));
                };
                if def.params.len() != args.len() {
                    return Err(self.error(
                        pos,
                        format!("`{name}` takes {} arguments, got {}", def.params.len(), args.len()),
                    ));
                }
                let params = def.params.clone();
                let body = def.body.clone();
                self.scoped(|eval| {
                    for (param, value) in params.iter().zip(args) {
                        eval.declare(param, value, false);
                    }
                    match eval.block(&body)? {
                        Flow::Return(value) => Ok(value),
                        Flow::Normal => Ok(Value::Null),
                    }
                })
            }
        }
    }

    fn builtin_env(&mut self, args: Vec<Value>, pos: SourcePos) -> Result<Value> {
        let (key, default) = match args.as_slice() {
            [Value::Str(key)] => (key.clone(), None),
            [Value::Str(key), Value::Str(default)] => (key.clone(), Some(default.clone())),
            _ => return Err(self.error(pos, "env() takes a key and an optional default")),
        };
        let observed = (self.env_lookup)(&key).or(default).unwrap_or_default();
        self.effects.push(Effect {
            builtin: "env".into(),
            input: key,
            observed: observed.clone(),
        });
        Ok(Value::Str(observed))
    }

    fn builtin_glob(&mut self, args: Vec<Value>, pos: SourcePos) -> Result<Value> {
        let [Value::Str(pattern)] = args.as_slice() else {
            return Err(self.error(pos, "glob() takes a pattern string"));
        };
        let full = self.package_dir.join(pattern);
        let paths = glob::glob(&full.to_string_lossy())
            .map_err(|err| self.error(pos, format!("invalid glob `{pattern}`: {err}")))?;
        let mut matches = Vec::new();
        for path in paths {
            let path = path.map_err(|err| self.error(pos, format!("glob `{pattern}`: {err}")))?;
            let rel = path.strip_prefix(&self.package_dir).unwrap_or(&path);
            matches.push(rel.to_string_lossy().replace('\\', "/"));
        }
        matches.sort();
        self.effects.push(Effect {
            builtin: "glob".into(),
            input: pattern.clone(),
            observed: matches.join(";"),
        });
        Ok(Value::Array(matches.into_iter().map(Value::Str).collect()))
    }
}

fn pos_of(expr: &Expr) -> SourcePos {
    expr.pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse_file;

    fn eval(input: &str) -> Vec<RawTarget> {
        eval_with_env(input, |_| None)
    }

    fn eval_with_env(
        input: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<RawTarget> {
        let file = parse_file(input, Path::new("Builderfile")).unwrap();
        Evaluator::new("Builderfile", "pkg", "/tmp/pkg")
            .with_env_lookup(lookup)
            .run(&file)
            .unwrap()
    }

    #[test]
    fn declares_targets_with_fields() {
        let targets = eval(
            r#"
            target("app") {
                type: "executable";
                language: "python";
                sources: ["main.py"];
                deps: [":lib"];
                flags: ["-O2"];
                env: { PYTHONPATH: "src" };
                timeout: 5000;
                optimization: 2;
            }
            "#,
        );
        assert_eq!(targets.len(), 1);
        let t = &targets[0];
        assert_eq!(t.name, "app");
        assert_eq!(t.package, "pkg");
        assert_eq!(t.kind.as_deref(), Some("executable"));
        assert_eq!(t.sources, ["main.py"]);
        assert_eq!(t.env.get("PYTHONPATH").unwrap(), "src");
        assert_eq!(t.timeout_ms, Some(5000));
        assert_eq!(t.config["optimization"], 2);
    }

    #[test]
    fn scripting_layer_drives_declarations() {
        let targets = eval(
            r#"
            let variants = ["core", "extra"];
            fn lib(name, idx) {
                target(name) {
                    type: "library";
                    language: "python";
                    sources: [name + ".py"];
                    order: idx;
                }
            }
            for i in range(len(variants)) {
                lib(variants[i], i)
            }
            "#,
        );
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "core");
        assert_eq!(targets[1].name, "extra");
        assert_eq!(targets[1].config["order"], 1);
    }

    #[test]
    fn macros_expand_per_call() {
        let targets = eval(
            r#"
            macro pair(name) {
                target(name + "_lib") { type: "library"; language: "go"; }
                target(name + "_test") { type: "test"; language: "go"; deps: [":" + name + "_lib"]; }
            }
            pair("net")
            pair("io")
            "#,
        );
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[3].name, "io_test");
        assert_eq!(targets[3].deps, [":io_lib"]);
    }

    #[test]
    fn lambdas_ternary_and_ops() {
        let targets = eval(
            r#"
            let mode = |debug| debug ? "dev" : "release";
            const opt = 1 + 2 * 3;
            target("app") {
                type: "executable";
                language: "go";
                profile: mode(false);
                level: opt;
            }
            "#,
        );
        assert_eq!(targets[0].config["profile"], "release");
        assert_eq!(targets[0].config["level"], 7);
    }

    #[test]
    fn env_builtin_records_effect() {
        let targets = eval_with_env(
            r#"
            let cc = env("CC", "gcc");
            target("a") { type: "library"; language: "c"; compiler: cc; }
            "#,
            |key| (key == "CC").then(|| "clang".to_string()),
        );
        assert_eq!(targets[0].config["compiler"], "clang");
        let effect = &targets[0].effects[0];
        assert_eq!(effect.builtin, "env");
        assert_eq!(effect.input, "CC");
        assert_eq!(effect.observed, "clang");
    }

    #[test]
    fn env_default_applies_when_unset() {
        let targets = eval(
            r#"
            target("a") { type: "library"; language: "c"; compiler: env("CC_UNSET_XYZ", "cc"); }
            "#,
        );
        assert_eq!(targets[0].config["compiler"], "cc");
        assert_eq!(targets[0].effects[0].observed, "cc");
    }

    #[test]
    fn const_rejects_assignment() {
        let file = parse_file("const x = 1; x = 2;", Path::new("f")).unwrap();
        let err = Evaluator::new("f", "", "/tmp").run(&file).unwrap_err();
        assert!(err.to_string().contains("const"), "{err}");
    }

    #[test]
    fn field_type_errors_are_typed() {
        let file =
            parse_file(r#"target("a") { type: "library"; sources: "main.py"; }"#, Path::new("f"))
                .unwrap();
        let err = Evaluator::new("f", "", "/tmp").run(&file).unwrap_err();
        assert!(matches!(err, BuildError::FieldType { .. }), "{err}");
    }

    #[test]
    fn string_indexing_and_member_access() {
        let targets = eval(
            r#"
            let cfg = { flags: ["-a", "-b"], nested: { on: true } };
            target("a") {
                type: "library";
                language: "c";
                first: cfg.flags[0];
                on: cfg.nested.on;
            }
            "#,
        );
        assert_eq!(targets[0].config["first"], "-a");
        assert_eq!(targets[0].config["on"], true);
    }
}
