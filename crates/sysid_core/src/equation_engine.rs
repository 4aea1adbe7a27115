use std::cell::RefCell;
use std::collections::HashMap;

use thiserror::Error;

use crate::traits::DynamicalSystem;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EquationError {
    #[error("unexpected token {found:?} in {expression:?}")]
    UnexpectedToken { expression: String, found: String },
    #[error("expression {0:?} ended unexpectedly")]
    UnexpectedEnd(String),
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),
    #[error("unknown symbol {0:?}")]
    UnknownSymbol(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
}

/// Single-argument functions understood by the VM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Tanh,
    Exp,
    Ln,
    Sqrt,
    Abs,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" => Function::Ln,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        })
    }

    fn eval(self, a: f64) -> f64 {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
        }
    }
}

/// OpCodes for the stack-based evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    LoadConst(f64),
    /// Index into the state vector.
    LoadVar(usize),
    /// Index into the parameter vector (controls first, then constants).
    LoadParam(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Call(Function),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

pub struct VM;

impl VM {
    /// Runs `bytecode` against the given state and parameters. `stack` is scratch space.
    pub fn execute(bytecode: &Bytecode, vars: &[f64], params: &[f64], stack: &mut Vec<f64>) -> f64 {
        fn pop2(stack: &mut Vec<f64>) -> (f64, f64) {
            let b = stack.pop().unwrap_or(0.0);
            let a = stack.pop().unwrap_or(0.0);
            (a, b)
        }

        stack.clear();
        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(v) => v,
                OpCode::LoadVar(idx) => vars[idx],
                OpCode::LoadParam(idx) => params[idx],
                OpCode::Neg => -stack.pop().unwrap_or(0.0),
                OpCode::Call(func) => func.eval(stack.pop().unwrap_or(0.0)),
                OpCode::Add => {
                    let (a, b) = pop2(stack);
                    a + b
                }
                OpCode::Sub => {
                    let (a, b) = pop2(stack);
                    a - b
                }
                OpCode::Mul => {
                    let (a, b) = pop2(stack);
                    a * b
                }
                OpCode::Div => {
                    let (a, b) = pop2(stack);
                    a / b
                }
                OpCode::Pow => {
                    let (a, b) = pop2(stack);
                    a.powf(b)
                }
            };
            stack.push(value);
        }
        // Compiled expressions always leave exactly one value.
        stack.pop().unwrap_or(0.0)
    }
}

// --- AST & Parser ---

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(Function, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, EquationError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut end = start;
            let mut prev = c;
            while let Some(&(idx, d)) = chars.peek() {
                let exponent_sign = (d == '+' || d == '-') && (prev == 'e' || prev == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    end = idx + d.len_utf8();
                    prev = d;
                    chars.next();
                } else {
                    break;
                }
            }
            let literal = &input[start..end];
            let value = literal
                .parse()
                .map_err(|_| EquationError::InvalidNumber(literal.to_string()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(idx, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    end = idx + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(input[start..end].to_string()));
        } else {
            let token = match c {
                '+' | '-' | '*' | '/' | '^' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(EquationError::UnexpectedToken {
                        expression: input.to_string(),
                        found: other.to_string(),
                    })
                }
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

/// Parses an infix expression. `^` binds tighter than unary minus and is right-associative.
pub fn parse(input: &str) -> Result<Expr, EquationError> {
    let mut parser = Parser {
        source: input,
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.expression()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some(token) => Err(parser.unexpected(token)),
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek_op(&self) -> Option<char> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(c)) => Some(*c),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<Token, EquationError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| EquationError::UnexpectedEnd(self.source.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token) -> EquationError {
        let found = match token {
            Token::Number(n) => n.to_string(),
            Token::Ident(name) => name.clone(),
            Token::Op(c) => c.to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        };
        EquationError::UnexpectedToken {
            expression: self.source.to_string(),
            found,
        }
    }

    fn expression(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek_op() {
            self.pos += 1;
            let right = self.term()?;
            let op = if op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EquationError> {
        let mut left = self.unary()?;
        while let Some(op @ ('*' | '/')) = self.peek_op() {
            self.pos += 1;
            let right = self.unary()?;
            let op = if op == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EquationError> {
        match self.peek_op() {
            Some('-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some('+') => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, EquationError> {
        let base = self.primary()?;
        if self.peek_op() == Some('^') {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(Box::new(base), BinaryOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, EquationError> {
        match self.next()? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Ident(name) => {
                if self.tokens.get(self.pos) != Some(&Token::LParen) {
                    return Ok(Expr::Symbol(name));
                }
                let func = Function::from_name(&name)
                    .ok_or_else(|| EquationError::UnknownFunction(name.clone()))?;
                self.pos += 1;
                let arg = self.expression()?;
                self.expect_close()?;
                Ok(Expr::Call(func, Box::new(arg)))
            }
            Token::LParen => {
                let inner = self.expression()?;
                self.expect_close()?;
                Ok(inner)
            }
            other => Err(self.unexpected(&other)),
        }
    }

    fn expect_close(&mut self) -> Result<(), EquationError> {
        match self.next()? {
            Token::RParen => Ok(()),
            other => Err(self.unexpected(&other)),
        }
    }
}

/// Resolves symbol names to state or parameter slots.
pub struct Compiler {
    var_map: HashMap<String, usize>,
    param_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        let index = |names: &[String]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>()
        };
        Self {
            var_map: index(var_names),
            param_map: index(param_names),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, EquationError> {
        let mut ops = Vec::new();
        self.emit(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    /// Parses and compiles in one go.
    pub fn compile_str(&self, source: &str) -> Result<Bytecode, EquationError> {
        self.compile(&parse(source)?)
    }

    fn emit(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), EquationError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Symbol(name) => {
                let op = if let Some(&idx) = self.var_map.get(name) {
                    OpCode::LoadVar(idx)
                } else if let Some(&idx) = self.param_map.get(name) {
                    OpCode::LoadParam(idx)
                } else {
                    return Err(EquationError::UnknownSymbol(name.clone()));
                };
                ops.push(op);
            }
            Expr::Binary(left, op, right) => {
                self.emit(left, ops)?;
                self.emit(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(inner) => {
                self.emit(inner, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.emit(arg, ops)?;
                ops.push(OpCode::Call(*func));
            }
        }
        Ok(())
    }
}

/// A [`DynamicalSystem`] backed by compiled equations, one per state coordinate.
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub params: Vec<f64>,
    // Scratch stack; keeps `apply` allocation-free but makes the system !Sync.
    stack: RefCell<Vec<f64>>,
}

impl EquationSystem {
    pub fn new(equations: Vec<Bytecode>, params: Vec<f64>) -> Self {
        Self {
            equations,
            params,
            stack: RefCell::new(Vec::with_capacity(64)),
        }
    }
}

impl DynamicalSystem for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
        let mut stack = self.stack.borrow_mut();
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = VM::execute(eq, x, &self.params, &mut stack);
        }
    }
}
