use std::rc::Rc;


// Abstract over various memory management strategies.
pub type Node<T> = Rc<T>;


// Arithmetic and relational operations the expression language knows.
// Comparison results are numeric (0/1), matching the rest of the
// compiler: there is no boolean type in the little language.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
}


// ADT for expressions. Identifiers name block inputs (in0, in1,
// r0..rN) or well-known constants; calls name kernel functions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Id(String),
    Call(String, Vec<Expr>),
    Unary(UnOp, Node<Expr>),
    Binary(BinOp, Node<Expr>, Node<Expr>),
}


pub fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
    Expr::Binary(op, Node::new(l), Node::new(r))
}

pub fn un(op: UnOp, e: Expr) -> Expr {
    Expr::Unary(op, Node::new(e))
}

pub fn call(name: String, args: Vec<Expr>) -> Expr {
    Expr::Call(name, args)
}
