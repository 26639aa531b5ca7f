// Thin wrapper over the generated expression parser.

use crate::ast::Expr;
use crate::grammar;


// Parse expression source text. The error is the parser's own
// rendering (unexpected token, location); callers prefix it with the
// block context.
pub fn parse(text: &str) -> Result<Expr, String> {
    grammar::ExprParser::new()
        .parse(text)
        .map_err(|e| format!("{}", e))
}


#[cfg(test)]
mod tests {
    use super::parse;
    use crate::ast::*;
    use BinOp::*;

    fn assert_parses_to(text: &'static str, ast: Expr) {
        assert_eq!(parse(text).unwrap(), ast);
    }

    #[test]
    fn test_terms() {
        assert_parses_to("42", Expr::Int(42));
        assert_parses_to("42.0", Expr::Float(42.0));
        assert_parses_to("(42)", Expr::Int(42));
        assert_parses_to("foo", Expr::Id(String::from("foo")));
    }

    #[test]
    fn test_precedence() {
        assert_parses_to("1 + 2 * 3", bin(
            Add,
            Expr::Int(1),
            bin(Mul, Expr::Int(2), Expr::Int(3))
        ));

        assert_parses_to("(1 + 2) * 3", bin(
            Mul,
            bin(Add, Expr::Int(1), Expr::Int(2)),
            Expr::Int(3)
        ));

        assert_parses_to("1 - 2 - 3", bin(
            Sub,
            bin(Sub, Expr::Int(1), Expr::Int(2)),
            Expr::Int(3)
        ));
    }

    #[test]
    fn test_relational() {
        assert_parses_to("3 + 4 < 3 * 4", bin(
            Lt,
            bin(Add, Expr::Int(3), Expr::Int(4)),
            bin(Mul, Expr::Int(3), Expr::Int(4))
        ));

        assert_parses_to("3 + 4 > 3 * 4", bin(
            Gt,
            bin(Add, Expr::Int(3), Expr::Int(4)),
            bin(Mul, Expr::Int(3), Expr::Int(4))
        ));

        assert_parses_to("3 + 4 <= 3 * 4", bin(
            Lte,
            bin(Add, Expr::Int(3), Expr::Int(4)),
            bin(Mul, Expr::Int(3), Expr::Int(4))
        ));

        assert_parses_to("3 + 4 >= 3 * 4", bin(
            Gte,
            bin(Add, Expr::Int(3), Expr::Int(4)),
            bin(Mul, Expr::Int(3), Expr::Int(4))
        ));

        assert_parses_to("3 + 4 == 3 * 4", bin(
            Eq,
            bin(Add, Expr::Int(3), Expr::Int(4)),
            bin(Mul, Expr::Int(3), Expr::Int(4))
        ));
    }

    #[test]
    fn test_unary_and_calls() {
        assert_parses_to("-x", un(UnOp::Neg, Expr::Id(String::from("x"))));

        assert_parses_to("sin(t)", call(
            String::from("sin"),
            vec![Expr::Id(String::from("t"))]
        ));

        assert_parses_to("lerp(a, b, 0.5)", call(
            String::from("lerp"),
            vec![
                Expr::Id(String::from("a")),
                Expr::Id(String::from("b")),
                Expr::Float(0.5),
            ]
        ));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("1 +").is_err());
        assert!(parse("(1").is_err());
        assert!(parse("1 ** 2").is_err());
    }
}
