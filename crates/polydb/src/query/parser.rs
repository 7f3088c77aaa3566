//! Recursive descent parser for the accepted query grammar.
//!
//! ```text
//! query  := verb args FROM "<store>" [ where_clause ] [ ORDER BY <idx> [DESC] ]
//!           [ LIMIT n ] [ OFFSET n ]
//! verb   := SELECT | COUNT | SUM | AVG | MIN | MAX | CONCAT
//! args   := "*" | <field> | "(" <field> {, <field>} ")"
//! ```
//!
//! Keywords are case-insensitive. No joins, no subqueries, no grouping;
//! anything else is a [`DbError::SqlParse`] carrying the offending
//! fragment. Complementary bounds on one field (`x > 1 AND x < 5`) merge
//! into a single where; a second bound on an already-bounded side is the
//! duplicate-where compile error.

use polydb_common::{DbError, Key, KeyRange, Result};

use crate::backend::Direction;

use super::ir::{MapExpr, QueryIr, ReduceExpr, WhereClause};

// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Quoted(String),
    Str(String),
    Num(f64),
    Star,
    LParen,
    RParen,
    Comma,
    Op(&'static str),
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Word(w) => format!("'{w}'"),
            Tok::Quoted(q) => format!("\"{q}\""),
            Tok::Str(s) => format!("'{s}'"),
            Tok::Num(n) => n.to_string(),
            Tok::Star => "'*'".into(),
            Tok::LParen => "'('".into(),
            Tok::RParen => "')'".into(),
            Tok::Comma => "','".into(),
            Tok::Op(op) => format!("'{op}'"),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Tok>> {
    let bytes = source.as_bytes();
    let mut toks = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'*' => {
                toks.push(Tok::Star);
                pos += 1;
            }
            b'(' => {
                toks.push(Tok::LParen);
                pos += 1;
            }
            b')' => {
                toks.push(Tok::RParen);
                pos += 1;
            }
            b',' => {
                toks.push(Tok::Comma);
                pos += 1;
            }
            b'=' => {
                toks.push(Tok::Op("="));
                pos += 1;
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    toks.push(Tok::Op("<="));
                    pos += 2;
                } else {
                    toks.push(Tok::Op("<"));
                    pos += 1;
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    toks.push(Tok::Op(">="));
                    pos += 2;
                } else {
                    toks.push(Tok::Op(">"));
                    pos += 1;
                }
            }
            b'"' => {
                let (text, consumed) = scan_delimited(&source[pos..], '"')?;
                toks.push(Tok::Quoted(text));
                pos += consumed;
            }
            b'\'' => {
                let (text, consumed) = scan_delimited(&source[pos..], '\'')?;
                toks.push(Tok::Str(text));
                pos += consumed;
            }
            b'0'..=b'9' | b'-' | b'.' => {
                let start = pos;
                pos += 1;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.' || bytes[pos] == b'e'
                        || bytes[pos] == b'E' || bytes[pos] == b'-' || bytes[pos] == b'+')
                {
                    pos += 1;
                }
                let text = &source[start..pos];
                let n = text.parse::<f64>().map_err(|_| {
                    DbError::SqlParse(format!("invalid number '{text}'"))
                })?;
                toks.push(Tok::Num(n));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = pos;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'.')
                {
                    pos += 1;
                }
                toks.push(Tok::Word(source[start..pos].to_string()));
            }
            other => {
                return Err(DbError::SqlParse(format!(
                    "unexpected character '{}'",
                    other as char
                )));
            }
        }
    }
    Ok(toks)
}

/// Scan a quoted run starting at the delimiter, doubling as the escape.
fn scan_delimited(source: &str, delim: char) -> Result<(String, usize)> {
    let mut text = String::new();
    let mut chars = source.char_indices().skip(1).peekable();
    while let Some((i, c)) = chars.next() {
        if c == delim {
            if chars.peek().map(|(_, c)| *c) == Some(delim) {
                text.push(delim);
                chars.next();
            } else {
                return Ok((text, i + delim.len_utf8()));
            }
        } else {
            text.push(c);
        }
    }
    Err(DbError::SqlParse(format!("unterminated {delim}...{delim}")))
}

// Parser

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    source: String,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> DbError {
        let at = match self.peek() {
            Some(tok) => format!(" at {}", tok.describe()),
            None => " at end of input".to_string(),
        };
        DbError::SqlParse(format!("{}{at} in: {}", message.into(), self.source))
    }

    fn keyword(&mut self, word: &str) -> bool {
        if let Some(Tok::Word(w)) = self.peek()
            && w.eq_ignore_ascii_case(word)
        {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.keyword(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected {word}")))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        if matches!(self.peek(), Some(Tok::Word(_)) | Some(Tok::Quoted(_)))
            && let Some(Tok::Word(name)) | Some(Tok::Quoted(name)) = self.bump()
        {
            return Ok(name);
        }
        Err(self.error("expected a name"))
    }

    fn parse(&mut self) -> Result<QueryIr> {
        let verb = match self.bump() {
            Some(Tok::Word(w)) => w.to_ascii_uppercase(),
            _ => return Err(self.error("expected a query verb")),
        };

        let args = self.parse_args()?;

        self.expect_keyword("FROM")?;
        let store = self.expect_name()?;
        let mut ir = QueryIr::new(store);

        apply_verb(&mut ir, &verb, args).map_err(|e| match e {
            DbError::SqlParse(msg) => DbError::SqlParse(format!("{msg} in: {}", self.source)),
            other => other,
        })?;

        if self.keyword("WHERE") {
            loop {
                let (field, bound) = self.parse_condition()?;
                merge_where(&mut ir.wheres, field, bound)
                    .map_err(|e| self.error(e.message().to_string()))?;
                if !self.keyword("AND") {
                    break;
                }
            }
        }

        if self.keyword("ORDER") {
            self.expect_keyword("BY")?;
            ir.index = Some(self.expect_name()?);
            if self.keyword("DESC") {
                ir.direction = Direction::Prev;
            } else {
                self.keyword("ASC");
            }
        }

        if self.keyword("LIMIT") {
            ir.limit = Some(self.expect_integer()?);
        }
        if self.keyword("OFFSET") {
            ir.offset = Some(self.expect_integer()?);
        }

        if self.peek().is_some() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(ir)
    }

    fn parse_args(&mut self) -> Result<Args> {
        match self.peek() {
            Some(Tok::Star) => {
                self.pos += 1;
                Ok(Args::All)
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                // COUNT(*) arrives as a parenthesized star.
                if matches!(self.peek(), Some(Tok::Star)) {
                    self.pos += 1;
                    if !matches!(self.bump(), Some(Tok::RParen)) {
                        return Err(self.error("expected )"));
                    }
                    return Ok(Args::All);
                }
                let mut fields = vec![self.expect_name()?];
                while matches!(self.peek(), Some(Tok::Comma)) {
                    self.pos += 1;
                    fields.push(self.expect_name()?);
                }
                if !matches!(self.bump(), Some(Tok::RParen)) {
                    return Err(self.error("expected )"));
                }
                Ok(Args::Fields(fields))
            }
            Some(Tok::Word(_)) | Some(Tok::Quoted(_)) => {
                // A bare FROM means SELECT-everything was written as the
                // verb's only argument.
                if matches!(self.peek(), Some(Tok::Word(w)) if w.eq_ignore_ascii_case("FROM")) {
                    return Ok(Args::All);
                }
                Ok(Args::Fields(vec![self.expect_name()?]))
            }
            _ => Err(self.error("expected projection arguments")),
        }
    }

    fn parse_condition(&mut self) -> Result<(String, Bound)> {
        let field = self.expect_name()?;
        let op = match self.bump() {
            Some(Tok::Op(op)) => op,
            _ => return Err(self.error("expected a comparison operator")),
        };
        let key = match self.bump() {
            Some(Tok::Num(n)) => Key::number(n)?,
            Some(Tok::Str(s)) => Key::Text(s),
            _ => return Err(self.error("expected a literal")),
        };
        let bound = match op {
            "=" => Bound::Only(key),
            ">" => Bound::Lower(key, true),
            ">=" => Bound::Lower(key, false),
            "<" => Bound::Upper(key, true),
            "<=" => Bound::Upper(key, false),
            _ => return Err(self.error(format!("unsupported operator '{op}'"))),
        };
        Ok((field, bound))
    }

    fn expect_integer(&mut self) -> Result<u64> {
        match self.bump() {
            Some(Tok::Num(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
            _ => Err(self.error("expected a non-negative integer")),
        }
    }
}

enum Args {
    All,
    Fields(Vec<String>),
}

enum Bound {
    Only(Key),
    Lower(Key, bool),
    Upper(Key, bool),
}

fn apply_verb(ir: &mut QueryIr, verb: &str, args: Args) -> Result<()> {
    let single = |args: Args, verb: &str| -> Result<String> {
        match args {
            Args::Fields(mut fields) if fields.len() == 1 => Ok(fields.remove(0)),
            _ => Err(DbError::SqlParse(format!(
                "{verb} takes exactly one field"
            ))),
        }
    };

    match verb {
        "SELECT" => {
            ir.map = match args {
                Args::All => None,
                Args::Fields(mut fields) if fields.len() == 1 => {
                    Some(MapExpr::Field(fields.remove(0)))
                }
                Args::Fields(fields) => Some(MapExpr::Project(fields)),
            };
        }
        "COUNT" => ir.reduce = Some(ReduceExpr::Count),
        "SUM" => ir.reduce = Some(ReduceExpr::Sum(single(args, "SUM")?)),
        "AVG" => ir.reduce = Some(ReduceExpr::Avg(single(args, "AVG")?)),
        "MIN" => ir.reduce = Some(ReduceExpr::Min(single(args, "MIN")?)),
        "MAX" => ir.reduce = Some(ReduceExpr::Max(single(args, "MAX")?)),
        "CONCAT" => ir.reduce = Some(ReduceExpr::Concat(single(args, "CONCAT")?)),
        other => {
            return Err(DbError::SqlParse(format!("unknown verb '{other}'")));
        }
    }
    Ok(())
}

/// Fold a parsed condition into the where list. Complementary bounds on the
/// same field merge; a second bound on an occupied side is the duplicate
/// where-per-field error.
fn merge_where(wheres: &mut Vec<WhereClause>, field: String, bound: Bound) -> Result<()> {
    let existing = wheres.iter_mut().find(|w| w.field == field);
    match existing {
        None => {
            let range = match bound {
                Bound::Only(key) => KeyRange::only(key),
                Bound::Lower(key, open) => KeyRange::lower_bound(key, open),
                Bound::Upper(key, open) => KeyRange::upper_bound(key, open),
            };
            wheres.push(WhereClause::new(field, range));
            Ok(())
        }
        Some(clause) => {
            let dup = || {
                DbError::SqlParse(format!("duplicate where clause on field '{field}'"))
            };
            match bound {
                Bound::Only(_) => Err(dup()),
                Bound::Lower(key, open) => {
                    if clause.range.lower.is_some() {
                        return Err(dup());
                    }
                    clause.range.lower = Some(key);
                    clause.range.lower_open = open;
                    Ok(())
                }
                Bound::Upper(key, open) => {
                    if clause.range.upper.is_some() {
                        return Err(dup());
                    }
                    clause.range.upper = Some(key);
                    clause.range.upper_open = open;
                    Ok(())
                }
            }
        }
    }
}

/// Parse a query in the accepted grammar into an IR.
pub fn parse_query(source: &str) -> Result<QueryIr> {
    let mut parser = Parser {
        toks: lex(source)?,
        pos: 0,
        source: source.to_string(),
    };
    parser.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_star_with_range_and_paging() {
        let ir = parse_query(
            "SELECT * FROM \"orders\" WHERE price > 10 AND price <= 99 ORDER BY price LIMIT 5 OFFSET 2",
        )
        .unwrap();
        assert_eq!(ir.store, "orders");
        assert!(ir.map.is_none());
        assert_eq!(ir.index.as_deref(), Some("price"));
        assert_eq!(ir.direction, Direction::Next);
        assert_eq!(ir.limit, Some(5));
        assert_eq!(ir.offset, Some(2));

        assert_eq!(ir.wheres.len(), 1);
        let range = &ir.wheres[0].range;
        assert_eq!(range.lower, Some(Key::Number(10.0)));
        assert!(range.lower_open);
        assert_eq!(range.upper, Some(Key::Number(99.0)));
        assert!(!range.upper_open);
    }

    #[test]
    fn aggregate_verbs_lower_to_reduces() {
        let ir = parse_query("SUM(price) FROM \"orders\"").unwrap();
        assert_eq!(ir.reduce, Some(ReduceExpr::Sum("price".into())));

        let ir = parse_query("COUNT(*) FROM \"orders\"").unwrap();
        assert_eq!(ir.reduce, Some(ReduceExpr::Count));

        let ir = parse_query("avg(price) from orders").unwrap();
        assert_eq!(ir.reduce, Some(ReduceExpr::Avg("price".into())));
    }

    #[test]
    fn projection_forms() {
        let ir = parse_query("SELECT name FROM \"people\"").unwrap();
        assert_eq!(ir.map, Some(MapExpr::Field("name".into())));

        let ir = parse_query("SELECT (name, age) FROM \"people\"").unwrap();
        assert_eq!(
            ir.map,
            Some(MapExpr::Project(vec!["name".into(), "age".into()]))
        );
    }

    #[test]
    fn order_by_desc_reverses_direction() {
        let ir = parse_query("SELECT * FROM \"st\" ORDER BY k DESC").unwrap();
        assert_eq!(ir.index.as_deref(), Some("k"));
        assert_eq!(ir.direction, Direction::Prev);
    }

    #[test]
    fn string_literals_use_single_quotes() {
        let ir = parse_query("SELECT * FROM \"st\" WHERE k = 'it''s'").unwrap();
        assert_eq!(ir.wheres[0].range.lower, Some(Key::Text("it's".into())));
        assert_eq!(ir.wheres[0].range.upper, Some(Key::Text("it's".into())));
    }

    #[test]
    fn duplicate_where_on_one_field_fails() {
        let err = parse_query("SELECT * FROM \"st\" WHERE k > 'a' AND k > 'b'").unwrap_err();
        assert_eq!(err.kind(), "sql_parse_error");

        let err = parse_query("SELECT * FROM \"st\" WHERE k = 'a' AND k < 'b'").unwrap_err();
        assert_eq!(err.kind(), "sql_parse_error");
    }

    #[test]
    fn parse_failures_carry_the_offending_fragment() {
        let err = parse_query("SELECT * FROM").unwrap_err();
        assert!(err.message().contains("end of input"), "{err}");

        let err = parse_query("EXPLODE * FROM \"st\"").unwrap_err();
        assert!(err.message().contains("EXPLODE"), "{err}");

        let err = parse_query("SELECT * FROM \"a\" JOIN \"b\"").unwrap_err();
        assert_eq!(err.kind(), "sql_parse_error");
        assert!(err.message().contains("JOIN"), "{err}");
    }

    #[test]
    fn merged_bounds_stay_one_where() {
        let ir = parse_query("SELECT * FROM \"st\" WHERE k >= 'm' AND k < 't'").unwrap();
        assert_eq!(ir.wheres.len(), 1);
        assert!(!ir.wheres[0].range.lower_open);
        assert!(ir.wheres[0].range.upper_open);
    }
}
