//! Key ranges: half-open/closed intervals over the key order.

use serde::{Deserialize, Serialize};

use crate::value::Key;

/// A range of keys with optionally-absent, optionally-open bounds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    #[serde(default)]
    pub lower_open: bool,
    #[serde(default)]
    pub upper_open: bool,
}

impl KeyRange {
    /// A range bounded on both sides.
    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Self {
        KeyRange {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        }
    }

    /// A range with only a lower bound.
    pub fn lower_bound(lower: Key, open: bool) -> Self {
        KeyRange {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    /// A range with only an upper bound.
    pub fn upper_bound(upper: Key, open: bool) -> Self {
        KeyRange {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        }
    }

    /// The degenerate range containing exactly one key.
    pub fn only(key: Key) -> Self {
        KeyRange {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// Whether a key falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }

    /// Project the range onto a SQL `WHERE` fragment over the given column.
    ///
    /// Identifiers are double-quoted; values become positional parameters.
    /// A tuple-bounded range expands lexicographically over the column's
    /// component columns (`col_0`, `col_1`, ...), which is how the
    /// relational engine lays out tuple keys. The expansion is a
    /// disjunction of prefix-equality conjunctions, so the projected
    /// predicate agrees with the tuple key order.
    pub fn to_sql(&self, column: &str) -> SqlFragment {
        let mut fragment = SqlFragment::default();
        if let Some(lower) = &self.lower {
            let op = if self.lower_open { ">" } else { ">=" };
            push_bound(&mut fragment, column, op, lower);
        }
        if let Some(upper) = &self.upper {
            let op = if self.upper_open { "<" } else { "<=" };
            push_bound(&mut fragment, column, op, upper);
        }
        fragment
    }
}

/// A SQL text fragment plus its positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Key>,
}

impl SqlFragment {
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// Append a conjunct, inserting `AND` between clauses.
    pub fn and(&mut self, clause: &str, params: impl IntoIterator<Item = Key>) {
        if !self.sql.is_empty() {
            self.sql.push_str(" AND ");
        }
        self.sql.push_str(clause);
        self.params.extend(params);
    }
}

/// Quote an identifier with the layer's double-quote convention.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn push_bound(fragment: &mut SqlFragment, column: &str, op: &str, bound: &Key) {
    match bound {
        Key::Tuple(parts) if parts.len() > 1 => {
            // Lexicographic: the bound holds when some prefix of components
            // matches exactly and the next component clears its comparison.
            // A plain per-column conjunction would disagree with the tuple
            // order whenever a leading component differs.
            let mut disjuncts = Vec::with_capacity(parts.len());
            let mut params = Vec::new();
            for i in 0..parts.len() {
                let mut conj = Vec::with_capacity(i + 1);
                for (j, part) in parts[..i].iter().enumerate() {
                    conj.push(format!("{} = ?", component(column, j)));
                    params.push(part.clone());
                }
                let cmp = if i == parts.len() - 1 { op } else { strict(op) };
                conj.push(format!("{} {cmp} ?", component(column, i)));
                params.push(parts[i].clone());
                disjuncts.push(format!("({})", conj.join(" AND ")));
            }
            fragment.and(&format!("({})", disjuncts.join(" OR ")), params);
        }
        Key::Tuple(parts) => {
            if let Some(part) = parts.first() {
                fragment.and(
                    &format!("{} {op} ?", component(column, 0)),
                    [part.clone()],
                );
            }
        }
        scalar => {
            fragment.and(
                &format!("{} {op} ?", quote_ident(column)),
                [scalar.clone()],
            );
        }
    }
}

fn component(column: &str, i: usize) -> String {
    quote_ident(&format!("{column}_{i}"))
}

fn strict(op: &str) -> &'static str {
    match op {
        ">" | ">=" => ">",
        _ => "<",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_respects_open_bounds() {
        let range = KeyRange::bound("m".into(), "t".into(), false, true);
        assert!(range.contains(&"m".into()));
        assert!(range.contains(&"p".into()));
        assert!(!range.contains(&"t".into()));
        assert!(!range.contains(&"l".into()));
    }

    #[test]
    fn only_matches_exactly_one_key() {
        let range = KeyRange::only(Key::Number(7.0));
        assert!(range.contains(&Key::Number(7.0)));
        assert!(!range.contains(&Key::Number(7.5)));
    }

    #[test]
    fn unbounded_contains_everything() {
        let range = KeyRange::default();
        assert!(range.is_unbounded());
        assert!(range.contains(&Key::Text("anything".into())));
    }

    #[test]
    fn sql_projection_binds_parameters() {
        let range = KeyRange::bound(Key::Number(1.0), Key::Number(9.0), true, false);
        let fragment = range.to_sql("price");
        assert_eq!(fragment.sql, "\"price\" > ? AND \"price\" <= ?");
        assert_eq!(fragment.params, vec![Key::Number(1.0), Key::Number(9.0)]);
    }

    #[test]
    fn tuple_bounds_expand_lexicographically() {
        let lower = Key::Tuple(vec![Key::Number(1.0), Key::Text("a".into())]);
        let range = KeyRange::lower_bound(lower, true);
        let fragment = range.to_sql("pos");
        assert_eq!(
            fragment.sql,
            "((\"pos_0\" > ?) OR (\"pos_0\" = ? AND \"pos_1\" > ?))"
        );
        assert_eq!(
            fragment.params,
            vec![
                Key::Number(1.0),
                Key::Number(1.0),
                Key::Text("a".into()),
            ]
        );

        let closed = KeyRange::lower_bound(
            Key::Tuple(vec![Key::Number(1.0), Key::Text("a".into())]),
            false,
        );
        assert_eq!(
            closed.to_sql("pos").sql,
            "((\"pos_0\" > ?) OR (\"pos_0\" = ? AND \"pos_1\" >= ?))"
        );
    }

    #[test]
    fn tuple_contains_follows_the_tuple_order() {
        // A candidate greater on the leading component is inside the range
        // even when its trailing component is smaller than the bound's.
        let range = KeyRange::lower_bound(
            Key::Tuple(vec![Key::Number(1.0), Key::Number(5.0)]),
            true,
        );
        assert!(range.contains(&Key::Tuple(vec![Key::Number(2.0), Key::Number(0.0)])));
        assert!(!range.contains(&Key::Tuple(vec![Key::Number(1.0), Key::Number(5.0)])));
        assert!(!range.contains(&Key::Tuple(vec![Key::Number(1.0), Key::Number(4.0)])));
    }
}
