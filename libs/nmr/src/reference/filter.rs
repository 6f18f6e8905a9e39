//! # Attribute Filter Expressions
//!
//! LDAP search-filter style expressions evaluated against registration
//! metadata:
//!
//! ```text
//! filter     = "(" filtercomp ")"
//! filtercomp = "&" filter+ | "|" filter+ | "!" filter | item
//! item       = attr "=" value        equality, or substring when value has *
//!            | attr "=*"             presence
//!            | attr "~=" value       approximate (case and whitespace blind)
//!            | attr ">=" value
//!            | attr "<=" value
//! ```
//!
//! Attribute names compare case-insensitively. `\` escapes `*`, `(`, `)` and
//! `\` inside values. Numbers compare numerically, booleans against
//! `true`/`false`, arrays match when any element matches.

use crate::service_registry::Properties;
use crate::{NmrError, NmrResult};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Parsed filter expression
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal(String, String),
    Approx(String, String),
    GreaterEq(String, String),
    LessEq(String, String),
    Present(String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
}

impl Filter {
    pub fn parse(expr: &str) -> NmrResult<Filter> {
        let mut parser = Parser {
            chars: expr.chars().collect(),
            pos: 0,
        };
        let filter = parser.filter()?;
        parser.skip_ws();
        if parser.pos != parser.chars.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(filter)
    }

    /// Evaluate against registration metadata
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(properties)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(properties)),
            Filter::Not(filter) => !filter.matches(properties),
            Filter::Present(attr) => attribute(properties, attr).is_some(),
            Filter::Equal(attr, operand) => {
                compare_attr(properties, attr, |v| compare(v, Op::Equal, operand))
            }
            Filter::Approx(attr, operand) => {
                compare_attr(properties, attr, |v| compare(v, Op::Approx, operand))
            }
            Filter::GreaterEq(attr, operand) => {
                compare_attr(properties, attr, |v| compare(v, Op::GreaterEq, operand))
            }
            Filter::LessEq(attr, operand) => {
                compare_attr(properties, attr, |v| compare(v, Op::LessEq, operand))
            }
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => compare_attr(properties, attr, |v| {
                substring(v, initial.as_deref(), any, last.as_deref())
            }),
        }
    }
}

impl FromStr for Filter {
    type Err = NmrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(filters) | Filter::Or(filters) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Filter::Not(filter) => write!(f, "(!{})", filter),
            Filter::Equal(a, v) => write!(f, "({}={})", a, escape(v)),
            Filter::Approx(a, v) => write!(f, "({}~={})", a, escape(v)),
            Filter::GreaterEq(a, v) => write!(f, "({}>={})", a, escape(v)),
            Filter::LessEq(a, v) => write!(f, "({}<={})", a, escape(v)),
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape(last))?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Escape a literal value for use inside a filter
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '*' | '(' | ')') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, msg: &str) -> NmrError {
        NmrError::InvalidFilter(format!("{} at position {}", msg, self.pos))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> NmrResult<()> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(&format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(&format!("expected '{}', found end of input", expected))),
        }
    }

    fn filter(&mut self) -> NmrResult<Filter> {
        self.skip_ws();
        self.expect('(')?;
        self.skip_ws();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of input")),
        };
        self.skip_ws();
        self.expect(')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> NmrResult<Vec<Filter>> {
        let mut filters = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('(') {
                break;
            }
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn item(&mut self) -> NmrResult<Filter> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '~' | '<' | '>' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(self.error("missing attribute name"));
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                Op::Equal
            }
            Some(c @ ('~' | '<' | '>')) => {
                self.pos += 1;
                self.expect('=')?;
                match c {
                    '~' => Op::Approx,
                    '<' => Op::LessEq,
                    _ => Op::GreaterEq,
                }
            }
            _ => return Err(self.error("expected comparison operator")),
        };

        let pieces = self.value()?;
        match op {
            Op::Equal if pieces.len() == 2 && pieces.iter().all(String::is_empty) => {
                Ok(Filter::Present(attr))
            }
            Op::Equal if pieces.len() > 1 => {
                let mut pieces = pieces;
                let last = pieces.pop().filter(|p| !p.is_empty());
                let initial = Some(pieces.remove(0)).filter(|p| !p.is_empty());
                let any = pieces.into_iter().filter(|p| !p.is_empty()).collect();
                Ok(Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                })
            }
            _ => {
                // '*' is only a wildcard for '='; elsewhere it is literal
                let operand = pieces.join("*");
                Ok(match op {
                    Op::Equal => Filter::Equal(attr, operand),
                    Op::Approx => Filter::Approx(attr, operand),
                    Op::GreaterEq => Filter::GreaterEq(attr, operand),
                    Op::LessEq => Filter::LessEq(attr, operand),
                })
            }
        }
    }

    /// Value up to the closing paren, split on unescaped '*'
    fn value(&mut self) -> NmrResult<Vec<String>> {
        let mut pieces = vec![String::new()];
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(')') => break,
                Some('\\') => {
                    self.pos += 1;
                    let Some(c) = self.peek() else {
                        return Err(self.error("dangling escape"));
                    };
                    if let Some(current) = pieces.last_mut() {
                        current.push(c);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    pieces.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(current) = pieces.last_mut() {
                        current.push(c);
                    }
                    self.pos += 1;
                }
            }
        }
        Ok(pieces)
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Equal,
    Approx,
    GreaterEq,
    LessEq,
}

fn attribute<'a>(properties: &'a Properties, attr: &str) -> Option<&'a Value> {
    properties.get(attr).or_else(|| {
        properties
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(attr))
            .map(|(_, value)| value)
    })
}

fn compare_attr(properties: &Properties, attr: &str, f: impl Fn(&Value) -> bool) -> bool {
    match attribute(properties, attr) {
        Some(Value::Array(items)) => items.iter().any(&f),
        Some(value) => f(value),
        None => false,
    }
}

fn compare(value: &Value, op: Op, operand: &str) -> bool {
    match value {
        Value::String(s) => match op {
            Op::Equal => s == operand,
            Op::Approx => normalize(s) == normalize(operand),
            Op::GreaterEq => s.as_str() >= operand,
            Op::LessEq => s.as_str() <= operand,
        },
        Value::Number(n) => {
            let (Some(lhs), Ok(rhs)) = (n.as_f64(), operand.trim().parse::<f64>()) else {
                return false;
            };
            match (op, lhs.partial_cmp(&rhs)) {
                (Op::Equal | Op::Approx, Some(ordering)) => ordering == Ordering::Equal,
                (Op::GreaterEq, Some(ordering)) => ordering != Ordering::Less,
                (Op::LessEq, Some(ordering)) => ordering != Ordering::Greater,
                (_, None) => false,
            }
        }
        Value::Bool(b) => match op {
            Op::Equal | Op::Approx => operand.trim().eq_ignore_ascii_case(&b.to_string()),
            Op::GreaterEq | Op::LessEq => false,
        },
        Value::Array(items) => items.iter().any(|v| compare(v, op, operand)),
        Value::Null | Value::Object(_) => false,
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring(value: &Value, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let Value::String(s) = value else {
        return false;
    };
    let mut rest = s.as_str();

    if let Some(initial) = initial {
        match rest.strip_prefix(initial) {
            Some(tail) => rest = tail,
            None => return false,
        }
    }

    for part in any {
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    match last {
        Some(last) => rest.ends_with(last),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_equality_and_presence() {
        let p = props(json!({"service": "echo", "Version": 2}));

        assert!(Filter::parse("(service=echo)").unwrap().matches(&p));
        assert!(!Filter::parse("(service=ping)").unwrap().matches(&p));
        assert!(Filter::parse("(version=2)").unwrap().matches(&p));
        assert!(Filter::parse("(SERVICE=*)").unwrap().matches(&p));
        assert!(!Filter::parse("(missing=*)").unwrap().matches(&p));
    }

    #[test]
    fn test_boolean_composition() {
        let p = props(json!({"service": "echo", "group": "g1", "weight": 10}));

        let f = Filter::parse("(&(service=echo)(|(group=g2)(weight>=5)))").unwrap();
        assert!(f.matches(&p));

        let f = Filter::parse("(&(service=echo)(!(group=g1)))").unwrap();
        assert!(!f.matches(&p));

        let f = Filter::parse(" ( | (weight<=9) (group~= G 1 ) ) ").unwrap();
        assert!(f.matches(&p));
    }

    #[test]
    fn test_substring() {
        let p = props(json!({"name": "orders-service-eu"}));

        assert!(Filter::parse("(name=orders*)").unwrap().matches(&p));
        assert!(Filter::parse("(name=*-eu)").unwrap().matches(&p));
        assert!(Filter::parse("(name=ord*serv*eu)").unwrap().matches(&p));
        assert!(!Filter::parse("(name=*us)").unwrap().matches(&p));
        assert!(!Filter::parse("(name=eu*orders)").unwrap().matches(&p));
    }

    #[test]
    fn test_multi_valued_and_typed_attributes() {
        let p = props(json!({"tags": ["a", "b"], "enabled": true, "ratio": 0.5}));

        assert!(Filter::parse("(tags=b)").unwrap().matches(&p));
        assert!(!Filter::parse("(tags=c)").unwrap().matches(&p));
        assert!(Filter::parse("(enabled=TRUE)").unwrap().matches(&p));
        assert!(Filter::parse("(ratio<=0.5)").unwrap().matches(&p));
        assert!(!Filter::parse("(ratio>=abc)").unwrap().matches(&p));
    }

    #[test]
    fn test_escapes() {
        let p = props(json!({"expr": "a*(b)"}));
        assert!(Filter::parse(r"(expr=a\*\(b\))").unwrap().matches(&p));
        assert_eq!(
            Filter::parse(r"(expr=a\*\(b\))").unwrap(),
            Filter::Equal("expr".into(), "a*(b)".into())
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "service=echo",
            "(service=echo",
            "(=echo)",
            "(&)",
            "(service echo)",
            "(service=echo))",
            r"(service=echo\",
        ] {
            assert!(
                matches!(Filter::parse(bad), Err(NmrError::InvalidFilter(_))),
                "expected parse error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        let text = "(&(service=echo)(|(name=a*b*c)(!(x=*)))(w>=3))";
        let filter: Filter = text.parse().unwrap();
        assert_eq!(filter.to_string(), text);
    }

    proptest! {
        #[test]
        fn escaped_value_matches_itself(value in ".*") {
            let filter = Filter::parse(&format!("(key={})", escape(&value))).unwrap();
            let p = props(json!({ "key": value.clone() }));
            prop_assert!(filter.matches(&p));
        }
    }
}
