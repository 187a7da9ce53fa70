//! Label selector parsing and evaluation.
//!
//! One selector string parses into one [`LabelQuery`]: a conjunction of terms
//! separated by top-level commas. Several selector strings are AND-ed.

#![forbid(unsafe_code)]

use std::fmt;

use corral_core::{Labels, StateError, StateResult};
use once_cell::sync::Lazy;
use regex::Regex;

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9.-]*[a-z0-9])?/)?[A-Za-z0-9]([A-Za-z0-9_.-]*[A-Za-z0-9])?$").expect("static regex")
});
static VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s,()=!<>]*$").expect("static regex"));
static SET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+)\s+(in|notin)\s*\((.*)\)$").expect("static regex"));

/// Label keys: optional lowercase DNS-ish prefix and `/`, then a name.
pub fn is_valid_key(key: &str) -> bool { KEY_RE.is_match(key) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Exists(String),
    NotExists(String),
    Equal(String, String),
    NotEqual(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Gt(String, i64),
    Lt(String, i64),
}

impl Term {
    pub fn key(&self) -> &str {
        match self {
            Term::Exists(k) | Term::NotExists(k) | Term::Equal(k, _) | Term::NotEqual(k, _) | Term::In(k, _) | Term::NotIn(k, _) | Term::Gt(k, _) | Term::Lt(k, _) => k,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let cur = labels.get(self.key());
        match self {
            Term::Exists(_) => cur.is_some(),
            Term::NotExists(_) => cur.is_none(),
            Term::Equal(_, v) => cur == Some(v.as_str()),
            Term::NotEqual(_, v) => cur != Some(v.as_str()),
            Term::In(_, set) => cur.map(|c| set.iter().any(|v| v == c)).unwrap_or(false),
            Term::NotIn(_, set) => cur.map(|c| !set.iter().any(|v| v == c)).unwrap_or(true),
            Term::Gt(_, n) => cur.and_then(|c| c.parse::<i64>().ok()).map(|c| c > *n).unwrap_or(false),
            Term::Lt(_, n) => cur.and_then(|c| c.parse::<i64>().ok()).map(|c| c < *n).unwrap_or(false),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Exists(k) => write!(f, "{}", k),
            Term::NotExists(k) => write!(f, "!{}", k),
            Term::Equal(k, v) => write!(f, "{}={}", k, v),
            Term::NotEqual(k, v) => write!(f, "{}!={}", k, v),
            Term::In(k, vs) => write!(f, "{} in ({})", k, vs.join(", ")),
            Term::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(", ")),
            Term::Gt(k, n) => write!(f, "{}>{}", k, n),
            Term::Lt(k, n) => write!(f, "{}<{}", k, n),
        }
    }
}

/// Parsed selector: every term must hold. No terms matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<Term>,
}

impl LabelQuery {
    pub fn all() -> Self { Self::default() }

    pub fn from_terms(terms: Vec<Term>) -> Self { Self { terms } }

    pub fn terms(&self) -> &[Term] { &self.terms }

    pub fn is_empty(&self) -> bool { self.terms.is_empty() }

    pub fn matches(&self, labels: &Labels) -> bool { self.terms.iter().all(|t| t.matches(labels)) }
}

impl fmt::Display for LabelQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

/// AND over several queries; an empty slice matches everything.
pub fn matches_all(queries: &[LabelQuery], labels: &Labels) -> bool {
    queries.iter().all(|q| q.matches(labels))
}

/// Parse every selector independently. Fails on the first malformed one.
pub fn parse_selectors<S: AsRef<str>>(selectors: &[S]) -> StateResult<Vec<LabelQuery>> {
    selectors.iter().map(|s| parse_selector(s.as_ref())).collect()
}

pub fn parse_selector(selector: &str) -> StateResult<LabelQuery> {
    let mut terms = Vec::new();
    for raw in split_top_level(selector).map_err(|reason| StateError::invalid_query(selector, reason))? {
        let part = raw.trim();
        if part.is_empty() {
            if selector.trim().is_empty() { continue; }
            return Err(StateError::invalid_query(selector, "empty term"));
        }
        let term = parse_term(part).map_err(|reason| StateError::invalid_query(selector, reason))?;
        terms.push(term);
    }
    Ok(LabelQuery { terms })
}

fn split_top_level(s: &str) -> Result<Vec<&str>, String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 { return Err("unbalanced ')'".into()); }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 { return Err("unbalanced '('".into()); }
    out.push(&s[start..]);
    Ok(out)
}

fn check_key(key: &str) -> Result<String, String> {
    let key = key.trim();
    if key.is_empty() { return Err("missing label key".into()); }
    if !is_valid_key(key) { return Err(format!("invalid label key {:?}", key)); }
    Ok(key.to_string())
}

fn check_value(value: &str) -> Result<String, String> {
    let value = value.trim();
    if !VALUE_RE.is_match(value) { return Err(format!("invalid label value {:?}", value)); }
    Ok(value.to_string())
}

fn parse_term(part: &str) -> Result<Term, String> {
    if let Some(caps) = SET_RE.captures(part) {
        let key = check_key(&caps[1])?;
        let values = caps[3]
            .split(',')
            .map(check_value)
            .collect::<Result<Vec<_>, _>>()?;
        if values.iter().any(|v| v.is_empty()) { return Err("empty value in set".into()); }
        return Ok(if &caps[2] == "in" { Term::In(key, values) } else { Term::NotIn(key, values) });
    }
    if part.contains('(') || part.contains(')') {
        return Err(format!("unexpected parenthesis in {:?}", part));
    }
    if let Some(rest) = part.strip_prefix('!') {
        return Ok(Term::NotExists(check_key(rest)?));
    }
    if let Some((k, v)) = part.split_once("!=") {
        return Ok(Term::NotEqual(check_key(k)?, check_value(v)?));
    }
    if let Some((k, v)) = part.split_once("==") {
        return Ok(Term::Equal(check_key(k)?, check_value(v)?));
    }
    if let Some((k, v)) = part.split_once('=') {
        return Ok(Term::Equal(check_key(k)?, check_value(v)?));
    }
    if let Some((k, v)) = part.split_once('>') {
        let n = v.trim().parse::<i64>().map_err(|_| format!("expected integer after '>' in {:?}", part))?;
        return Ok(Term::Gt(check_key(k)?, n));
    }
    if let Some((k, v)) = part.split_once('<') {
        let n = v.trim().parse::<i64>().map_err(|_| format!("expected integer after '<' in {:?}", part))?;
        return Ok(Term::Lt(check_key(k)?, n));
    }
    Ok(Term::Exists(check_key(part)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels { pairs.iter().map(|(k, v)| (*k, *v)).collect() }

    #[test]
    fn parses_every_operator() {
        let q = parse_selector("env=prod, tier==web,zone!=a,!legacy,role in (cp, worker),os notin (win),gen>2,gen<9,owner").unwrap();
        assert_eq!(q.terms().len(), 9);
        assert_eq!(q.terms()[0], Term::Equal("env".into(), "prod".into()));
        assert_eq!(q.terms()[1], Term::Equal("tier".into(), "web".into()));
        assert_eq!(q.terms()[2], Term::NotEqual("zone".into(), "a".into()));
        assert_eq!(q.terms()[3], Term::NotExists("legacy".into()));
        assert_eq!(q.terms()[4], Term::In("role".into(), vec!["cp".into(), "worker".into()]));
        assert_eq!(q.terms()[5], Term::NotIn("os".into(), vec!["win".into()]));
        assert_eq!(q.terms()[6], Term::Gt("gen".into(), 2));
        assert_eq!(q.terms()[7], Term::Lt("gen".into(), 9));
        assert_eq!(q.terms()[8], Term::Exists("owner".into()));
    }

    #[test]
    fn prefixed_keys_are_accepted() {
        let q = parse_selector("omni.sidero.dev/cluster=c1").unwrap();
        assert!(q.matches(&labels(&[("omni.sidero.dev/cluster", "c1")])));
    }

    #[test]
    fn empty_selector_matches_all() {
        let q = parse_selector("  ").unwrap();
        assert!(q.is_empty());
        assert!(q.matches(&labels(&[])));
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        for bad in ["env=prod,", "=prod", "env in (a", "env in ()", "a b=c", "gen>x", "env=pr od", "env=(x)", "-bad=1"] {
            let err = parse_selector(bad).unwrap_err();
            assert!(matches!(err, StateError::InvalidQuery { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn terms_evaluate() {
        let l = labels(&[("env", "prod"), ("gen", "5")]);
        assert!(parse_selector("env=prod").unwrap().matches(&l));
        assert!(!parse_selector("env!=prod").unwrap().matches(&l));
        assert!(parse_selector("zone!=a").unwrap().matches(&l));
        assert!(parse_selector("zone notin (a)").unwrap().matches(&l));
        assert!(!parse_selector("zone in (a)").unwrap().matches(&l));
        assert!(parse_selector("gen>4,gen<6").unwrap().matches(&l));
        assert!(!parse_selector("env>4").unwrap().matches(&l));
        assert!(parse_selector("!zone,env").unwrap().matches(&l));
    }

    #[test]
    fn parse_selectors_fails_fast_and_ands() {
        assert!(parse_selectors(&["env=prod", "bad key"]).is_err());
        let qs = parse_selectors(&["env=prod", "gen>3"]).unwrap();
        assert!(matches_all(&qs, &labels(&[("env", "prod"), ("gen", "4")])));
        assert!(!matches_all(&qs, &labels(&[("env", "prod"), ("gen", "1")])));
        assert!(matches_all(&[], &labels(&[])));
    }

    #[test]
    fn display_round_trips_canonical_form() {
        let q = parse_selector("env==prod, role in (a,b)").unwrap();
        assert_eq!(q.to_string(), "env=prod,role in (a, b)");
        assert_eq!(parse_selector(&q.to_string()).unwrap(), q);
    }
}
