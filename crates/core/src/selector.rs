//! Label selectors in the Kubernetes grammar: `a=b,c!=d,e in (x,y),f notin (z),g,!h`.

use std::fmt;
use std::str::FromStr;

use crate::Record;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty requirement at position {0}")]
    EmptyRequirement(usize),
    #[error("invalid label key: {0:?}")]
    InvalidKey(String),
    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),
    #[error("unknown set operator {0:?} (expect in/notin)")]
    UnknownOperator(String),
    #[error("set requirement for {0:?} needs at least one value")]
    EmptySet(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _)
            | Requirement::Exists(k)
            | Requirement::DoesNotExist(k) => k,
        }
    }

    /// Negative operators match records that lack the label entirely.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self {
            Requirement::Equals(_, want) => value == Some(want.as_str()),
            Requirement::NotEquals(_, want) => value != Some(want.as_str()),
            Requirement::In(_, set) => value.map(|v| set.iter().any(|s| s == v)).unwrap_or(false),
            Requirement::NotIn(_, set) => value.map(|v| !set.iter().any(|s| s == v)).unwrap_or(true),
            Requirement::Exists(_) => value.is_some(),
            Requirement::DoesNotExist(_) => value.is_none(),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_everything(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.reqs
    }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::everything());
        }
        let mut reqs = Vec::new();
        for (pos, raw) in split_top_level(s)?.into_iter().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(SelectorError::EmptyRequirement(pos));
            }
            reqs.push(parse_requirement(raw)?);
        }
        Ok(Self { reqs })
    }

    pub fn matches<K: Record>(&self, obj: &K) -> bool {
        self.reqs.iter().all(|r| r.matches(obj.label(r.key())))
    }

    /// Match against a plain label lookup, for callers without a [`Record`].
    pub fn matches_labels<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        self.reqs.iter().all(|r| r.matches(lookup(r.key())))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.reqs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

fn split_top_level(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Unbalanced(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn valid_key(k: &str) -> Result<String, SelectorError> {
    let ok = !k.is_empty()
        && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if ok { Ok(k.to_string()) } else { Err(SelectorError::InvalidKey(k.to_string())) }
}

fn parse_requirement(raw: &str) -> Result<Requirement, SelectorError> {
    if let Some(rest) = raw.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(valid_key(rest.trim())?));
    }
    if let Some(open) = raw.find('(') {
        let head: Vec<&str> = raw[..open].split_whitespace().collect();
        let body = raw[open + 1..].trim_end();
        let body = body.strip_suffix(')').ok_or_else(|| SelectorError::Unbalanced(raw.to_string()))?;
        let (key, op) = match head.as_slice() {
            [key, op] => (valid_key(key)?, *op),
            _ => return Err(SelectorError::UnknownOperator(raw[..open].trim().to_string())),
        };
        let values: Vec<String> = body.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
        if values.is_empty() {
            return Err(SelectorError::EmptySet(key));
        }
        return match op {
            "in" => Ok(Requirement::In(key, values)),
            "notin" => Ok(Requirement::NotIn(key, values)),
            other => Err(SelectorError::UnknownOperator(other.to_string())),
        };
    }
    if let Some((k, v)) = raw.split_once("!=") {
        return Ok(Requirement::NotEquals(valid_key(k.trim())?, v.trim().to_string()));
    }
    if let Some((k, v)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
        return Ok(Requirement::Equals(valid_key(k.trim())?, v.trim().to_string()));
    }
    Ok(Requirement::Exists(valid_key(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn check(sel: &str, l: &BTreeMap<String, String>) -> bool {
        Selector::parse(sel).unwrap().matches_labels(|k| l.get(k).map(|s| s.as_str()))
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = Selector::parse("  ").unwrap();
        assert!(s.is_everything());
        assert!(s.matches_labels(|_| None));
    }

    #[test]
    fn equality_and_inequality() {
        let l = labels(&[("tier", "kube-system"), ("app", "dns")]);
        assert!(check("tier=kube-system", &l));
        assert!(check("tier==kube-system,app=dns", &l));
        assert!(!check("tier=frontend", &l));
        assert!(check("tier!=frontend", &l));
        // missing label satisfies !=
        assert!(check("zone!=a", &l));
    }

    #[test]
    fn set_based() {
        let l = labels(&[("env", "prod")]);
        assert!(check("env in (prod, staging)", &l));
        assert!(!check("env notin (prod)", &l));
        assert!(check("tier notin (web)", &l));
        assert!(!check("tier in (web)", &l));
        assert!(check("env,!tier", &l));
        assert!(!check("!env", &l));
    }

    #[test]
    fn display_is_canonical() {
        let s = Selector::parse("a = b , c in (x, y),!d").unwrap();
        assert_eq!(s.to_string(), "a=b,c in (x,y),!d");
        assert_eq!(Selector::parse(&s.to_string()).unwrap(), s);
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(Selector::parse("a=b,,c"), Err(SelectorError::EmptyRequirement(1))));
        assert!(matches!(Selector::parse("a in (x"), Err(SelectorError::Unbalanced(_))));
        assert!(matches!(Selector::parse("a within (x)"), Err(SelectorError::UnknownOperator(_))));
        assert!(matches!(Selector::parse("a in ()"), Err(SelectorError::EmptySet(_))));
        assert!(matches!(Selector::parse("bad key"), Err(SelectorError::InvalidKey(_))));
    }
}
