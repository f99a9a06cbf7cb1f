//! Inventory filter expressions.
//!
//! A [`Query`] is a conjunction of `field:pattern` terms rendered as
//! `name:qa-centos-pool* AND environment:_default`. Patterns may contain `*`
//! wildcards matching any run of characters; everything else matches
//! literally.

use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;
use crate::record::MachineRecord;

/// Separator between conjunctive terms.
const AND: &str = " AND ";

/// Indexed machine fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Environment,
    /// Matches when any run-list entry matches.
    RunList,
    /// Matches against `1` or `0`.
    InUse,
    Address,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Environment => "environment",
            Self::RunList => "run_list",
            Self::InUse => "in_use",
            Self::Address => "address",
        }
    }
}

impl FromStr for Field {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "environment" => Ok(Self::Environment),
            "run_list" => Ok(Self::RunList),
            "in_use" => Ok(Self::InUse),
            "address" => Ok(Self::Address),
            other => Err(ModelError::UnknownField(other.to_string())),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value pattern with `*` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(String);

impl Pattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wildcard match over the whole value.
    pub fn matches(&self, value: &str) -> bool {
        let pattern: Vec<char> = self.0.chars().collect();
        let value: Vec<char> = value.chars().collect();

        let (mut p, mut v) = (0, 0);
        // Position of the last `*` seen and the value index it was tried at.
        let mut backtrack: Option<(usize, usize)> = None;

        while v < value.len() {
            if p < pattern.len() && pattern[p] == '*' {
                backtrack = Some((p, v));
                p += 1;
            } else if p < pattern.len() && pattern[p] == value[v] {
                p += 1;
                v += 1;
            } else if let Some((star, tried)) = backtrack {
                p = star + 1;
                v = tried + 1;
                backtrack = Some((star, tried + 1));
            } else {
                return false;
            }
        }

        pattern[p..].iter().all(|c| *c == '*')
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single `field:pattern` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub field: Field,
    pub pattern: Pattern,
}

impl Term {
    pub fn matches(&self, record: &MachineRecord) -> bool {
        match self.field {
            Field::Name => self.pattern.matches(&record.name),
            Field::Environment => self.pattern.matches(&record.environment),
            Field::RunList => record.run_list.iter().any(|r| self.pattern.matches(r)),
            Field::InUse => self
                .pattern
                .matches(if record.in_use { "1" } else { "0" }),
            Field::Address => self.pattern.matches(&record.address),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.pattern)
    }
}

/// Conjunctive filter over machine records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    terms: Vec<Term>,
}

impl Query {
    pub fn new(field: Field, pattern: impl Into<String>) -> Self {
        Self {
            terms: vec![Term {
                field,
                pattern: Pattern::new(pattern),
            }],
        }
    }

    /// Machines in the pool for an OS tag.
    pub fn pool(os: &str) -> Self {
        Self::new(Field::Name, crate::pool_name_pattern(os))
    }

    /// Machines that are members of an environment.
    pub fn environment(environment: &str) -> Self {
        Self::new(Field::Environment, environment)
    }

    pub fn and(mut self, field: Field, pattern: impl Into<String>) -> Self {
        self.terms.push(Term {
            field,
            pattern: Pattern::new(pattern),
        });
        self
    }

    pub fn and_run_list(self, pattern: impl Into<String>) -> Self {
        self.and(Field::RunList, pattern)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn matches(&self, record: &MachineRecord) -> bool {
        self.terms.iter().all(|term| term.matches(record))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(AND)?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

impl FromStr for Query {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ModelError::EmptyQuery);
        }

        let terms = s
            .split(AND)
            .map(|raw| {
                let raw = raw.trim();
                let (field, pattern) = raw
                    .split_once(':')
                    .filter(|(field, pattern)| !field.is_empty() && !pattern.is_empty())
                    .ok_or_else(|| ModelError::InvalidTerm(raw.to_string()))?;
                Ok(Term {
                    field: field.parse()?,
                    pattern: Pattern::new(pattern),
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        Ok(Self { terms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_ENVIRONMENT, NETWORK_INTERFACES_ROLE};
    use rstest::rstest;

    #[rstest]
    #[case("qa-centos-pool*", "qa-centos-pool12", true)]
    #[case("qa-centos-pool*", "qa-precise-pool1", false)]
    #[case("*centos*", "qa-centos-pool1", true)]
    #[case("*openldap*", "role[qa-openldap-centos]", true)]
    #[case("exact", "exact", true)]
    #[case("exact", "exactly", false)]
    #[case("a*b*c", "aXXbYYc", true)]
    #[case("a*b*c", "aXXbYY", false)]
    #[case("*", "", true)]
    #[case("", "", true)]
    #[case("", "x", false)]
    fn test_pattern_matching(#[case] pattern: &str, #[case] value: &str, #[case] expected: bool) {
        assert_eq!(Pattern::new(pattern).matches(value), expected);
    }

    #[test]
    fn test_query_display_and_parse() {
        let query = Query::environment("envA").and_run_list("*qa-openldap*");
        let rendered = query.to_string();
        assert_eq!(rendered, "environment:envA AND run_list:*qa-openldap*");
        assert_eq!(rendered.parse::<Query>().unwrap(), query);
    }

    #[test]
    fn test_pool_query() {
        assert_eq!(Query::pool("centos").to_string(), "name:qa-centos-pool*");
    }

    #[test]
    fn test_parse_rejects_bad_terms() {
        assert_eq!("".parse::<Query>(), Err(ModelError::EmptyQuery));
        assert!(matches!(
            "name".parse::<Query>(),
            Err(ModelError::InvalidTerm(_))
        ));
        assert!(matches!(
            "color:red".parse::<Query>(),
            Err(ModelError::UnknownField(_))
        ));
    }

    #[test]
    fn test_query_matches_record() {
        let record = MachineRecord::new("qa-centos-pool3", "10.0.0.3")
            .with_run_list([NETWORK_INTERFACES_ROLE]);

        assert!(Query::pool("centos").matches(&record));
        assert!(Query::pool("centos")
            .and(Field::Environment, DEFAULT_ENVIRONMENT)
            .and(Field::InUse, "0")
            .matches(&record));
        assert!(!Query::pool("centos")
            .and_run_list("role[qa-base]")
            .matches(&record));
    }
}
