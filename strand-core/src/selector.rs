//! Safe selector paths
//!
//! Selectors that cross a marshaled boundary (a remote bridge, a config
//! file) must not be arbitrary code. A [`SelectorPath`] is the restricted
//! surface: attribute/index traversal rooted at the state tree, parsed
//! from a string such as `"counter.value"` or `"jobs[0].id"`. The first
//! segment names the slice; the rest traverse its serde-serialized view,
//! so a path only works against slices registered with a snapshot codec.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use strand_types::SliceName;

use crate::error::SelectorError;

/// One traversal step after the slice segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, ".{name}"),
            PathStep::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Parsed attribute/index traversal rooted at one slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorPath {
    slice: SliceName,
    steps: Vec<PathStep>,
}

impl SelectorPath {
    /// Parse a path such as `"counter.value"` or `"jobs[0].id"`
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        if input.trim().is_empty() {
            return Err(SelectorError::Empty);
        }

        let mut segments = Vec::new();
        // Split "a.b[2].c" into "a", "b[2]", "c" then expand indexes
        for raw in input.split('.') {
            if raw.is_empty() {
                return Err(SelectorError::BadSegment(input.to_string()));
            }
            segments.push(raw);
        }

        let (slice_name, mut steps) = Self::parse_segment(segments[0])?;
        for raw in &segments[1..] {
            let (field, indexes) = Self::parse_segment(raw)?;
            steps.push(PathStep::Field(field));
            steps.extend(indexes);
        }

        Ok(Self {
            slice: SliceName::new(slice_name),
            steps,
        })
    }

    /// Split `"name[1][2]"` into the bare name and its index steps
    fn parse_segment(raw: &str) -> Result<(String, Vec<PathStep>), SelectorError> {
        let bad = || SelectorError::BadSegment(raw.to_string());

        let (name, rest) = match raw.find('[') {
            None => (raw, ""),
            Some(pos) => raw.split_at(pos),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(bad());
        }

        let mut steps = Vec::new();
        let mut rest = rest;
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(bad)?;
            let digits = &rest[1..close];
            let index: usize = digits.parse().map_err(|_| bad())?;
            steps.push(PathStep::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(bad());
            }
        }

        Ok((name.to_string(), steps))
    }

    pub fn slice(&self) -> &SliceName {
        &self.slice
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.steps
    }

    /// Walk the serialized slice view with this path's steps
    pub fn resolve(&self, root: &Value) -> Result<Value, SelectorError> {
        let mut current = root;
        for step in &self.steps {
            current = match step {
                PathStep::Field(name) => current.get(name.as_str()),
                PathStep::Index(i) => current.get(*i),
            }
            .ok_or_else(|| SelectorError::Unresolved(step.to_string()))?;
        }
        Ok(current.clone())
    }
}

impl FromStr for SelectorPath {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SelectorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slice)?;
        for step in &self.steps {
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

/// Typed selector helpers for in-process subscriptions
///
/// These compose plain closures over the tree, so subscribers get typed
/// values without writing raw tree traversals by hand.
pub mod select {
    use std::any::Any;

    use strand_types::SliceName;

    use crate::state::StateTree;

    /// Selector over one typed slice
    pub fn slice<T>(
        name: impl Into<SliceName>,
    ) -> impl Fn(&StateTree) -> Option<T> + Send + 'static
    where
        T: Any + Clone,
    {
        let name = name.into();
        move |tree: &StateTree| tree.slice::<T>(&name).cloned()
    }

    /// Derive a selector by mapping another selector's value
    pub fn map<T, U, S, F>(selector: S, f: F) -> impl Fn(&StateTree) -> Option<U> + Send + 'static
    where
        S: Fn(&StateTree) -> Option<T> + Send + 'static,
        F: Fn(T) -> U + Send + 'static,
    {
        move |tree: &StateTree| selector(tree).map(&f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_field_path() {
        let path = SelectorPath::parse("counter.value").unwrap();
        assert_eq!(path.slice().as_str(), "counter");
        assert_eq!(path.steps(), &[PathStep::Field("value".to_string())]);
    }

    #[test]
    fn test_parse_index_path() {
        let path = SelectorPath::parse("jobs[0].id").unwrap();
        assert_eq!(path.slice().as_str(), "jobs");
        assert_eq!(
            path.steps(),
            &[PathStep::Index(0), PathStep::Field("id".to_string())]
        );
    }

    #[test]
    fn test_parse_bare_slice() {
        let path = SelectorPath::parse("counter").unwrap();
        assert_eq!(path.slice().as_str(), "counter");
        assert!(path.steps().is_empty());
    }

    #[test]
    fn test_parse_nested_indexes() {
        let path = SelectorPath::parse("grid.rows[1][2]").unwrap();
        assert_eq!(
            path.steps(),
            &[
                PathStep::Field("rows".to_string()),
                PathStep::Index(1),
                PathStep::Index(2)
            ]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SelectorPath::parse(""),
            Err(SelectorError::Empty)
        ));
        assert!(SelectorPath::parse("a..b").is_err());
        assert!(SelectorPath::parse("a[b]").is_err());
        assert!(SelectorPath::parse("a[1").is_err());
        assert!(SelectorPath::parse("a(1)").is_err());
    }

    #[test]
    fn test_resolve() {
        let path = SelectorPath::parse("jobs.pending[1].id").unwrap();
        let root = json!({ "pending": [{ "id": 1 }, { "id": 7 }] });
        assert_eq!(path.resolve(&root).unwrap(), json!(7));
    }

    #[test]
    fn test_resolve_missing_step() {
        let path = SelectorPath::parse("counter.missing").unwrap();
        let root = json!({ "value": 3 });
        assert!(matches!(
            path.resolve(&root),
            Err(SelectorError::Unresolved(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["counter.value", "jobs[0].id", "grid.rows[1][2]"] {
            let path = SelectorPath::parse(input).unwrap();
            assert_eq!(path.to_string(), input);
        }
    }

    #[test]
    fn test_typed_slice_selector() {
        use crate::state::{SliceState, StateTree};
        use std::collections::BTreeMap;
        use std::sync::Arc;

        #[derive(Debug, Clone, PartialEq)]
        struct Counter {
            value: i64,
        }

        let mut slices: BTreeMap<SliceName, Arc<dyn SliceState>> = BTreeMap::new();
        slices.insert(SliceName::new("counter"), Arc::new(Counter { value: 9 }));
        let tree = StateTree::from_slices(slices);

        let whole = select::slice::<Counter>("counter");
        assert_eq!(whole(&tree), Some(Counter { value: 9 }));

        let value = select::map(select::slice::<Counter>("counter"), |c| c.value);
        assert_eq!(value(&tree), Some(9));
        assert_eq!(value(&StateTree::empty()), None);
    }
}
