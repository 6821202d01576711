//! The set of rooms a manager keeps its channel joined to.

use std::collections::BTreeSet;
use std::fmt;

/// Immutable set of topic identifiers.
///
/// Compared by value: order and duplicates in the source list are irrelevant,
/// size is not. Changing topics means creating a new manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TopicSet(BTreeSet<String>);

impl TopicSet {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(topics.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.0.contains(topic)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether a membership list reported by the peer is exactly this set.
    ///
    /// The report is deduplicated first, so the size check compares distinct
    /// topics: `["judging", "field", "field"]` matches `{field, judging}`.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, reported: &[S]) -> bool {
        let reported: BTreeSet<&str> = reported.iter().map(AsRef::as_ref).collect();
        reported.len() == self.0.len() && reported.iter().all(|topic| self.0.contains(*topic))
    }

    /// The topics as a list, in a stable order, for wire requests.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TopicSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for TopicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, topic) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{topic}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_order() {
        let a = TopicSet::new(["field", "pit-admin"]);
        let b = TopicSet::new(["pit-admin", "field"]);

        assert_eq!(a, b);
        assert!(a.matches(&["pit-admin", "field"]));
    }

    #[test]
    fn size_sensitive() {
        let both = TopicSet::new(["field", "pit-admin"]);
        let field = TopicSet::new(["field"]);

        assert_ne!(both, field);
        assert!(!both.matches(&["field"]));
        assert!(!field.matches(&["field", "pit-admin"]));
    }

    #[test]
    fn reported_duplicates_do_not_pad_size() {
        let topics = TopicSet::new(["field", "judging"]);

        assert!(!topics.matches(&["field", "field"]));
        assert!(topics.matches(&["judging", "field", "field"]));
    }

    #[test]
    fn membership_and_display() {
        let topics: TopicSet = ["judging", "field"].into_iter().collect();

        assert!(topics.contains("field"));
        assert!(!topics.contains("pit-admin"));
        assert_eq!(topics.len(), 2);
        assert_eq!(topics.to_string(), "[field, judging]");
        assert_eq!(topics.to_vec(), vec!["field".to_owned(), "judging".to_owned()]);
    }

    #[test]
    fn empty_set_matches_empty_report() {
        let topics = TopicSet::default();

        assert!(topics.is_empty());
        assert!(topics.matches::<&str>(&[]));
        assert!(!topics.matches(&["field"]));
    }
}
