use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identity of a user (a browser session that was handed a credential).
///
/// Valid user ids start at 1. The width matches the `SERIAL` columns of the
/// relational schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i32);

/// Backend-assigned identity of a link, used by ownership records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub i32);

impl UserId {
    pub const FIRST: UserId = UserId(1);

    pub fn get(self) -> i32 {
        self.0
    }

    /// Returns `true` for ids that a backend could have minted.
    pub fn is_valid(self) -> bool {
        self.0 >= 1
    }

    /// The id after this one, or `None` once the id space is used up.
    pub fn next(self) -> Option<UserId> {
        self.0.checked_add(1).map(UserId)
    }
}

impl LinkId {
    pub fn get(self) -> i32 {
        self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for UserId {
    fn from(value: i32) -> Self {
        UserId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_stops_at_the_last_id() {
        assert_eq!(UserId::FIRST.next(), Some(UserId(2)));
        assert_eq!(UserId(i32::MAX).next(), None);
    }

    #[test]
    fn only_positive_ids_are_valid() {
        assert!(UserId::FIRST.is_valid());
        assert!(!UserId(0).is_valid());
        assert!(!UserId(-3).is_valid());
    }
}
