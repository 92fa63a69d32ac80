//! Immutable member id to principal snapshots.

use std::collections::HashMap;

use crate::principal::Principal;

/// Maps SharePoint member ids to principals for one site collection.
///
/// Snapshots are never mutated; a refresh builds a new one and swaps it in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberIdMapping {
    members: HashMap<i32, Principal>,
}

impl MemberIdMapping {
    pub fn new(members: HashMap<i32, Principal>) -> Self {
        Self { members }
    }

    pub fn get(&self, id: i32) -> Option<&Principal> {
        self.members.get(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<(i32, Principal)> for MemberIdMapping {
    fn from_iter<I: IntoIterator<Item = (i32, Principal)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}
