//! Seeds: pre-recorded concrete inputs used to bias early exploration.

use crate::solver::Assignment;
use crate::testcase::{TestCase, TestObject};
use std::collections::HashSet;
use std::rc::Rc;

/// One seed attached to one state: the originating test case plus the
/// working assignment derived from it (patched as constraints accrue).
#[derive(Debug, Clone)]
pub struct SeedInfo {
    pub seed: Rc<TestCase>,
    pub assignment: Assignment,
    next_input: usize,
    used: HashSet<usize>,
}

impl SeedInfo {
    pub fn new(seed: Rc<TestCase>) -> Self {
        Self {
            seed,
            assignment: Assignment::new(),
            next_input: 0,
            used: HashSet::new(),
        }
    }

    /// The seed object to bind for the next `make_symbolic`. Positional by
    /// default; with `named_matching`, found by name anywhere in the seed.
    pub fn next_input(&mut self, name: &str, named_matching: bool) -> Option<&TestObject> {
        if named_matching {
            let index = self
                .seed
                .objects
                .iter()
                .enumerate()
                .find(|(i, o)| o.name == name && !self.used.contains(i))
                .map(|(i, _)| i)?;
            self.used.insert(index);
            Some(&self.seed.objects[index])
        } else {
            let index = self.next_input;
            if index >= self.seed.objects.len() {
                return None;
            }
            self.next_input += 1;
            self.used.insert(index);
            Some(&self.seed.objects[index])
        }
    }

    /// Whether the whole seed input has been consumed.
    pub fn fully_consumed(&self) -> bool {
        self.next_input >= self.seed.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_with(names: &[&str]) -> SeedInfo {
        let seed = TestCase {
            objects: names
                .iter()
                .map(|name| TestObject {
                    name: (*name).to_string(),
                    bytes: vec![1, 2, 3, 4],
                })
                .collect(),
            ..TestCase::default()
        };
        SeedInfo::new(Rc::new(seed))
    }

    #[test]
    fn positional_matching_consumes_in_order() {
        let mut info = seed_with(&["a", "b"]);
        assert_eq!(info.next_input("whatever", false).unwrap().name, "a");
        assert_eq!(info.next_input("whatever", false).unwrap().name, "b");
        assert!(info.next_input("whatever", false).is_none());
        assert!(info.fully_consumed());
    }

    #[test]
    fn named_matching_finds_by_name() {
        let mut info = seed_with(&["a", "b"]);
        assert_eq!(info.next_input("b", true).unwrap().name, "b");
        assert_eq!(info.next_input("a", true).unwrap().name, "a");
        assert!(info.next_input("a", true).is_none());
    }
}
